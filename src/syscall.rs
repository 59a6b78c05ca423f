//! System-call dispatch and handlers.
//!
//! The executor traps on the guest's software-interrupt instruction and
//! calls [`dispatch`] with the current context. The call number is taken
//! from `eax` and routed through the closed [`Syscall`] set; each handler
//! decodes its register-passed arguments, marshals guest structures through
//! [`kernel_abi`], and either forwards to the host or mutates emulator
//! state. A handler that would block suspends the context instead and lets
//! the event loop retry the whole call once the wake condition holds.
//!
//! Return conventions: non-negative results are passed to the guest as-is;
//! `-4095..=-1` encodes a guest errno; unsupported inputs abort the
//! emulator with a diagnostic (never a silent approximation).

use crate::context::{ContextSharedPtr, TlsSegment, Wakeup, ITIMER_COUNT};
use crate::emu::{poll_host_fd, Emu};
use crate::fd_table::{FdKind, FdTableSharedPtr};
use crate::kernel_abi::{
    self, dirent_reclen, CloneFlags, GuestItimerval, GuestRlimit, GuestRusage, GuestTimeval,
    GuestTms, GuestUserDesc, GuestUtimbuf, GuestUtsname, MapFlags, ProtFlags, ACCESS_MODE_MAP,
    CLONE_FLAGS_MAP, FCNTL_CMD_MAP, ITIMER_WHICH_MAP, MMAP_FLAGS_MAP, MMAP_PROT_MAP,
    MSYNC_FLAGS_MAP, OPEN_FLAGS_MAP, POLLIN, POLLOUT, RLIMIT_RESOURCE_MAP, SOCKETCALL_CALL_MAP,
    SOCKET_FAMILY_MAP, SOCKET_TYPE_MAP, WAITPID_OPTIONS_MAP, WNOHANG,
};
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::memory::{page_round_up, MemorySharedPtr, Access, MEM_PAGE_MASK, MEM_PAGE_SIZE, MEM_PAGE_SHIFT};
use crate::registers::Registers;
use crate::signal::signal_name;
use libc::pid_t;
use std::convert::TryInto;
use std::ffi::CString;
use std::rc::Rc;

/// Size of the Linux 2.6 x86 syscall table; numbers at or above this are a
/// guest-library mismatch, not merely an unimplemented call.
pub const SYSCALL_COUNT: u32 = 326;

/// Longest path accepted from guest memory before marshalling fails loudly.
const MAX_PATH_SIZE: usize = 4096;

/// Fallback base for the downward-growing mmap allocator.
const MMAP_BASE_ADDRESS: u32 = 0xb7fb_0000;

/// The supported call set, by Linux 2.6 x86 ABI number. Keeping this a
/// closed enum makes the dispatch match checkable for completeness.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Syscall {
    Exit = 1,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Waitpid = 7,
    Unlink = 10,
    Execve = 11,
    Time = 13,
    Chmod = 15,
    Lseek = 19,
    Getpid = 20,
    Utime = 30,
    Access = 33,
    Kill = 37,
    Rename = 38,
    Mkdir = 39,
    Dup = 41,
    Pipe = 42,
    Times = 43,
    Brk = 45,
    Ioctl = 54,
    Getppid = 64,
    Setrlimit = 75,
    Getrusage = 77,
    Gettimeofday = 78,
    Readlink = 85,
    Mmap = 90,
    Munmap = 91,
    Fchmod = 94,
    Socketcall = 102,
    Setitimer = 104,
    Getitimer = 105,
    Sigreturn = 119,
    Clone = 120,
    Newuname = 122,
    Mprotect = 125,
    Llseek = 140,
    Getdents = 141,
    Select = 142,
    Msync = 144,
    Nanosleep = 162,
    Mremap = 163,
    Poll = 168,
    Getrlimit = 191,
    Mmap2 = 192,
    Fcntl64 = 221,
    SetThreadArea = 243,
}

impl Syscall {
    pub fn from_number(number: u32) -> Option<Syscall> {
        use Syscall::*;
        Some(match number {
            1 => Exit,
            3 => Read,
            4 => Write,
            5 => Open,
            6 => Close,
            7 => Waitpid,
            10 => Unlink,
            11 => Execve,
            13 => Time,
            15 => Chmod,
            19 => Lseek,
            20 => Getpid,
            30 => Utime,
            33 => Access,
            37 => Kill,
            38 => Rename,
            39 => Mkdir,
            41 => Dup,
            42 => Pipe,
            43 => Times,
            45 => Brk,
            54 => Ioctl,
            64 => Getppid,
            75 => Setrlimit,
            77 => Getrusage,
            78 => Gettimeofday,
            85 => Readlink,
            90 => Mmap,
            91 => Munmap,
            94 => Fchmod,
            102 => Socketcall,
            104 => Setitimer,
            105 => Getitimer,
            119 => Sigreturn,
            120 => Clone,
            122 => Newuname,
            125 => Mprotect,
            140 => Llseek,
            141 => Getdents,
            142 => Select,
            144 => Msync,
            162 => Nanosleep,
            163 => Mremap,
            168 => Poll,
            191 => Getrlimit,
            192 => Mmap2,
            221 => Fcntl64,
            243 => SetThreadArea,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use Syscall::*;
        match self {
            Exit => "exit",
            Read => "read",
            Write => "write",
            Open => "open",
            Close => "close",
            Waitpid => "waitpid",
            Unlink => "unlink",
            Execve => "execve",
            Time => "time",
            Chmod => "chmod",
            Lseek => "lseek",
            Getpid => "getpid",
            Utime => "utime",
            Access => "access",
            Kill => "kill",
            Rename => "rename",
            Mkdir => "mkdir",
            Dup => "dup",
            Pipe => "pipe",
            Times => "times",
            Brk => "brk",
            Ioctl => "ioctl",
            Getppid => "getppid",
            Setrlimit => "setrlimit",
            Getrusage => "getrusage",
            Gettimeofday => "gettimeofday",
            Readlink => "readlink",
            Mmap => "mmap",
            Munmap => "munmap",
            Fchmod => "fchmod",
            Socketcall => "socketcall",
            Setitimer => "setitimer",
            Getitimer => "getitimer",
            Sigreturn => "sigreturn",
            Clone => "clone",
            Newuname => "newuname",
            Mprotect => "mprotect",
            Llseek => "llseek",
            Getdents => "getdents",
            Select => "select",
            Msync => "msync",
            Nanosleep => "nanosleep",
            Mremap => "mremap",
            Poll => "poll",
            Getrlimit => "getrlimit",
            Mmap2 => "mmap2",
            Fcntl64 => "fcntl64",
            SetThreadArea => "set_thread_area",
        }
    }
}

/// Entry point from the executor (and from the event loop when it retries a
/// call after a wake). The result lands in `eax` unless the handler
/// suspended or finished the context, in which case the registers are left
/// for the event loop to fill in later.
pub fn dispatch(emu: &mut Emu, pid: pid_t) {
    let ctx = match emu.context(pid) {
        Some(ctx) => ctx,
        None => fatal!("syscall dispatch for unknown context {}", pid),
    };
    let number = ctx.borrow().regs.syscallno();
    if number == 0 || number >= SYSCALL_COUNT {
        fatal!(
            "syscall code {} out of range in context {}; the guest C library \
             does not match the emulated syscall table",
            number,
            pid
        );
    }
    let call = match Syscall::from_number(number) {
        Some(call) => call,
        None => fatal!("syscall with code {} not implemented", number),
    };
    log!(
        LogDebug,
        "syscall '{}' (code {}), context {}",
        call.name(),
        number,
        pid
    );

    let ret = run_handler(emu, &ctx, call);

    let mut c = ctx.borrow_mut();
    match c.state {
        crate::context::RunState::Running => {
            if (-4095..0).contains(&ret) {
                log!(
                    LogDebug,
                    "  ret={} (errno {})",
                    ret,
                    kernel_abi::ERRNO_MAP.value_str((-ret) as u32)
                );
            } else {
                log!(LogDebug, "  ret={:#x}", ret as u32);
            }
            c.regs.set_syscall_result(ret);
        }
        _ => log!(LogDebug, "  context {} no longer running, return value discarded", pid),
    }
}

fn run_handler(emu: &mut Emu, ctx: &ContextSharedPtr, call: Syscall) -> i32 {
    use Syscall::*;
    match call {
        Exit => sys_exit(emu, ctx),
        Read => sys_read(emu, ctx),
        Write => sys_write(emu, ctx),
        Open => sys_open(emu, ctx),
        Close => sys_close(emu, ctx),
        Waitpid => sys_waitpid(emu, ctx),
        Unlink => sys_unlink(emu, ctx),
        Execve => sys_execve(emu, ctx),
        Time => sys_time(emu, ctx),
        Chmod => sys_chmod(emu, ctx),
        Lseek => sys_lseek(emu, ctx),
        Getpid => sys_getpid(emu, ctx),
        Utime => sys_utime(emu, ctx),
        Access => sys_access(emu, ctx),
        Kill => sys_kill(emu, ctx),
        Rename => sys_rename(emu, ctx),
        Mkdir => sys_mkdir(emu, ctx),
        Dup => sys_dup(emu, ctx),
        Pipe => sys_pipe(emu, ctx),
        Times => sys_times(emu, ctx),
        Brk => sys_brk(emu, ctx),
        Ioctl => sys_ioctl(emu, ctx),
        Getppid => sys_getppid(emu, ctx),
        Setrlimit => sys_setrlimit(emu, ctx),
        Getrusage => sys_getrusage(emu, ctx),
        Gettimeofday => sys_gettimeofday(emu, ctx),
        Readlink => sys_readlink(emu, ctx),
        Mmap => sys_mmap(emu, ctx),
        Munmap => sys_munmap(emu, ctx),
        Fchmod => sys_fchmod(emu, ctx),
        Socketcall => sys_socketcall(emu, ctx),
        Setitimer => sys_setitimer(emu, ctx),
        Getitimer => sys_getitimer(emu, ctx),
        Sigreturn => sys_sigreturn(emu, ctx),
        Clone => sys_clone(emu, ctx),
        Newuname => sys_newuname(emu, ctx),
        Mprotect => sys_mprotect(emu, ctx),
        Llseek => sys_llseek(emu, ctx),
        Getdents => sys_getdents(emu, ctx),
        Select => sys_select(emu, ctx),
        Msync => sys_msync(emu, ctx),
        Nanosleep => sys_nanosleep(emu, ctx),
        Mremap => sys_mremap(emu, ctx),
        Poll => sys_poll(emu, ctx),
        Getrlimit => sys_getrlimit(emu, ctx),
        Mmap2 => sys_mmap2(emu, ctx),
        Fcntl64 => sys_fcntl64(emu, ctx),
        SetThreadArea => sys_set_thread_area(emu, ctx),
    }
}

/*
 * Shared helpers.
 */

fn regs(ctx: &ContextSharedPtr) -> Registers {
    ctx.borrow().regs
}

fn mem(ctx: &ContextSharedPtr) -> MemorySharedPtr {
    Rc::clone(&ctx.borrow().mem)
}

fn fds(ctx: &ContextSharedPtr) -> FdTableSharedPtr {
    Rc::clone(&ctx.borrow().fds)
}

/// Last host errno, translated to the guest encoding and negated.
fn host_errno() -> i32 {
    let err = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL);
    -kernel_abi::guest_errno_from_host(err)
}

fn read_guest_path(ctx: &ContextSharedPtr, addr: u32) -> String {
    match mem(ctx).borrow_mut().read_string(addr, MAX_PATH_SIZE) {
        Some(path) => path,
        None => fatal!("path at {:#010x} exceeds the maximum length", addr),
    }
}

fn cpath(path: &str) -> CString {
    CString::new(path).unwrap_or_else(|_| fatal!("guest path contains an interior NUL"))
}

/*
 * System call 'exit' (code 1)
 */

fn sys_exit(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let status = regs(ctx).arg1() as i32;
    log!(LogDebug, "  status={:#x}", status);
    let pid = ctx.borrow().pid;
    emu.finish_context(pid, status);
    0
}

/*
 * System call 'read' (code 3)
 */

fn sys_read(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let buf_ptr = r.arg2();
    let count = r.arg3() as usize;
    log!(
        LogDebug,
        "  guest_fd={}, buf_ptr={:#x}, count={:#x}",
        guest_fd,
        buf_ptr,
        count
    );

    let (host_fd, flags) = match fds(ctx).borrow().entry_get(guest_fd) {
        Some(entry) => (entry.host_fd, entry.flags),
        None => return -kernel_abi::EBADF,
    };
    log!(LogDebug, "  host_fd={}", host_fd);

    // Zero-timeout poll decides between the synchronous fast path and
    // suspension; O_NONBLOCK descriptors never suspend.
    if poll_host_fd(host_fd, POLLIN) != 0 || flags & kernel_abi::O_NONBLOCK != 0 {
        let mut buf = vec![0u8; count];
        let n = unsafe { libc::read(host_fd, buf.as_mut_ptr() as *mut libc::c_void, count) };
        if n == -1 {
            return host_errno();
        }
        if n > 0 {
            mem(ctx).borrow_mut().write(buf_ptr, &buf[..n as usize]);
        }
        return n as i32;
    }

    log!(LogDebug, "  blocking read, context suspended");
    ctx.borrow_mut().suspend(Wakeup::Read {
        fd: guest_fd,
        events: POLLIN,
    });
    emu.schedule_events();
    0
}

/*
 * System call 'write' (code 4)
 */

fn sys_write(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let buf_ptr = r.arg2();
    let count = r.arg3() as usize;
    log!(
        LogDebug,
        "  guest_fd={}, buf_ptr={:#x}, count={:#x}",
        guest_fd,
        buf_ptr,
        count
    );

    let host_fd = match fds(ctx).borrow().entry_get(guest_fd) {
        Some(entry) => entry.host_fd,
        None => return -kernel_abi::EBADF,
    };
    log!(LogDebug, "  host_fd={}", host_fd);

    let mut buf = vec![0u8; count];
    mem(ctx).borrow_mut().read(buf_ptr, &mut buf);

    if poll_host_fd(host_fd, POLLOUT) != 0 {
        let n = unsafe { libc::write(host_fd, buf.as_ptr() as *const libc::c_void, count) };
        if n == -1 {
            return host_errno();
        }
        return n as i32;
    }

    log!(LogDebug, "  blocking write, context suspended");
    ctx.borrow_mut().suspend(Wakeup::Write { fd: guest_fd });
    emu.schedule_events();
    0
}

/*
 * System call 'open' (code 5)
 */

fn sys_open(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let file_name = read_guest_path(ctx, r.arg1());
    let flags = r.arg2() as i32;
    let mode = r.arg3();
    let full_path = emu.full_path(&file_name);
    log!(
        LogDebug,
        "  filename='{}' flags={:#x}, mode={:#x}",
        file_name,
        flags,
        mode
    );
    log!(LogDebug, "  fullpath='{}'", full_path);
    log!(LogDebug, "  flags={}", OPEN_FLAGS_MAP.flags_str(flags as u32));

    if full_path.starts_with("/proc/") {
        if full_path == "/proc/self/maps" {
            // Snapshot the map into a temp host file and hand that out.
            let temp_path = match mem(ctx).borrow().write_proc_self_maps() {
                Ok(path) => path,
                Err(err) => fatal!("cannot generate /proc/self/maps snapshot: {}", err),
            };
            let temp_str = temp_path.to_string_lossy().into_owned();
            let host_fd = unsafe { libc::open(cpath(&temp_str).as_ptr(), flags, mode) };
            if host_fd < 0 {
                fatal!("cannot reopen generated maps file '{}'", temp_str);
            }
            let table = fds(ctx);
            let mut table = table.borrow_mut();
            let entry = table.new_entry(FdKind::Virtual, host_fd, &temp_str, flags);
            log!(
                LogDebug,
                "  host file '{}' opened: guest_fd={}, host_fd={}",
                temp_str,
                entry.guest_fd,
                entry.host_fd
            );
            return entry.guest_fd;
        }
        // Unhandled virtual file: let the guest read the host's version.
        log!(LogWarn, "unhandled virtual file '{}'", full_path);
    }

    let host_fd = unsafe { libc::open(cpath(&full_path).as_ptr(), flags, mode) };
    if host_fd == -1 {
        return host_errno();
    }
    let table = fds(ctx);
    let mut table = table.borrow_mut();
    let entry = table.new_entry(FdKind::Regular, host_fd, &full_path, flags);
    log!(
        LogDebug,
        "  file descriptor opened: guest_fd={}, host_fd={}",
        entry.guest_fd,
        entry.host_fd
    );
    entry.guest_fd
}

/*
 * System call 'close' (code 6)
 */

fn sys_close(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let guest_fd = regs(ctx).arg1() as i32;
    log!(LogDebug, "  guest_fd={}", guest_fd);

    let table = fds(ctx);
    let mut table = table.borrow_mut();
    let host_fd = match table.entry_get(guest_fd) {
        Some(entry) => entry.host_fd,
        None => return -kernel_abi::EBADF,
    };
    log!(LogDebug, "  host_fd={}", host_fd);

    // The host standard streams outlive any guest close.
    if host_fd > 2 {
        unsafe { libc::close(host_fd) };
    }
    table.entry_free(guest_fd);
    0
}

/*
 * System call 'waitpid' (code 7)
 */

fn sys_waitpid(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let pid_filter = r.arg1() as i32;
    let status_ptr = r.arg2();
    let options = r.arg3();
    log!(
        LogDebug,
        "  pid={}, pstatus={:#x}, options={}",
        pid_filter,
        status_ptr,
        WAITPID_OPTIONS_MAP.flags_str(options)
    );

    if pid_filter != -1 && pid_filter <= 0 {
        fatal!("waitpid only supported for pid -1 or a positive pid");
    }

    let me = ctx.borrow().pid;
    if let Some(child) = emu.find_zombie(me, pid_filter) {
        let (child_pid, exit_code) = {
            let c = child.borrow();
            (c.pid, c.exit_code().unwrap())
        };
        if status_ptr != 0 {
            mem(ctx).borrow_mut().write_u32(status_ptr, exit_code as u32);
        }
        emu.reap(child_pid);
        return child_pid;
    }

    if options & WNOHANG != 0 {
        return 0;
    }

    ctx.borrow_mut().suspend(Wakeup::WaitPid { pid: pid_filter });
    0
}

/*
 * System call 'unlink' (code 10)
 */

fn sys_unlink(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let file_name = read_guest_path(ctx, regs(ctx).arg1());
    let full_path = emu.full_path(&file_name);
    log!(LogDebug, "  file_name='{}', full_path='{}'", file_name, full_path);

    if unsafe { libc::unlink(cpath(&full_path).as_ptr()) } == -1 {
        return host_errno();
    }
    0
}

/*
 * System call 'execve' (code 11)
 *
 * Only the `/bin/sh -c <command>` trampoline that libc's system() emits is
 * supported: the command runs natively on the host (guest and host ISAs may
 * be incompatible) and the calling context finishes with its exit code.
 */

fn sys_execve(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let name_ptr = r.arg1();
    let argv_ptr = r.arg2();
    let envp_ptr = r.arg3();
    log!(
        LogDebug,
        "  name_ptr={:#x}, argv={:#x}, envp={:#x}",
        name_ptr,
        argv_ptr,
        envp_ptr
    );

    let name = read_guest_path(ctx, name_ptr);
    let full_path = emu.full_path(&name);
    log!(LogDebug, "  name='{}', full_path='{}'", name, full_path);

    let m = mem(ctx);
    let mut argv = Vec::new();
    loop {
        let arg_ptr = m.borrow_mut().read_u32(argv_ptr + 4 * argv.len() as u32);
        if arg_ptr == 0 {
            break;
        }
        let arg = match m.borrow_mut().read_string(arg_ptr, MAX_PATH_SIZE) {
            Some(arg) => arg,
            None => fatal!("execve argument exceeds the maximum length"),
        };
        log!(LogDebug, "  argv[{}]='{}'", argv.len(), arg);
        argv.push(arg);
    }
    for i in 0.. {
        let env_ptr = m.borrow_mut().read_u32(envp_ptr + 4 * i);
        if env_ptr == 0 {
            break;
        }
        if let Some(env) = m.borrow_mut().read_string(env_ptr, MAX_PATH_SIZE) {
            log!(LogDebug, "  envp[{}]='{}'", i, env);
        }
    }

    if full_path == "/bin/sh" && argv.len() == 3 && argv[0] == "sh" && argv[1] == "-c" {
        log!(
            LogWarn,
            "execve of '/bin/sh -c': the command runs natively on the host \
             and the calling context finishes with its exit code"
        );
        let exit_code = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&argv[2])
            .status()
            .ok()
            .and_then(|status| status.code())
            .unwrap_or(-1);
        let pid = ctx.borrow().pid;
        emu.finish_context(pid, exit_code);
        return 0;
    }

    fatal!("execve of '{}' not implemented", full_path);
}

/*
 * System call 'time' (code 13)
 */

fn sys_time(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let time_ptr = regs(ctx).arg1();
    log!(LogDebug, "  ptime={:#x}", time_ptr);

    let t = unsafe { libc::time(std::ptr::null_mut()) };
    if time_ptr != 0 {
        mem(ctx).borrow_mut().write_u32(time_ptr, t as u32);
    }
    t as i32
}

/*
 * System call 'chmod' (code 15)
 */

fn sys_chmod(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let file_name = read_guest_path(ctx, r.arg1());
    let mode = r.arg2();
    let full_path = emu.full_path(&file_name);
    log!(
        LogDebug,
        "  file_name='{}', full_path='{}', mode={:#o}",
        file_name,
        full_path,
        mode
    );

    if unsafe { libc::chmod(cpath(&full_path).as_ptr(), mode as libc::mode_t) } == -1 {
        return host_errno();
    }
    0
}

/*
 * System call 'lseek' (code 19)
 */

fn sys_lseek(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let offset = r.arg2() as i32;
    let origin = r.arg3() as i32;
    let host_fd = match fds(ctx).borrow().host_fd_of(guest_fd) {
        Some(fd) => fd,
        None => return -kernel_abi::EBADF,
    };
    log!(
        LogDebug,
        "  fd={}, offset={:#x}, origin={:#x}, host_fd={}",
        guest_fd,
        offset,
        origin,
        host_fd
    );

    let pos = unsafe { libc::lseek(host_fd, offset as i64, origin) };
    if pos == -1 {
        return host_errno();
    }
    pos as i32
}

/*
 * System call 'getpid' (code 20)
 */

fn sys_getpid(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    ctx.borrow().pid
}

/*
 * System call 'utime' (code 30)
 */

fn sys_utime(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let file_name = read_guest_path(ctx, r.arg1());
    let utimbuf_ptr = r.arg2();
    let full_path = emu.full_path(&file_name);

    let mut buf = [0u8; GuestUtimbuf::SIZE as usize];
    mem(ctx).borrow_mut().read(utimbuf_ptr, &mut buf);
    let guest = GuestUtimbuf::from_bytes(&buf);
    log!(
        LogDebug,
        "  file_name='{}', actime={}, modtime={}",
        file_name,
        guest.actime,
        guest.modtime
    );

    let host = libc::utimbuf {
        actime: i64::from(guest.actime),
        modtime: i64::from(guest.modtime),
    };
    if unsafe { libc::utime(cpath(&full_path).as_ptr(), &host) } == -1 {
        return host_errno();
    }
    0
}

/*
 * System call 'access' (code 33)
 */

fn sys_access(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let file_name = read_guest_path(ctx, r.arg1());
    let mode = r.arg2();
    let full_path = emu.full_path(&file_name);
    log!(
        LogDebug,
        "  file_name='{}', full_path='{}', mode={}",
        file_name,
        full_path,
        ACCESS_MODE_MAP.flags_str(mode)
    );

    if unsafe { libc::access(cpath(&full_path).as_ptr(), mode as i32) } == -1 {
        return host_errno();
    }
    0
}

/*
 * System call 'kill' (code 37)
 */

fn sys_kill(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let target_pid = r.arg1() as i32;
    let sig = r.arg2() as i32;
    log!(
        LogDebug,
        "  pid={}, sig={} ({})",
        target_pid,
        sig,
        signal_name(sig)
    );

    // Program correctness is assumed: a kill to a pid this emulator never
    // created is a guest bug worth halting on, not an error return.
    let target = match emu.context(target_pid) {
        Some(target) => target,
        None => fatal!("kill of invalid pid {}", target_pid),
    };
    target.borrow_mut().signals.pending.add(sig);
    drop(target);

    emu.schedule_events();
    emu.process_events();
    0
}

/*
 * System call 'rename' (code 38)
 */

fn sys_rename(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let old_path = read_guest_path(ctx, r.arg1());
    let new_path = read_guest_path(ctx, r.arg2());
    let old_full = emu.full_path(&old_path);
    let new_full = emu.full_path(&new_path);
    log!(LogDebug, "  old='{}', new='{}'", old_full, new_full);

    if unsafe { libc::rename(cpath(&old_full).as_ptr(), cpath(&new_full).as_ptr()) } == -1 {
        return host_errno();
    }
    0
}

/*
 * System call 'mkdir' (code 39)
 */

fn sys_mkdir(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let path = read_guest_path(ctx, r.arg1());
    let mode = r.arg2();
    let full_path = emu.full_path(&path);
    log!(LogDebug, "  path='{}', mode={:#o}", full_path, mode);

    if unsafe { libc::mkdir(cpath(&full_path).as_ptr(), mode as libc::mode_t) } == -1 {
        return host_errno();
    }
    0
}

/*
 * System call 'dup' (code 41)
 */

fn sys_dup(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let guest_fd = regs(ctx).arg1() as i32;
    log!(LogDebug, "  guest_fd={}", guest_fd);

    let table = fds(ctx);
    let mut table = table.borrow_mut();
    let (host_fd, path, flags) = match table.entry_get(guest_fd) {
        Some(entry) => (entry.host_fd, entry.path.clone(), entry.flags),
        None => return -kernel_abi::EBADF,
    };

    let dup_host_fd = unsafe { libc::dup(host_fd) };
    if dup_host_fd == -1 {
        return host_errno();
    }
    let entry = table.new_entry(FdKind::Regular, dup_host_fd, &path, flags);
    log!(
        LogDebug,
        "  duplicated: guest_fd={}, host_fd={}",
        entry.guest_fd,
        entry.host_fd
    );
    entry.guest_fd
}

/*
 * System call 'pipe' (code 42)
 */

fn sys_pipe(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let fd_ptr = regs(ctx).arg1();
    log!(LogDebug, "  fd_ptr={:#x}", fd_ptr);

    let mut host_fd = [0i32; 2];
    if unsafe { libc::pipe(host_fd.as_mut_ptr()) } == -1 {
        fatal!("cannot create host pipe: {}", std::io::Error::last_os_error());
    }
    log!(LogDebug, "  host pipe created: fd={{{}, {}}}", host_fd[0], host_fd[1]);

    let table = fds(ctx);
    let mut table = table.borrow_mut();
    let read_fd = table
        .new_entry(FdKind::Pipe, host_fd[0], "", kernel_abi::O_RDONLY)
        .guest_fd;
    let write_fd = table
        .new_entry(FdKind::Pipe, host_fd[1], "", kernel_abi::O_WRONLY)
        .guest_fd;
    drop(table);
    log!(LogDebug, "  guest pipe created: fd={{{}, {}}}", read_fd, write_fd);

    let m = mem(ctx);
    m.borrow_mut().write_u32(fd_ptr, read_fd as u32);
    m.borrow_mut().write_u32(fd_ptr + 4, write_fd as u32);
    0
}

/*
 * System call 'times' (code 43)
 */

fn sys_times(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let tms_ptr = regs(ctx).arg1();
    log!(LogDebug, "  tms_ptr={:#x}", tms_ptr);

    let mut host: libc::tms = unsafe { std::mem::zeroed() };
    let ticks = unsafe { libc::times(&mut host) };
    if tms_ptr != 0 {
        mem(ctx)
            .borrow_mut()
            .write(tms_ptr, &GuestTms::from_host(&host).to_bytes());
    }
    ticks as i32
}

/*
 * System call 'brk' (code 45)
 */

fn sys_brk(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let new_break = regs(ctx).arg1();
    let m = mem(ctx);
    let mut mm = m.borrow_mut();
    let old_break = mm.heap_break;
    log!(
        LogDebug,
        "  newbrk={:#x} (previous brk was {:#x})",
        new_break,
        old_break
    );

    // A zero argument queries the current program break.
    if new_break == 0 {
        return old_break as i32;
    }

    let new_aligned = page_round_up(new_break);
    let old_aligned = page_round_up(old_break);

    if new_break > old_break {
        let size = new_aligned - old_aligned;
        if size > 0 && !mm.grow_heap(old_aligned, size) {
            // Some page in the way is already allocated: refuse and keep
            // the old break.
            log!(LogDebug, "  heap break collides with an existing mapping");
            return old_break as i32;
        }
        mm.heap_break = new_break;
        log!(LogDebug, "  heap grows {} bytes", new_break - old_break);
        return new_break as i32;
    }

    if new_break < old_break {
        let size = old_aligned - new_aligned;
        if size > 0 {
            mm.unmap(new_aligned, size);
        }
        mm.heap_break = new_break;
        log!(LogDebug, "  heap shrinks {} bytes", old_break - new_break);
        return new_break as i32;
    }

    old_break as i32
}

/*
 * System call 'ioctl' (code 54)
 *
 * Only the termios command range is serviced. The termios structure is 60
 * bytes on both 32- and 64-bit hosts, so the argument crosses the boundary
 * as an opaque buffer.
 */

fn sys_ioctl(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let cmd = r.arg2();
    let arg = r.arg3();
    log!(LogDebug, "  guest_fd={}, cmd={:#x}, arg={:#x}", guest_fd, cmd, arg);

    let host_fd = match fds(ctx).borrow().host_fd_of(guest_fd) {
        Some(fd) => fd,
        None => return -kernel_abi::EBADF,
    };

    if (0x5401..=0x5408).contains(&cmd) {
        let mut buf = [0u8; 60];
        mem(ctx).borrow_mut().read(arg, &mut buf);
        let err = unsafe {
            libc::ioctl(
                host_fd,
                cmd as libc::c_ulong,
                buf.as_mut_ptr() as *mut libc::c_void,
            )
        };
        if err == -1 {
            return host_errno();
        }
        mem(ctx).borrow_mut().write(arg, &buf);
        return err;
    }

    fatal!("ioctl not implemented for cmd {:#x}", cmd);
}

/*
 * System call 'getppid' (code 64)
 */

fn sys_getppid(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    // Orphans and the root context report init.
    ctx.borrow().parent.unwrap_or(1)
}

/*
 * System call 'setrlimit' (code 75)
 */

fn sys_setrlimit(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let resource = r.arg1();
    let rlim_ptr = r.arg2();
    log!(
        LogDebug,
        "  res={} ({}), rlim_ptr={:#x}",
        resource,
        RLIMIT_RESOURCE_MAP.value_str(resource),
        rlim_ptr
    );

    let mut buf = [0u8; GuestRlimit::SIZE as usize];
    mem(ctx).borrow_mut().read(rlim_ptr, &mut buf);
    let rlimit = GuestRlimit::from_bytes(&buf);
    log!(LogDebug, "  rlim->cur={:#x}, rlim->max={:#x}", rlimit.cur, rlimit.max);

    match resource {
        // RLIMIT_DATA: the emulated data segment has no enforced bound.
        2 => 0,
        // RLIMIT_STACK: stacks come from mmap; the limit is not enforced.
        3 => 0,
        _ => fatal!(
            "setrlimit not implemented for resource {}",
            RLIMIT_RESOURCE_MAP.value_str(resource)
        ),
    }
}

/*
 * System call 'getrusage' (code 77)
 */

fn sys_getrusage(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let who = r.arg1();
    let usage_ptr = r.arg2();
    log!(LogDebug, "  who={:#x}, pru={:#x}", who, usage_ptr);

    if who != 0 {
        fatal!("getrusage not implemented for who != RUSAGE_SELF");
    }

    let mut host: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut host) } == -1 {
        return host_errno();
    }
    mem(ctx)
        .borrow_mut()
        .write(usage_ptr, &GuestRusage::from_host(&host).to_bytes());
    0
}

/*
 * System call 'gettimeofday' (code 78)
 */

fn sys_gettimeofday(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let tv_ptr = r.arg1();
    let tz_ptr = r.arg2();
    log!(LogDebug, "  tv_ptr={:#x}, tz_ptr={:#x}", tv_ptr, tz_ptr);

    #[repr(C)]
    struct HostTimezone {
        minuteswest: i32,
        dsttime: i32,
    }
    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    let mut tz = HostTimezone {
        minuteswest: 0,
        dsttime: 0,
    };
    unsafe {
        libc::gettimeofday(&mut tv, &mut tz as *mut HostTimezone as *mut libc::timezone);
    }

    let m = mem(ctx);
    if tv_ptr != 0 {
        m.borrow_mut().write_u32(tv_ptr, tv.tv_sec as u32);
        m.borrow_mut().write_u32(tv_ptr + 4, tv.tv_usec as u32);
    }
    if tz_ptr != 0 {
        m.borrow_mut().write_u32(tz_ptr, tz.minuteswest as u32);
        m.borrow_mut().write_u32(tz_ptr + 4, tz.dsttime as u32);
    }
    0
}

/*
 * System call 'readlink' (code 85)
 */

fn sys_readlink(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let path = read_guest_path(ctx, r.arg1());
    let buf_ptr = r.arg2();
    let bufsz = r.arg3() as usize;
    let full_path = emu.full_path(&path);
    log!(
        LogDebug,
        "  path='{}', full_path='{}', buf={:#x}, bufsz={}",
        path,
        full_path,
        buf_ptr,
        bufsz
    );

    let dest: Vec<u8>;
    if full_path == "/proc/self/exe" {
        // Report the emulated executable, not this emulator's binary.
        dest = emu.loader.exe_path.as_bytes().to_vec();
    } else {
        let mut buf = vec![0u8; MAX_PATH_SIZE];
        let n = unsafe {
            libc::readlink(
                cpath(&full_path).as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n == -1 {
            return host_errno();
        }
        if n as usize == buf.len() {
            fatal!("readlink target exceeds the maximum length");
        }
        buf.truncate(n as usize);
        dest = buf;
    }

    // Copied without a trailing NUL, truncated to the caller's buffer.
    let copy_len = dest.len().min(bufsz);
    mem(ctx).borrow_mut().write(buf_ptr, &dest[..copy_len]);
    log!(LogDebug, "  dest='{}'", String::from_utf8_lossy(&dest));
    copy_len as i32
}

/*
 * System calls 'mmap' (code 90) and 'mmap2' (code 192)
 */

fn do_mmap(
    ctx: &ContextSharedPtr,
    addr: u32,
    len: u32,
    prot: u32,
    flags: u32,
    guest_fd: i32,
    offset: u64,
) -> i32 {
    log!(
        LogDebug,
        "  addr={:#x}, len={}, prot={}, flags={}, guest_fd={}, offset={:#x}",
        addr,
        len,
        MMAP_PROT_MAP.flags_str(prot),
        MMAP_FLAGS_MAP.flags_str(flags),
        guest_fd,
        offset
    );

    let prot = ProtFlags::from_bits_truncate(prot);
    let map_flags = MapFlags::from_bits_truncate(flags);

    let mut host_fd = match fds(ctx).borrow().entry_get(guest_fd) {
        Some(entry) => entry.host_fd,
        None => -1,
    };
    if guest_fd > 0 && host_fd < 0 {
        fatal!("mmap with invalid guest descriptor {}", guest_fd);
    }
    if map_flags.contains(MapFlags::ANONYMOUS) {
        host_fd = -1;
    }

    let mut perm = Access::INIT;
    if prot.contains(ProtFlags::READ) {
        perm |= Access::READ;
    }
    if prot.contains(ProtFlags::WRITE) {
        perm |= Access::WRITE;
    }
    if prot.contains(ProtFlags::EXEC) {
        perm |= Access::EXEC;
    }

    if offset & u64::from(!MEM_PAGE_MASK) != 0 {
        fatal!("mmap with unaligned offset {:#x}", offset);
    }
    if addr & !MEM_PAGE_MASK != 0 {
        fatal!("mmap with unaligned address {:#x}", addr);
    }
    let len_aligned = page_round_up(len);

    let m = mem(ctx);
    let mapped_addr = if map_flags.contains(MapFlags::FIXED) {
        if addr == 0 {
            fatal!("mmap fixed mapping with no start address");
        }
        // A fixed mapping discards whatever was there.
        m.borrow_mut().unmap(addr, len_aligned);
        addr
    } else {
        // The address is a hint: satisfy it at or below via downward
        // search, then fall back to the allocator base.
        let hinted = if addr != 0 {
            m.borrow().map_space_down(addr, len_aligned)
        } else {
            None
        };
        match hinted.or_else(|| m.borrow().map_space_down(MMAP_BASE_ADDRESS, len_aligned)) {
            Some(found) => found,
            None => fatal!("mmap: out of guest memory"),
        }
    };

    m.borrow_mut().map(mapped_addr, len_aligned, perm);

    // File-backed mapping: copy the file contents in page-size chunks
    // through the init permission.
    if host_fd >= 0 {
        let last_pos = unsafe { libc::lseek(host_fd, 0, libc::SEEK_CUR) };
        unsafe { libc::lseek(host_fd, offset as i64, libc::SEEK_SET) };
        let mut cur = mapped_addr as u64;
        let end = mapped_addr as u64 + len_aligned as u64;
        while cur < end {
            let mut page = [0u8; MEM_PAGE_SIZE as usize];
            let n = unsafe {
                libc::read(
                    host_fd,
                    page.as_mut_ptr() as *mut libc::c_void,
                    page.len(),
                )
            };
            if n > 0 {
                m.borrow_mut().write_init(cur as u32, &page);
            }
            cur += u64::from(MEM_PAGE_SIZE);
        }
        unsafe { libc::lseek(host_fd, last_pos, libc::SEEK_SET) };
    }

    mapped_addr as i32
}

/// mmap takes its six arguments from guest memory, at the address in `ebx`.
fn sys_mmap(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let args_ptr = regs(ctx).arg1();
    let m = mem(ctx);
    let mut words = [0u32; 6];
    for (i, word) in words.iter_mut().enumerate() {
        *word = m.borrow_mut().read_u32(args_ptr + 4 * i as u32);
    }
    log!(LogDebug, "  args_ptr={:#x}", args_ptr);
    do_mmap(
        ctx,
        words[0],
        words[1],
        words[2],
        words[3],
        words[4] as i32,
        u64::from(words[5]),
    )
}

/// mmap2 differs from mmap only in passing arguments in registers and
/// interpreting the offset in page units.
fn sys_mmap2(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    do_mmap(
        ctx,
        r.arg1(),
        r.arg2(),
        r.arg3(),
        r.arg4(),
        r.arg5() as i32,
        u64::from(r.arg6()) << MEM_PAGE_SHIFT,
    )
}

/*
 * System call 'munmap' (code 91)
 */

fn sys_munmap(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let addr = r.arg1();
    let size = r.arg2();
    log!(LogDebug, "  addr={:#x}, size={:#x}", addr, size);

    if addr & !MEM_PAGE_MASK != 0 {
        fatal!("munmap with unaligned address {:#x}", addr);
    }
    mem(ctx).borrow_mut().unmap(addr, page_round_up(size));
    0
}

/*
 * System call 'fchmod' (code 94)
 */

fn sys_fchmod(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let mode = r.arg2();
    let host_fd = match fds(ctx).borrow().host_fd_of(guest_fd) {
        Some(fd) => fd,
        None => return -kernel_abi::EBADF,
    };
    log!(LogDebug, "  fd={}, mode={:#o}, host_fd={}", guest_fd, mode, host_fd);

    if unsafe { libc::fchmod(host_fd, mode as libc::mode_t) } == -1 {
        return host_errno();
    }
    0
}

/*
 * System call 'socketcall' (code 102)
 *
 * Only socket creation (SOCK_STREAM), connect and getpeername are
 * serviced; everything else in the multiplexer fails loudly.
 */

fn sys_socketcall(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let call = r.arg1();
    let args_ptr = r.arg2();
    log!(
        LogDebug,
        "  call={} ({}), args={:#x}",
        call,
        SOCKETCALL_CALL_MAP.value_str(call),
        args_ptr
    );

    let m = mem(ctx);
    match call {
        // SYS_SOCKET
        1 => {
            let family = m.borrow_mut().read_u32(args_ptr);
            let sock_type = m.borrow_mut().read_u32(args_ptr + 4);
            let protocol = m.borrow_mut().read_u32(args_ptr + 8);
            log!(
                LogDebug,
                "  family={} ({}), type={:#x} ({}), protocol={}",
                family,
                SOCKET_FAMILY_MAP.value_str(family),
                sock_type,
                SOCKET_TYPE_MAP.value_str(sock_type & 0xff),
                protocol
            );

            if sock_type & 0xff != 1 {
                fatal!("socketcall: only SOCK_STREAM sockets supported");
            }
            let host_fd =
                unsafe { libc::socket(family as i32, sock_type as i32, protocol as i32) };
            if host_fd == -1 {
                return host_errno();
            }
            let table = fds(ctx);
            let mut table = table.borrow_mut();
            let entry = table.new_entry(FdKind::Socket, host_fd, "", kernel_abi::O_RDWR);
            log!(
                LogDebug,
                "  socket created: guest_fd={}, host_fd={}",
                entry.guest_fd,
                entry.host_fd
            );
            entry.guest_fd
        }

        // SYS_CONNECT
        3 => {
            let guest_fd = m.borrow_mut().read_u32(args_ptr) as i32;
            let addr_ptr = m.borrow_mut().read_u32(args_ptr + 4);
            let addr_len = m.borrow_mut().read_u32(args_ptr + 8);
            log!(
                LogDebug,
                "  guest_fd={}, paddr={:#x}, addrlen={}",
                guest_fd,
                addr_ptr,
                addr_len
            );
            if addr_len as usize > 128 {
                fatal!("socketcall connect: sockaddr larger than the marshalling buffer");
            }

            let (host_fd, kind) = match fds(ctx).borrow().entry_get(guest_fd) {
                Some(entry) => (entry.host_fd, entry.kind),
                None => return -kernel_abi::EBADF,
            };
            if kind != FdKind::Socket {
                fatal!("socketcall connect: guest fd {} is not a socket", guest_fd);
            }

            let mut buf = [0u8; 128];
            m.borrow_mut().read(addr_ptr, &mut buf[..addr_len as usize]);
            let err = unsafe {
                libc::connect(
                    host_fd,
                    buf.as_ptr() as *const libc::sockaddr,
                    addr_len,
                )
            };
            if err == -1 {
                return host_errno();
            }
            err
        }

        // SYS_GETPEERNAME
        7 => {
            let guest_fd = m.borrow_mut().read_u32(args_ptr) as i32;
            let addr_ptr = m.borrow_mut().read_u32(args_ptr + 4);
            let addr_len_ptr = m.borrow_mut().read_u32(args_ptr + 8);
            log!(
                LogDebug,
                "  guest_fd={}, paddr={:#x}, paddrlen={:#x}",
                guest_fd,
                addr_ptr,
                addr_len_ptr
            );

            let host_fd = match fds(ctx).borrow().host_fd_of(guest_fd) {
                Some(fd) => fd,
                None => return -kernel_abi::EBADF,
            };

            let addr_len = m.borrow_mut().read_u32(addr_len_ptr);
            let mut buf = vec![0u8; addr_len as usize];
            let mut host_len: libc::socklen_t = addr_len;
            let err = unsafe {
                libc::getpeername(
                    host_fd,
                    buf.as_mut_ptr() as *mut libc::sockaddr,
                    &mut host_len,
                )
            };
            if err == -1 {
                return host_errno();
            }
            m.borrow_mut().write_u32(addr_len_ptr, host_len);
            m.borrow_mut()
                .write(addr_ptr, &buf[..host_len as usize]);
            err
        }

        _ => fatal!(
            "socketcall '{}' not implemented",
            SOCKETCALL_CALL_MAP.value_str(call)
        ),
    }
}

/*
 * System call 'setitimer' (code 104)
 */

fn sys_setitimer(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let which = r.arg1();
    let value_ptr = r.arg2();
    let old_value_ptr = r.arg3();
    log!(
        LogDebug,
        "  which={} ({}), value_ptr={:#x}, old_value_ptr={:#x}",
        which,
        ITIMER_WHICH_MAP.value_str(which),
        value_ptr,
        old_value_ptr
    );

    if which as usize >= ITIMER_COUNT {
        fatal!("setitimer with invalid 'which' value {}", which);
    }

    let value = if value_ptr != 0 {
        let mut buf = [0u8; GuestItimerval::SIZE as usize];
        mem(ctx).borrow_mut().read(value_ptr, &mut buf);
        GuestItimerval::from_bytes(&buf)
    } else {
        GuestItimerval::default()
    };
    log!(
        LogDebug,
        "  it_value={}.{:06}s it_interval={}.{:06}s",
        value.value.sec,
        value.value.usec,
        value.interval.sec,
        value.interval.usec
    );

    let now = emu.timer_us();
    {
        let mut c = ctx.borrow_mut();
        let timer = &mut c.itimers[which as usize];
        timer.expiry_us = match value.value.total_usec() {
            0 => 0, // a zero it_value disarms the timer
            delta => now + delta,
        };
        timer.interval_us = value.interval.total_usec();
    }

    // A new expiry invalidates whatever wait the event loop had armed.
    emu.schedule_events();
    0
}

/*
 * System call 'getitimer' (code 105)
 */

fn sys_getitimer(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let which = r.arg1();
    let value_ptr = r.arg2();
    log!(
        LogDebug,
        "  which={} ({}), value_ptr={:#x}",
        which,
        ITIMER_WHICH_MAP.value_str(which),
        value_ptr
    );

    if which as usize >= ITIMER_COUNT {
        fatal!("getitimer with invalid 'which' value {}", which);
    }

    let now = emu.timer_us();
    let timer = ctx.borrow().itimers[which as usize];
    let remaining = timer.expiry_us.saturating_sub(now);
    let value = GuestItimerval {
        interval: GuestTimeval::from_usec(timer.interval_us),
        value: GuestTimeval::from_usec(remaining),
    };
    mem(ctx).borrow_mut().write(value_ptr, &value.to_bytes());
    0
}

/*
 * System call 'sigreturn' (code 119)
 */

fn sys_sigreturn(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let restored_eax;
    {
        let mut c = ctx.borrow_mut();
        let frame = match c.signals.pop_handler_frame() {
            Some(frame) => frame,
            None => fatal!("sigreturn without an active signal handler"),
        };
        log!(
            LogDebug,
            "  returning from {} handler to eip {:#010x}",
            signal_name(frame.sig),
            frame.regs.eip
        );
        c.signals.blocked.remove(frame.sig);
        c.regs = frame.regs;
        restored_eax = c.regs.syscall_result_signed();
    }

    emu.schedule_events();
    emu.process_events();
    // Re-assert the restored eax; the dispatcher writes our return value
    // back unconditionally for running contexts.
    restored_eax
}

/*
 * System call 'clone' (code 120)
 *
 * long sys_clone(unsigned long flags, unsigned long newsp,
 *                int *parent_tid, int unused, int *child_tid);
 * The unused slot is why child_tid comes from edi rather than esi; esi
 * carries the user_desc pointer for CLONE_SETTLS.
 */

fn sys_clone(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let raw_flags = r.arg1();
    let new_esp = if r.arg2() != 0 { r.arg2() } else { r.esp };
    let parent_tid_ptr = r.arg3();
    let child_tid_ptr = r.arg5();
    log!(
        LogDebug,
        "  flags={:#x}, newsp={:#x}, parent_tidptr={:#x}, child_tidptr={:#x}",
        raw_flags,
        new_esp,
        parent_tid_ptr,
        child_tid_ptr
    );

    // The exit signal rides in the low byte of the flags word.
    let exit_signal = (raw_flags & 0xff) as i32;
    let flag_bits = raw_flags & !0xff;
    log!(LogDebug, "  flags={}", CLONE_FLAGS_MAP.flags_str(flag_bits));
    log!(LogDebug, "  exit_signal={} ({})", exit_signal, signal_name(exit_signal));

    let flags = match CloneFlags::from_bits(flag_bits) {
        Some(flags) if CloneFlags::supported().contains(flags) => flags,
        _ => fatal!(
            "clone with unsupported flags {}",
            CLONE_FLAGS_MAP.flags_str(flag_bits & !CloneFlags::supported().bits())
        ),
    };

    let sharing = CloneFlags::FS | CloneFlags::FILES | CloneFlags::SIGHAND;
    let child_pid = emu.new_pid();
    let mut child = if flags.contains(CloneFlags::VM) {
        // Sharing the VM requires sharing fs/files/sighand as well.
        if !flags.contains(sharing) {
            fatal!("clone with CLONE_VM requires CLONE_FS|CLONE_FILES|CLONE_SIGHAND");
        }
        ctx.borrow().clone_sharing(child_pid)
    } else {
        if flags.intersects(sharing) {
            fatal!("clone without CLONE_VM cannot share fs/files/sighand");
        }
        ctx.borrow().fork_copying(child_pid)
    };

    if flags.contains(CloneFlags::THREAD) {
        // Thread-group members never signal the parent on exit.
        child.exit_signal = 0;
        child.group_parent = Some(ctx.borrow().thread_group_leader());
    } else {
        child.exit_signal = exit_signal;
        child.group_parent = None;
    }

    if flags.contains(CloneFlags::PARENT_SETTID) {
        mem(ctx)
            .borrow_mut()
            .write_u32(parent_tid_ptr, child_pid as u32);
    }
    if flags.contains(CloneFlags::CHILD_SETTID) {
        child.mem.borrow_mut().write_u32(child_tid_ptr, child_pid as u32);
    }
    if flags.contains(CloneFlags::CHILD_CLEARTID) {
        child.clear_child_tid = child_tid_ptr;
    }

    if flags.contains(CloneFlags::SETTLS) {
        let uinfo_ptr = r.arg4();
        log!(LogDebug, "  puinfo={:#x}", uinfo_ptr);
        let mut buf = [0u8; GuestUserDesc::SIZE as usize];
        mem(ctx).borrow_mut().read(uinfo_ptr, &mut buf);
        let uinfo = GuestUserDesc::from_bytes(&buf);
        log!(
            LogDebug,
            "  entry_number={:#x}, base_addr={:#x}, limit={:#x}",
            uinfo.entry_number,
            uinfo.base_addr,
            uinfo.limit
        );
        if !uinfo.seg_32bit() {
            fatal!("clone: only 32-bit TLS segments supported");
        }
        let limit = if uinfo.limit_in_pages() {
            uinfo.limit << MEM_PAGE_SHIFT
        } else {
            uinfo.limit
        };
        // The entry number is always assigned 6 and reported back.
        mem(ctx).borrow_mut().write_u32(uinfo_ptr, 6);
        child.tls = Some(TlsSegment {
            base: uinfo.base_addr,
            limit,
        });
    }

    child.regs.esp = new_esp;
    child.regs.set_syscall_result(0);
    emu.register_context(child);

    log!(LogDebug, "  context created with pid {}", child_pid);
    child_pid
}

/*
 * System call 'newuname' (code 122)
 */

static UTSNAME: GuestUtsname = GuestUtsname {
    sysname: "Linux",
    nodename: "vx86",
    release: "3.1.9-1.fc16.i686",
    version: "#1 Fri Jan 13 16:37:42 UTC 2012",
    machine: "i686",
    domainname: "",
};

fn sys_newuname(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let utsname_ptr = regs(ctx).arg1();
    log!(
        LogDebug,
        "  putsname={:#x} sysname='{}' release='{}'",
        utsname_ptr,
        UTSNAME.sysname,
        UTSNAME.release
    );
    mem(ctx).borrow_mut().write(utsname_ptr, &UTSNAME.to_bytes());
    0
}

/*
 * System call 'mprotect' (code 125)
 */

fn sys_mprotect(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let start = r.arg1();
    let len = r.arg2();
    let prot = r.arg3();
    log!(
        LogDebug,
        "  start={:#x}, len={:#x}, prot={}",
        start,
        len,
        MMAP_PROT_MAP.flags_str(prot)
    );

    let prot = ProtFlags::from_bits_truncate(prot);
    let mut perm = Access::empty();
    if prot.contains(ProtFlags::READ) {
        perm |= Access::READ;
    }
    if prot.contains(ProtFlags::WRITE) {
        perm |= Access::WRITE;
    }
    if prot.contains(ProtFlags::EXEC) {
        perm |= Access::EXEC;
    }
    mem(ctx).borrow_mut().protect(start, len, perm);
    0
}

/*
 * System call 'llseek' (code 140)
 */

fn sys_llseek(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let offset_high = r.arg2() as i32;
    let offset_low = r.arg3();
    let result_ptr = r.arg4();
    let origin = r.arg5() as i32;
    let host_fd = match fds(ctx).borrow().host_fd_of(guest_fd) {
        Some(fd) => fd,
        None => return -kernel_abi::EBADF,
    };
    log!(
        LogDebug,
        "  fd={}, offset_high={:#x}, offset_low={:#x}, result_ptr={:#x}, origin={:#x}, host_fd={}",
        guest_fd,
        offset_high,
        offset_low,
        result_ptr,
        origin,
        host_fd
    );

    if offset_high != 0 && offset_high != -1 {
        fatal!("llseek only supported for 32-bit file offsets");
    }
    let offset = (i64::from(offset_high) << 32) | i64::from(offset_low);

    let pos = unsafe { libc::lseek(host_fd, offset, origin) };
    if pos == -1 {
        return host_errno();
    }
    if result_ptr != 0 {
        mem(ctx).borrow_mut().write(result_ptr, &pos.to_le_bytes());
    }
    0
}

/*
 * System call 'getdents' (code 141)
 *
 * The host records (64-bit inode/offset) are repacked into the guest's
 * 32-bit dirent layout: d_ino, d_off, d_reclen, name, and the d_type byte
 * tucked at reclen-1.
 */

fn sys_getdents(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let dirent_ptr = r.arg2();
    let count = r.arg3() as usize;
    let host_fd = match fds(ctx).borrow().host_fd_of(guest_fd) {
        Some(fd) => fd,
        None => return -kernel_abi::EBADF,
    };
    log!(
        LogDebug,
        "  fd={}, pdirent={:#x}, count={}, host_fd={}",
        guest_fd,
        dirent_ptr,
        count,
        host_fd
    );

    let mut buf = vec![0u8; count];
    let nread = unsafe {
        libc::syscall(
            libc::SYS_getdents,
            host_fd,
            buf.as_mut_ptr(),
            count,
        )
    };
    if nread == -1 {
        fatal!("host getdents failed: {}", std::io::Error::last_os_error());
    }
    if nread == 0 {
        return 0;
    }

    let m = mem(ctx);
    let mut host_offs = 0usize;
    let mut guest_offs = 0u32;
    while host_offs < nread as usize {
        let rec = &buf[host_offs..];
        let d_ino = u64::from_le_bytes(rec[0..8].try_into().unwrap());
        let d_off = u64::from_le_bytes(rec[8..16].try_into().unwrap());
        let d_reclen = u16::from_le_bytes(rec[16..18].try_into().unwrap()) as usize;
        let name_bytes = &rec[18..d_reclen];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(0);
        let name = &name_bytes[..name_len];
        let d_type = rec[d_reclen - 1];

        let guest_reclen = dirent_reclen(name_len);
        if guest_offs as usize + guest_reclen as usize > count {
            fatal!("getdents guest buffer too small");
        }
        log!(
            LogDebug,
            "  d_ino={} d_off={} d_reclen={}(host),{}(guest) d_name='{}'",
            d_ino,
            d_off,
            d_reclen,
            guest_reclen,
            String::from_utf8_lossy(name)
        );

        let base = dirent_ptr + guest_offs;
        let mut mm = m.borrow_mut();
        mm.write_u32(base, d_ino as u32);
        mm.write_u32(base + 4, d_off as u32);
        mm.write(base + 8, &guest_reclen.to_le_bytes());
        mm.write(base + 10, name);
        mm.write(base + 10 + name_len as u32, &[0u8]);
        mm.write(base + u32::from(guest_reclen) - 1, &[d_type]);
        drop(mm);

        host_offs += d_reclen;
        guest_offs += u32::from(guest_reclen);
    }
    log!(LogDebug, "  ret={}(host),{}(guest)", host_offs, guest_offs);
    guest_offs as i32
}

/*
 * System call 'select' (code 142)
 *
 * Only the non-blocking form (zero timeout) is serviced; the fd-set
 * bitmaps are translated guest fd <-> host fd in both directions.
 */

fn read_guest_fd_set(
    m: &MemorySharedPtr,
    table: &FdTableSharedPtr,
    addr: u32,
    n: u32,
) -> Result<libc::fd_set, i32> {
    let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_ZERO(&mut set) };
    if addr == 0 {
        return Ok(set);
    }
    for guest_fd in 0..n as i32 {
        let mut byte = [0u8];
        m.borrow_mut().read(addr + (guest_fd as u32 >> 3), &mut byte);
        if byte[0] & (1 << (guest_fd & 7)) == 0 {
            continue;
        }
        // An fd in the set with no table entry is a real error, distinct
        // from an empty set.
        match table.borrow().host_fd_of(guest_fd) {
            Some(host_fd) => unsafe { libc::FD_SET(host_fd, &mut set) },
            None => return Err(-kernel_abi::EBADF),
        }
    }
    Ok(set)
}

fn write_guest_fd_set(
    m: &MemorySharedPtr,
    table: &FdTableSharedPtr,
    addr: u32,
    n: u32,
    set: &mut libc::fd_set,
) {
    if addr == 0 {
        return;
    }
    m.borrow_mut().zero(addr, (n + 7) / 8);
    for guest_fd in 0..n as i32 {
        let host_fd = match table.borrow().host_fd_of(guest_fd) {
            Some(fd) => fd,
            None => continue,
        };
        if !unsafe { libc::FD_ISSET(host_fd, set) } {
            continue;
        }
        let byte_addr = addr + (guest_fd as u32 >> 3);
        let mut byte = [0u8];
        m.borrow_mut().read(byte_addr, &mut byte);
        byte[0] |= 1 << (guest_fd & 7);
        m.borrow_mut().write(byte_addr, &byte);
    }
}

fn sys_select(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let n = r.arg1();
    let inp = r.arg2();
    let outp = r.arg3();
    let exp = r.arg4();
    let tvp = r.arg5();
    log!(
        LogDebug,
        "  n={}, inp={:#x}, outp={:#x}, exp={:#x}, tvp={:#x}",
        n,
        inp,
        outp,
        exp,
        tvp
    );

    let m = mem(ctx);
    let table = fds(ctx);
    let mut in_set = match read_guest_fd_set(&m, &table, inp, n) {
        Ok(set) => set,
        Err(err) => return err,
    };
    let mut out_set = match read_guest_fd_set(&m, &table, outp, n) {
        Ok(set) => set,
        Err(err) => return err,
    };
    let mut ex_set = match read_guest_fd_set(&m, &table, exp, n) {
        Ok(set) => set,
        Err(err) => return err,
    };

    let mut tv = GuestTimeval::default();
    if tvp != 0 {
        let mut buf = [0u8; GuestTimeval::SIZE as usize];
        m.borrow_mut().read(tvp, &mut buf);
        tv = GuestTimeval::from_bytes(&buf);
    }
    log!(LogDebug, "  tv={}.{:06}s", tv.sec, tv.usec);
    if tv.sec != 0 || tv.usec != 0 {
        fatal!("select only supported with a zero timeout");
    }

    let mut host_tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let err = unsafe {
        libc::select(
            libc::FD_SETSIZE as i32,
            &mut in_set,
            &mut out_set,
            &mut ex_set,
            &mut host_tv,
        )
    };
    if err == -1 {
        return host_errno();
    }

    write_guest_fd_set(&m, &table, inp, n, &mut in_set);
    write_guest_fd_set(&m, &table, outp, n, &mut out_set);
    write_guest_fd_set(&m, &table, exp, n, &mut ex_set);
    err
}

/*
 * System call 'msync' (code 144)
 *
 * Guest pages have no host file backing to synchronize; accepted and
 * ignored.
 */

fn sys_msync(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    log!(
        LogDebug,
        "  start={:#x}, len={:#x}, flags={}",
        r.arg1(),
        r.arg2(),
        MSYNC_FLAGS_MAP.flags_str(r.arg3())
    );
    0
}

/*
 * System call 'nanosleep' (code 162)
 */

fn sys_nanosleep(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let req_ptr = r.arg1();
    let m = mem(ctx);
    let sec = m.borrow_mut().read_u32(req_ptr);
    let nsec = m.borrow_mut().read_u32(req_ptr + 4);
    let total_us = u64::from(sec) * 1_000_000 + u64::from(nsec) / 1000;
    log!(LogDebug, "  req={:#x} ({}.{:09}s)", req_ptr, sec, nsec);

    if total_us == 0 {
        return 0;
    }
    let deadline_us = emu.timer_us() + total_us;
    ctx.borrow_mut().suspend(Wakeup::Nanosleep { deadline_us });
    emu.schedule_events();
    0
}

/*
 * System call 'mremap' (code 163)
 */

fn sys_mremap(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let addr = r.arg1();
    let old_len = r.arg2();
    let new_len = r.arg3();
    let flags = r.arg4();
    log!(
        LogDebug,
        "  addr={:#x}, old_len={:#x}, new_len={:#x}, flags={:#x}",
        addr,
        old_len,
        new_len,
        flags
    );

    if addr & !MEM_PAGE_MASK != 0 || old_len & !MEM_PAGE_MASK != 0 || new_len & !MEM_PAGE_MASK != 0
    {
        fatal!("mremap with unaligned arguments");
    }
    if flags & kernel_abi::MREMAP_MAYMOVE == 0 {
        fatal!("mremap requires MREMAP_MAYMOVE");
    }
    if old_len == 0 || new_len == 0 {
        fatal!("mremap with a zero length");
    }

    let m = mem(ctx);
    if new_len == old_len {
        return addr as i32;
    }

    // Shrinking happens in place.
    if new_len < old_len {
        m.borrow_mut().unmap(addr + new_len, old_len - new_len);
        return addr as i32;
    }

    // Grow in place when the range immediately above is free.
    let tail = addr + old_len;
    let delta = new_len - old_len;
    if m.borrow().map_space(tail, delta) == Some(tail) {
        m.borrow_mut().map(tail, delta, Access::READ | Access::WRITE);
        return addr as i32;
    }

    // Relocate through the downward allocator.
    let new_addr = match m.borrow().map_space_down(MMAP_BASE_ADDRESS, new_len) {
        Some(found) => found,
        None => fatal!("mremap: out of guest memory"),
    };
    let mut mm = m.borrow_mut();
    mm.map(new_addr, new_len, Access::READ | Access::WRITE);
    mm.copy(new_addr, addr, old_len.min(new_len));
    mm.unmap(addr, old_len);
    log!(LogDebug, "  region moved to {:#x}", new_addr);
    new_addr as i32
}

/*
 * System call 'poll' (code 168)
 *
 * Single-descriptor form, POLLIN/POLLOUT only: enough for the guest C
 * library's I/O paths, loud failure for everything else.
 */

fn sys_poll(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let pfds_ptr = r.arg1();
    let nfds = r.arg2();
    let timeout_ms = r.arg3() as i32;
    log!(
        LogDebug,
        "  pfds={:#x}, nfds={}, timeout={}",
        pfds_ptr,
        nfds,
        timeout_ms
    );

    if nfds != 1 {
        fatal!("poll only supported for a single file descriptor");
    }

    let m = mem(ctx);
    let guest_fd = m.borrow_mut().read_u32(pfds_ptr) as i32;
    let mut events_buf = [0u8; 2];
    m.borrow_mut().read(pfds_ptr + 4, &mut events_buf);
    let events = i16::from_le_bytes(events_buf);
    log!(LogDebug, "  fd={}, events={:#x}", guest_fd, events);

    if events & !(POLLIN | POLLOUT) != 0 {
        fatal!("poll with unsupported events {:#x}", events);
    }
    let host_fd = match fds(ctx).borrow().host_fd_of(guest_fd) {
        Some(fd) => fd,
        None => return -kernel_abi::EBADF,
    };

    let revents = poll_host_fd(host_fd, events);
    if revents != 0 {
        m.borrow_mut().write(pfds_ptr + 6, &revents.to_le_bytes());
        return 1;
    }
    if timeout_ms == 0 {
        m.borrow_mut().write(pfds_ptr + 6, &0i16.to_le_bytes());
        return 0;
    }

    let deadline_us = if timeout_ms < 0 {
        0 // no timeout, readiness only
    } else {
        emu.timer_us() + timeout_ms as u64 * 1000
    };
    ctx.borrow_mut().suspend(Wakeup::Poll {
        pfds_ptr,
        fd: guest_fd,
        events,
        deadline_us,
    });
    emu.schedule_events();
    0
}

/*
 * System call 'getrlimit' (code 191)
 */

fn sys_getrlimit(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let resource = r.arg1();
    let rlim_ptr = r.arg2();
    log!(
        LogDebug,
        "  res={} ({}), rlim_ptr={:#x}",
        resource,
        RLIMIT_RESOURCE_MAP.value_str(resource),
        rlim_ptr
    );

    let rlimit = match resource {
        // RLIMIT_DATA
        2 => GuestRlimit {
            cur: 0xffff_ffff,
            max: 0xffff_ffff,
        },
        // RLIMIT_STACK: the loader decides how big the initial stack is.
        3 => GuestRlimit {
            cur: emu.loader.stack_size,
            max: 0xffff_ffff,
        },
        // RLIMIT_NOFILE
        7 => GuestRlimit {
            cur: 0x400,
            max: 0x400,
        },
        _ => fatal!(
            "getrlimit not implemented for resource {}",
            RLIMIT_RESOURCE_MAP.value_str(resource)
        ),
    };
    mem(ctx).borrow_mut().write(rlim_ptr, &rlimit.to_bytes());
    log!(LogDebug, "  ret: cur={:#x}, max={:#x}", rlimit.cur, rlimit.max);
    0
}

/*
 * System call 'fcntl64' (code 221)
 */

fn sys_fcntl64(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let r = regs(ctx);
    let guest_fd = r.arg1() as i32;
    let cmd = r.arg2();
    let arg = r.arg3();
    log!(
        LogDebug,
        "  guest_fd={}, cmd={} ({}), arg={:#x}",
        guest_fd,
        cmd,
        FCNTL_CMD_MAP.value_str(cmd),
        arg
    );

    let table = fds(ctx);
    let host_fd = match table.borrow().entry_get(guest_fd) {
        Some(entry) => entry.host_fd,
        None => return -kernel_abi::EBADF,
    };
    log!(LogDebug, "  host_fd={}", host_fd);

    let err = match cmd {
        // F_GETFD
        1 => unsafe { libc::fcntl(host_fd, libc::F_GETFD) },
        // F_SETFD
        2 => unsafe { libc::fcntl(host_fd, libc::F_SETFD, arg) },
        // F_GETFL
        3 => {
            let flags = unsafe { libc::fcntl(host_fd, libc::F_GETFL) };
            if flags >= 0 {
                log!(LogDebug, "  ret={}", OPEN_FLAGS_MAP.flags_str(flags as u32));
            }
            flags
        }
        // F_SETFL: the guest-visible flags are updated as well, so a later
        // read sees O_NONBLOCK without consulting the host.
        4 => {
            log!(LogDebug, "  arg={}", OPEN_FLAGS_MAP.flags_str(arg));
            if let Some(entry) = table.borrow_mut().entry_get_mut(guest_fd) {
                entry.flags = arg as i32;
            }
            unsafe { libc::fcntl(host_fd, libc::F_SETFL, arg) }
        }
        _ => fatal!(
            "fcntl64 command {} not implemented",
            FCNTL_CMD_MAP.value_str(cmd)
        ),
    };
    if err == -1 {
        return host_errno();
    }
    err
}

/*
 * System call 'set_thread_area' (code 243)
 */

fn sys_set_thread_area(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let uinfo_ptr = regs(ctx).arg1();
    log!(LogDebug, "  uinfo_ptr={:#x}", uinfo_ptr);

    let mut buf = [0u8; GuestUserDesc::SIZE as usize];
    mem(ctx).borrow_mut().read(uinfo_ptr, &mut buf);
    let uinfo = GuestUserDesc::from_bytes(&buf);
    log!(
        LogDebug,
        "  entry_number={:#x}, base_addr={:#x}, limit={:#x}",
        uinfo.entry_number,
        uinfo.base_addr,
        uinfo.limit
    );

    if !uinfo.seg_32bit() {
        fatal!("set_thread_area: only 32-bit segments supported");
    }
    let limit = if uinfo.limit_in_pages() {
        uinfo.limit << MEM_PAGE_SHIFT
    } else {
        uinfo.limit
    };

    let mut c = ctx.borrow_mut();
    if uinfo.entry_number == 0xffff_ffff {
        // Allocation request: the TLS entry is always number 6.
        if c.tls.is_some() {
            fatal!("set_thread_area: TLS segment already installed");
        }
        c.tls = Some(TlsSegment {
            base: uinfo.base_addr,
            limit,
        });
        drop(c);
        mem(ctx).borrow_mut().write_u32(uinfo_ptr, 6);
    } else {
        if uinfo.entry_number != 6 {
            fatal!("set_thread_area: invalid entry number {}", uinfo.entry_number);
        }
        if c.tls.is_none() {
            fatal!("set_thread_area: TLS segment not installed yet");
        }
        c.tls = Some(TlsSegment {
            base: uinfo.base_addr,
            limit,
        });
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunState;
    use crate::emu::LoaderInfo;
    use crate::memory::MEM_PAGE_SIZE;
    use crate::signal::SigAction;
    use std::path::PathBuf;

    /// One RW page of guest memory for paths, buffers and structs.
    const SCRATCH: u32 = 0x3000_0000;

    fn setup() -> (Emu, pid_t) {
        let mut emu = Emu::new(LoaderInfo {
            exe_path: "/tmp/app".to_string(),
            cwd: PathBuf::from("/tmp"),
            stack_size: 0x80_0000,
        });
        let pid = emu.create_root_context();
        let ctx = emu.context(pid).unwrap();
        ctx.borrow()
            .mem
            .borrow_mut()
            .map(SCRATCH, MEM_PAGE_SIZE, Access::READ | Access::WRITE);
        (emu, pid)
    }

    fn guest_mem(emu: &Emu, pid: pid_t) -> MemorySharedPtr {
        Rc::clone(&emu.context(pid).unwrap().borrow().mem)
    }

    fn write_cstr(emu: &Emu, pid: pid_t, addr: u32, s: &str) {
        let m = guest_mem(emu, pid);
        let mut m = m.borrow_mut();
        m.write(addr, s.as_bytes());
        m.write(addr + s.len() as u32, &[0u8]);
    }

    fn syscall(emu: &mut Emu, pid: pid_t, number: u32, args: &[u32]) -> i32 {
        let ctx = emu.context(pid).unwrap();
        {
            let mut c = ctx.borrow_mut();
            c.regs.eax = number;
            c.regs.ebx = args.get(0).copied().unwrap_or(0);
            c.regs.ecx = args.get(1).copied().unwrap_or(0);
            c.regs.edx = args.get(2).copied().unwrap_or(0);
            c.regs.esi = args.get(3).copied().unwrap_or(0);
            c.regs.edi = args.get(4).copied().unwrap_or(0);
            c.regs.ebp = args.get(5).copied().unwrap_or(0);
        }
        dispatch(emu, pid);
        let result = ctx.borrow().regs.syscall_result_signed();
        result
    }

    #[test]
    fn brk_query_grow_and_shrink() {
        let (mut emu, pid) = setup();
        guest_mem(&emu, pid).borrow_mut().heap_break = 0x0810_0000;

        assert_eq!(syscall(&mut emu, pid, 45, &[0]), 0x0810_0000);

        assert_eq!(syscall(&mut emu, pid, 45, &[0x0810_1234]), 0x0810_1234);
        let m = guest_mem(&emu, pid);
        let rw = Access::READ | Access::WRITE;
        assert_eq!(m.borrow().page_perms(0x0810_0000), Some(rw));
        assert_eq!(m.borrow().page_perms(0x0810_1000), Some(rw));

        assert_eq!(syscall(&mut emu, pid, 45, &[0x0810_0800]), 0x0810_0800);
        assert!(!m.borrow().is_mapped(0x0810_1000));
        assert!(m.borrow().is_mapped(0x0810_0000));
        assert_eq!(m.borrow().heap_break, 0x0810_0800);
    }

    #[test]
    fn brk_refuses_growth_over_existing_mapping() {
        let (mut emu, pid) = setup();
        let m = guest_mem(&emu, pid);
        m.borrow_mut().heap_break = 0x0810_0000;
        m.borrow_mut()
            .map(0x0810_1000, MEM_PAGE_SIZE, Access::READ);

        assert_eq!(syscall(&mut emu, pid, 45, &[0x0810_2000]), 0x0810_0000);
        assert_eq!(m.borrow().heap_break, 0x0810_0000);
    }

    #[test]
    fn blocking_pipe_read_suspends_and_wakes() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 42, &[SCRATCH]), 0);
        let m = guest_mem(&emu, pid);
        let read_fd = m.borrow_mut().read_u32(SCRATCH);
        let write_fd = m.borrow_mut().read_u32(SCRATCH + 4);
        assert_eq!((read_fd, write_fd), (3, 4));

        // Empty pipe, no O_NONBLOCK: the context must suspend.
        let buf_ptr = SCRATCH + 0x100;
        syscall(&mut emu, pid, 3, &[read_fd, buf_ptr, 10]);
        let ctx = emu.context(pid).unwrap();
        assert_eq!(
            ctx.borrow().state,
            RunState::Suspended(Wakeup::Read {
                fd: read_fd as i32,
                events: POLLIN
            })
        );
        assert!(emu.events_scheduled());
        // The call number is still in eax for the retry.
        assert_eq!(ctx.borrow().regs.eax, 3);

        // Another party fills the pipe; the event loop retries the read.
        let host_write_fd = ctx.borrow().fds.borrow().host_fd_of(write_fd as i32).unwrap();
        let n = unsafe { libc::write(host_write_fd, b"hi".as_ptr() as *const libc::c_void, 2) };
        assert_eq!(n, 2);
        emu.process_events();

        assert!(ctx.borrow().is_running());
        assert_eq!(ctx.borrow().regs.syscall_result_signed(), 2);
        let mut got = [0u8; 2];
        m.borrow_mut().read(buf_ptr, &mut got);
        assert_eq!(&got, b"hi");
    }

    #[test]
    fn waitpid_suspends_until_child_exit_then_reaps() {
        let (mut emu, pid) = setup();
        // Plain fork-style clone; SIGCHLD rides in the low flag byte.
        let child_pid = syscall(&mut emu, pid, 120, &[17]);
        assert_eq!(child_pid, 101);

        let status_ptr = SCRATCH + 0x200;
        syscall(&mut emu, pid, 7, &[-1i32 as u32, status_ptr, 0]);
        let parent = emu.context(pid).unwrap();
        assert_eq!(
            parent.borrow().state,
            RunState::Suspended(Wakeup::WaitPid { pid: -1 })
        );

        // Child exits with code 5 and turns zombie until reaped.
        {
            let child = emu.context(child_pid).unwrap();
            let mut c = child.borrow_mut();
            c.regs.eax = 1;
            c.regs.ebx = 5;
        }
        dispatch(&mut emu, child_pid);
        assert!(emu.context(child_pid).unwrap().borrow().is_zombie());

        emu.process_events();
        assert!(parent.borrow().is_running());
        assert_eq!(parent.borrow().regs.syscall_result_signed(), child_pid);
        assert_eq!(guest_mem(&emu, pid).borrow_mut().read_u32(status_ptr), 5);
        assert!(emu.context(child_pid).is_none());
    }

    #[test]
    fn waitpid_wnohang_returns_zero_without_children() {
        let (mut emu, pid) = setup();
        let child_pid = syscall(&mut emu, pid, 120, &[17]);
        assert!(child_pid > 0);
        assert_eq!(
            syscall(&mut emu, pid, 7, &[-1i32 as u32, 0, WNOHANG]),
            0
        );
        assert!(emu.context(pid).unwrap().borrow().is_running());
    }

    #[test]
    fn mmap_fixed_overlap_replaces_upper_page() {
        let (mut emu, pid) = setup();
        let flags = (MapFlags::ANONYMOUS | MapFlags::PRIVATE | MapFlags::FIXED).bits();
        let ret = syscall(
            &mut emu,
            pid,
            192,
            &[0x4000_0000, 0x2000, ProtFlags::READ.bits(), flags, -1i32 as u32, 0],
        );
        assert_eq!(ret as u32, 0x4000_0000);
        let m = guest_mem(&emu, pid);
        assert_eq!(
            m.borrow().page_perms(0x4000_0000),
            Some(Access::READ | Access::INIT)
        );
        assert_eq!(
            m.borrow().page_perms(0x4000_1000),
            Some(Access::READ | Access::INIT)
        );

        let ret = syscall(
            &mut emu,
            pid,
            192,
            &[0x4000_1000, 0x1000, ProtFlags::WRITE.bits(), flags, -1i32 as u32, 0],
        );
        assert_eq!(ret as u32, 0x4000_1000);
        assert_eq!(
            m.borrow().page_perms(0x4000_1000),
            Some(Access::WRITE | Access::INIT)
        );
        assert_eq!(
            m.borrow().page_perms(0x4000_0000),
            Some(Access::READ | Access::INIT)
        );
    }

    #[test]
    fn mmap_hint_allocates_downward_and_munmap_restores() {
        let (mut emu, pid) = setup();
        let m = guest_mem(&emu, pid);
        let pages_before = m.borrow().page_count();
        let flags = (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits();

        // No hint: allocation starts at the fixed base.
        let a = syscall(
            &mut emu,
            pid,
            192,
            &[0, 0x2000, ProtFlags::READ.bits(), flags, -1i32 as u32, 0],
        ) as u32;
        assert_eq!(a, 0xb7fb_0000);

        // Second anonymous mapping lands below the first.
        let b = syscall(
            &mut emu,
            pid,
            192,
            &[0, 0x1000, ProtFlags::READ.bits(), flags, -1i32 as u32, 0],
        ) as u32;
        assert!(b < a);

        assert_eq!(syscall(&mut emu, pid, 91, &[a, 0x2000]), 0);
        assert_eq!(syscall(&mut emu, pid, 91, &[b, 0x1000]), 0);
        assert_eq!(m.borrow().page_count(), pages_before);
    }

    #[test]
    fn clone_vm_shares_memory_both_ways() {
        let (mut emu, pid) = setup();
        let addr = SCRATCH + 0x40;
        guest_mem(&emu, pid).borrow_mut().write_u32(addr, 0xcafe_babe);

        let flags = (CloneFlags::VM
            | CloneFlags::FS
            | CloneFlags::FILES
            | CloneFlags::SIGHAND
            | CloneFlags::THREAD)
            .bits();
        let child_pid = syscall(&mut emu, pid, 120, &[flags, SCRATCH + 0xf00]);
        assert!(child_pid > 0);

        let parent = emu.context(pid).unwrap();
        let child = emu.context(child_pid).unwrap();
        assert!(Rc::ptr_eq(&parent.borrow().mem, &child.borrow().mem));
        assert_eq!(child.borrow().regs.syscall_result_signed(), 0);
        assert_eq!(child.borrow().regs.esp, SCRATCH + 0xf00);
        assert_eq!(child.borrow().group_parent, Some(pid));
        assert_eq!(child.borrow().exit_signal, 0);

        let child_mem = Rc::clone(&child.borrow().mem);
        assert_eq!(child_mem.borrow_mut().read_u32(addr), 0xcafe_babe);
        child_mem.borrow_mut().write_u32(addr, 0xdead_beef);
        assert_eq!(guest_mem(&emu, pid).borrow_mut().read_u32(addr), 0xdead_beef);
    }

    #[test]
    fn clone_without_vm_copies_memory() {
        let (mut emu, pid) = setup();
        let addr = SCRATCH + 0x40;
        guest_mem(&emu, pid).borrow_mut().write_u32(addr, 1);

        let child_pid = syscall(&mut emu, pid, 120, &[17]);
        guest_mem(&emu, pid).borrow_mut().write_u32(addr, 2);

        let child = emu.context(child_pid).unwrap();
        let child_mem = Rc::clone(&child.borrow().mem);
        assert_eq!(child_mem.borrow_mut().read_u32(addr), 1);
        assert_eq!(child.borrow().exit_signal, 17);

        // getppid in the child reports the parent; in the root, init.
        assert_eq!(syscall(&mut emu, child_pid, 64, &[]), pid);
        assert_eq!(syscall(&mut emu, pid, 64, &[]), 1);
    }

    #[test]
    #[should_panic(expected = "unsupported flags")]
    fn clone_with_unsupported_flag_is_fatal() {
        let (mut emu, pid) = setup();
        syscall(&mut emu, pid, 120, &[CloneFlags::NEWNS.bits()]);
    }

    #[test]
    fn clone_settls_installs_entry_six() {
        let (mut emu, pid) = setup();
        let uinfo_ptr = SCRATCH + 0x80;
        {
            let m = guest_mem(&emu, pid);
            let mut m = m.borrow_mut();
            m.write_u32(uinfo_ptr, 0xffff_ffff); // entry_number = -1
            m.write_u32(uinfo_ptr + 4, 0x1234_0000); // base
            m.write_u32(uinfo_ptr + 8, 0xfffff); // limit
            m.write_u32(uinfo_ptr + 12, 0x11); // seg_32bit | limit_in_pages
        }
        let flags = (CloneFlags::VM
            | CloneFlags::FS
            | CloneFlags::FILES
            | CloneFlags::SIGHAND
            | CloneFlags::SETTLS)
            .bits();
        // The user_desc pointer travels in esi (the unused clone arg slot).
        let child_pid = syscall(&mut emu, pid, 120, &[flags, 0, 0, uinfo_ptr]);

        assert_eq!(guest_mem(&emu, pid).borrow_mut().read_u32(uinfo_ptr), 6);
        let child = emu.context(child_pid).unwrap();
        let tls = child.borrow().tls.unwrap();
        assert_eq!(tls.base, 0x1234_0000);
        assert_eq!(tls.limit, 0xfffff << 12);
    }

    #[test]
    fn readlink_intercepts_proc_self_exe() {
        let (mut emu, pid) = setup();
        write_cstr(&emu, pid, SCRATCH, "/proc/self/exe");
        let buf_ptr = SCRATCH + 0x100;
        let ret = syscall(&mut emu, pid, 85, &[SCRATCH, buf_ptr, 100]);
        assert_eq!(ret, 8);
        let mut got = [0u8; 8];
        guest_mem(&emu, pid).borrow_mut().read(buf_ptr, &mut got);
        assert_eq!(&got, b"/tmp/app");
    }

    #[test]
    fn readlink_truncates_to_caller_buffer() {
        let (mut emu, pid) = setup();
        write_cstr(&emu, pid, SCRATCH, "/proc/self/exe");
        let ret = syscall(&mut emu, pid, 85, &[SCRATCH, SCRATCH + 0x100, 3]);
        assert_eq!(ret, 3);
        let mut got = [0u8; 3];
        guest_mem(&emu, pid).borrow_mut().read(SCRATCH + 0x100, &mut got);
        assert_eq!(&got, b"/tm");
    }

    #[test]
    fn open_close_restores_fd_table() {
        let (mut emu, pid) = setup();
        let path = format!("/tmp/vx86-test-open-{}", std::process::id());
        std::fs::write(&path, b"contents").unwrap();
        write_cstr(&emu, pid, SCRATCH, &path);

        let table = Rc::clone(&emu.context(pid).unwrap().borrow().fds);
        let before = table.borrow().len();
        let fd = syscall(&mut emu, pid, 5, &[SCRATCH, kernel_abi::O_RDONLY as u32, 0]);
        assert_eq!(fd, 3);
        assert_eq!(table.borrow().len(), before + 1);

        assert_eq!(syscall(&mut emu, pid, 6, &[fd as u32]), 0);
        assert_eq!(table.borrow().len(), before);
        assert_eq!(syscall(&mut emu, pid, 6, &[fd as u32]), -kernel_abi::EBADF);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn open_missing_file_reports_enoent() {
        let (mut emu, pid) = setup();
        write_cstr(&emu, pid, SCRATCH, "/tmp/vx86-no-such-file");
        assert_eq!(
            syscall(&mut emu, pid, 5, &[SCRATCH, 0, 0]),
            -kernel_abi::ENOENT
        );
    }

    #[test]
    fn dup_write_is_observable_through_original_fd() {
        let (mut emu, pid) = setup();
        let path = format!("/tmp/vx86-test-dup-{}", std::process::id());
        write_cstr(&emu, pid, SCRATCH, &path);
        let open_flags = (kernel_abi::O_RDWR | kernel_abi::O_CREAT) as u32;
        let fd1 = syscall(&mut emu, pid, 5, &[SCRATCH, open_flags, 0o600]);
        assert!(fd1 >= 3);
        let fd2 = syscall(&mut emu, pid, 41, &[fd1 as u32]);
        assert_eq!(fd2, fd1 + 1);

        let data_ptr = SCRATCH + 0x100;
        guest_mem(&emu, pid).borrow_mut().write(data_ptr, b"abc");
        assert_eq!(syscall(&mut emu, pid, 4, &[fd2 as u32, data_ptr, 3]), 3);

        // Dup'ed descriptors share the file offset: rewind through fd1.
        assert_eq!(syscall(&mut emu, pid, 19, &[fd1 as u32, 0, 0]), 0);
        let read_ptr = SCRATCH + 0x200;
        assert_eq!(syscall(&mut emu, pid, 3, &[fd1 as u32, read_ptr, 3]), 3);
        let mut got = [0u8; 3];
        guest_mem(&emu, pid).borrow_mut().read(read_ptr, &mut got);
        assert_eq!(&got, b"abc");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn setitimer_getitimer_round_trip() {
        let (mut emu, pid) = setup();
        let value = GuestItimerval {
            interval: GuestTimeval { sec: 0, usec: 500_000 },
            value: GuestTimeval { sec: 1, usec: 0 },
        };
        guest_mem(&emu, pid)
            .borrow_mut()
            .write(SCRATCH, &value.to_bytes());
        assert_eq!(syscall(&mut emu, pid, 104, &[0, SCRATCH, 0]), 0);

        let got_ptr = SCRATCH + 0x40;
        assert_eq!(syscall(&mut emu, pid, 105, &[0, got_ptr]), 0);
        let mut buf = [0u8; GuestItimerval::SIZE as usize];
        guest_mem(&emu, pid).borrow_mut().read(got_ptr, &mut buf);
        let got = GuestItimerval::from_bytes(&buf);
        assert_eq!(got.interval.total_usec(), 500_000);
        let remaining = got.value.total_usec();
        assert!(remaining > 900_000 && remaining <= 1_000_000);

        // Arming with the read-back value leaves an equivalent timer.
        assert_eq!(syscall(&mut emu, pid, 104, &[0, got_ptr, 0]), 0);
        let timer = emu.context(pid).unwrap().borrow().itimers[0];
        assert_eq!(timer.interval_us, 500_000);
        assert!(timer.expiry_us > 0);
    }

    #[test]
    #[should_panic(expected = "invalid 'which'")]
    fn setitimer_rejects_bad_which() {
        let (mut emu, pid) = setup();
        syscall(&mut emu, pid, 104, &[3, 0, 0]);
    }

    #[test]
    fn nanosleep_suspends_then_wakes_at_deadline() {
        let (mut emu, pid) = setup();
        let m = guest_mem(&emu, pid);
        m.borrow_mut().write_u32(SCRATCH, 0); // tv_sec
        m.borrow_mut().write_u32(SCRATCH + 4, 2_000_000); // 2ms in ns

        syscall(&mut emu, pid, 162, &[SCRATCH]);
        let ctx = emu.context(pid).unwrap();
        assert!(ctx.borrow().is_suspended());

        std::thread::sleep(std::time::Duration::from_millis(20));
        emu.process_events();
        assert!(ctx.borrow().is_running());
        assert_eq!(ctx.borrow().regs.syscall_result_signed(), 0);
    }

    #[test]
    fn poll_empty_pipe_times_out() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 42, &[SCRATCH]), 0);
        let read_fd = guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH);

        let pfds = SCRATCH + 0x100;
        let m = guest_mem(&emu, pid);
        m.borrow_mut().write_u32(pfds, read_fd);
        m.borrow_mut().write(pfds + 4, &POLLIN.to_le_bytes());

        syscall(&mut emu, pid, 168, &[pfds, 1, 1]); // 1ms timeout
        let ctx = emu.context(pid).unwrap();
        assert!(ctx.borrow().is_suspended());

        std::thread::sleep(std::time::Duration::from_millis(15));
        emu.process_events();
        assert!(ctx.borrow().is_running());
        assert_eq!(ctx.borrow().regs.syscall_result_signed(), 0);
    }

    #[test]
    fn poll_ready_pipe_reports_pollin() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 42, &[SCRATCH]), 0);
        let read_fd = guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH);
        let write_fd = guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH + 4);
        let host_write_fd = emu
            .context(pid)
            .unwrap()
            .borrow()
            .fds
            .borrow()
            .host_fd_of(write_fd as i32)
            .unwrap();
        unsafe { libc::write(host_write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        let pfds = SCRATCH + 0x100;
        let m = guest_mem(&emu, pid);
        m.borrow_mut().write_u32(pfds, read_fd);
        m.borrow_mut().write(pfds + 4, &POLLIN.to_le_bytes());

        assert_eq!(syscall(&mut emu, pid, 168, &[pfds, 1, 100]), 1);
        let mut revents = [0u8; 2];
        m.borrow_mut().read(pfds + 6, &mut revents);
        assert_eq!(i16::from_le_bytes(revents) & POLLIN, POLLIN);
    }

    #[test]
    fn select_reports_invalid_guest_fd() {
        let (mut emu, pid) = setup();
        // Bit 9 set, but guest fd 9 is not open.
        guest_mem(&emu, pid).borrow_mut().write(SCRATCH, &[0x00, 0x02]);
        assert_eq!(
            syscall(&mut emu, pid, 142, &[10, SCRATCH, 0, 0, 0]),
            -kernel_abi::EBADF
        );
    }

    #[test]
    fn select_translates_ready_fd_back_to_guest() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 42, &[SCRATCH + 0x80]), 0);
        let read_fd = guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH + 0x80);
        let write_fd = guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH + 0x84);
        let host_write_fd = emu
            .context(pid)
            .unwrap()
            .borrow()
            .fds
            .borrow()
            .host_fd_of(write_fd as i32)
            .unwrap();
        unsafe { libc::write(host_write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        let set_ptr = SCRATCH;
        guest_mem(&emu, pid)
            .borrow_mut()
            .write(set_ptr, &[1u8 << read_fd, 0]);
        let ret = syscall(&mut emu, pid, 142, &[read_fd + 1, set_ptr, 0, 0, 0]);
        assert_eq!(ret, 1);
        let mut byte = [0u8];
        guest_mem(&emu, pid).borrow_mut().read(set_ptr, &mut byte);
        assert_eq!(byte[0], 1 << read_fd);
    }

    #[test]
    #[should_panic(expected = "zero timeout")]
    fn blocking_select_is_fatal() {
        let (mut emu, pid) = setup();
        let tv = GuestTimeval { sec: 1, usec: 0 };
        guest_mem(&emu, pid)
            .borrow_mut()
            .write(SCRATCH + 0x40, &tv.to_bytes());
        syscall(&mut emu, pid, 142, &[0, 0, 0, 0, SCRATCH + 0x40]);
    }

    #[test]
    fn kill_delivers_to_guest_handler_and_sigreturn_restores() {
        let (mut emu, pid) = setup();
        let child_pid = syscall(&mut emu, pid, 120, &[17]);
        let child = emu.context(child_pid).unwrap();
        {
            let mut c = child.borrow_mut();
            c.regs.esp = SCRATCH + 0x800;
            c.regs.eip = 0x4000;
            c.signals.handlers.borrow_mut().set_action(
                10,
                SigAction {
                    handler: 0x5000,
                    flags: 0,
                    mask: 0,
                },
            );
        }

        assert_eq!(syscall(&mut emu, pid, 37, &[child_pid as u32, 10]), 0);
        {
            let c = child.borrow();
            assert_eq!(c.regs.eip, 0x5000);
            assert_eq!(c.regs.esp, SCRATCH + 0x800 - 8);
            assert!(c.signals.blocked.contains(10));
            assert!(!c.signals.pending.contains(10));
        }
        // The signal number sits above the fake return address.
        let child_mem = Rc::clone(&child.borrow().mem);
        assert_eq!(child_mem.borrow_mut().read_u32(SCRATCH + 0x800 - 4), 10);

        // sigreturn pops the frame saved at delivery.
        syscall(&mut emu, child_pid, 119, &[]);
        let c = child.borrow();
        assert_eq!(c.regs.eip, 0x4000);
        assert_eq!(c.regs.esp, SCRATCH + 0x800);
        assert!(!c.signals.blocked.contains(10));
    }

    #[test]
    #[should_panic(expected = "invalid pid")]
    fn kill_of_unknown_pid_is_fatal() {
        let (mut emu, pid) = setup();
        syscall(&mut emu, pid, 37, &[9999, 9]);
    }

    #[test]
    fn newuname_reports_emulated_machine() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 122, &[SCRATCH]), 0);
        let mut buf = [0u8; 390];
        guest_mem(&emu, pid).borrow_mut().read(SCRATCH, &mut buf);
        assert_eq!(&buf[0..5], b"Linux");
        assert_eq!(&buf[4 * 65..4 * 65 + 4], b"i686");
    }

    #[test]
    fn mprotect_updates_page_permissions() {
        let (mut emu, pid) = setup();
        assert_eq!(
            syscall(&mut emu, pid, 125, &[SCRATCH, MEM_PAGE_SIZE, ProtFlags::READ.bits()]),
            0
        );
        assert_eq!(
            guest_mem(&emu, pid).borrow().page_perms(SCRATCH),
            Some(Access::READ)
        );
    }

    #[test]
    fn mremap_grows_in_place_and_relocates() {
        let (mut emu, pid) = setup();
        let flags = (MapFlags::ANONYMOUS | MapFlags::PRIVATE | MapFlags::FIXED).bits();
        let base = syscall(
            &mut emu,
            pid,
            192,
            &[0x5000_0000, 0x1000, 0x3, flags, -1i32 as u32, 0],
        ) as u32;
        assert_eq!(base, 0x5000_0000);
        guest_mem(&emu, pid).borrow_mut().write_u32(base, 0x1234_5678);

        // Space above is free: grow in place.
        let grown = syscall(&mut emu, pid, 163, &[base, 0x1000, 0x2000, 1]);
        assert_eq!(grown as u32, base);

        // Block the space above, then grow again: the region must move and
        // carry its contents.
        guest_mem(&emu, pid)
            .borrow_mut()
            .map(base + 0x2000, MEM_PAGE_SIZE, Access::READ);
        let moved = syscall(&mut emu, pid, 163, &[base, 0x2000, 0x3000, 1]) as u32;
        assert_ne!(moved, base);
        assert!(!guest_mem(&emu, pid).borrow().is_mapped(base));
        assert_eq!(guest_mem(&emu, pid).borrow_mut().read_u32(moved), 0x1234_5678);
    }

    #[test]
    fn getdents_repacks_directory_entries() {
        let (mut emu, pid) = setup();
        let dir = format!("/tmp/vx86-test-dir-{}", std::process::id());
        let _ = std::fs::create_dir(&dir);
        std::fs::write(format!("{}/hello.txt", dir), b"x").unwrap();

        write_cstr(&emu, pid, SCRATCH, &dir);
        let fd = syscall(&mut emu, pid, 5, &[SCRATCH, kernel_abi::O_RDONLY as u32, 0]);
        assert!(fd >= 3);

        let dirent_ptr = SCRATCH + 0x400;
        let nbytes = syscall(&mut emu, pid, 141, &[fd as u32, dirent_ptr, 1024]);
        assert!(nbytes > 0);
        assert_eq!(nbytes % 4, 0);

        let mut buf = vec![0u8; nbytes as usize];
        guest_mem(&emu, pid).borrow_mut().read(dirent_ptr, &mut buf);
        let names = String::from_utf8_lossy(&buf).into_owned();
        assert!(names.contains("hello.txt"));

        std::fs::remove_file(format!("{}/hello.txt", dir)).unwrap();
        std::fs::remove_dir(&dir).unwrap();
    }

    #[test]
    fn fcntl64_setfl_updates_guest_flags() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 42, &[SCRATCH]), 0);
        let read_fd = guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH);

        // F_SETFL O_NONBLOCK, then F_GETFL sees it on the host side too.
        assert!(syscall(&mut emu, pid, 221, &[read_fd, 4, kernel_abi::O_NONBLOCK as u32]) >= 0);
        let table = Rc::clone(&emu.context(pid).unwrap().borrow().fds);
        assert_eq!(
            table.borrow().entry_get(read_fd as i32).unwrap().flags,
            kernel_abi::O_NONBLOCK
        );
        let host_flags = syscall(&mut emu, pid, 221, &[read_fd, 3, 0]);
        assert!(host_flags & kernel_abi::O_NONBLOCK != 0);

        // A non-blocking read of the empty pipe now fails with EAGAIN
        // instead of suspending.
        assert_eq!(
            syscall(&mut emu, pid, 3, &[read_fd, SCRATCH + 0x100, 4]),
            -kernel_abi::EAGAIN
        );
    }

    #[test]
    fn set_thread_area_assigns_and_updates_entry_six() {
        let (mut emu, pid) = setup();
        let m = guest_mem(&emu, pid);
        m.borrow_mut().write_u32(SCRATCH, 0xffff_ffff);
        m.borrow_mut().write_u32(SCRATCH + 4, 0x0800_0000);
        m.borrow_mut().write_u32(SCRATCH + 8, 0x100);
        m.borrow_mut().write_u32(SCRATCH + 12, 0x1); // seg_32bit

        assert_eq!(syscall(&mut emu, pid, 243, &[SCRATCH]), 0);
        assert_eq!(m.borrow_mut().read_u32(SCRATCH), 6);
        let ctx = emu.context(pid).unwrap();
        assert_eq!(ctx.borrow().tls.unwrap().base, 0x0800_0000);

        // Updating through entry 6 is allowed once installed.
        m.borrow_mut().write_u32(SCRATCH, 6);
        m.borrow_mut().write_u32(SCRATCH + 4, 0x0900_0000);
        assert_eq!(syscall(&mut emu, pid, 243, &[SCRATCH]), 0);
        assert_eq!(ctx.borrow().tls.unwrap().base, 0x0900_0000);
    }

    #[test]
    fn execve_trampoline_runs_shell_command_natively() {
        let (mut emu, pid) = setup();
        write_cstr(&emu, pid, SCRATCH, "/bin/sh");
        write_cstr(&emu, pid, SCRATCH + 0x20, "sh");
        write_cstr(&emu, pid, SCRATCH + 0x30, "-c");
        write_cstr(&emu, pid, SCRATCH + 0x40, "exit 7");
        let m = guest_mem(&emu, pid);
        let argv_ptr = SCRATCH + 0x60;
        m.borrow_mut().write_u32(argv_ptr, SCRATCH + 0x20);
        m.borrow_mut().write_u32(argv_ptr + 4, SCRATCH + 0x30);
        m.borrow_mut().write_u32(argv_ptr + 8, SCRATCH + 0x40);
        m.borrow_mut().write_u32(argv_ptr + 12, 0);
        let envp_ptr = SCRATCH + 0x80;
        m.borrow_mut().write_u32(envp_ptr, 0);

        syscall(&mut emu, pid, 11, &[SCRATCH, argv_ptr, envp_ptr]);
        // The root context has no reaper; it exits with the command's code
        // and vanishes.
        assert_eq!(emu.context_count(), 0);
    }

    #[test]
    fn time_and_gettimeofday_agree() {
        let (mut emu, pid) = setup();
        let t = syscall(&mut emu, pid, 13, &[SCRATCH]);
        assert!(t > 0);
        assert_eq!(guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH), t as u32);

        assert_eq!(syscall(&mut emu, pid, 78, &[SCRATCH + 0x10, 0]), 0);
        let sec = guest_mem(&emu, pid).borrow_mut().read_u32(SCRATCH + 0x10);
        assert!((i64::from(sec) - i64::from(t)).abs() <= 1);
    }

    #[test]
    fn times_fills_guest_tms() {
        let (mut emu, pid) = setup();
        let ret = syscall(&mut emu, pid, 43, &[SCRATCH]);
        assert!(ret >= 0);
        // All four words were written (values may legitimately be zero).
        let mut buf = [0u8; GuestTms::SIZE as usize];
        guest_mem(&emu, pid).borrow_mut().read(SCRATCH, &mut buf);
    }

    #[test]
    fn getrlimit_reports_loader_stack_size() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 191, &[3, SCRATCH]), 0);
        let mut buf = [0u8; GuestRlimit::SIZE as usize];
        guest_mem(&emu, pid).borrow_mut().read(SCRATCH, &mut buf);
        let rlimit = GuestRlimit::from_bytes(&buf);
        assert_eq!(rlimit.cur, 0x80_0000);
        assert_eq!(rlimit.max, 0xffff_ffff);
    }

    #[test]
    fn setrlimit_ignores_data_and_stack() {
        let (mut emu, pid) = setup();
        let rlimit = GuestRlimit { cur: 1, max: 2 };
        guest_mem(&emu, pid)
            .borrow_mut()
            .write(SCRATCH, &rlimit.to_bytes());
        assert_eq!(syscall(&mut emu, pid, 75, &[2, SCRATCH]), 0);
        assert_eq!(syscall(&mut emu, pid, 75, &[3, SCRATCH]), 0);
    }

    #[test]
    fn getrusage_writes_eighteen_words() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 77, &[0, SCRATCH]), 0);
        let mut buf = [0u8; GuestRusage::SIZE as usize];
        guest_mem(&emu, pid).borrow_mut().read(SCRATCH, &mut buf);
    }

    #[test]
    fn msync_is_accepted_and_ignored() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 144, &[SCRATCH, 0x1000, 4]), 0);
    }

    #[test]
    #[should_panic(expected = "not implemented for cmd")]
    fn non_termios_ioctl_is_fatal() {
        let (mut emu, pid) = setup();
        syscall(&mut emu, pid, 54, &[0, 0x1234, 0]);
    }

    #[test]
    #[should_panic(expected = "not implemented")]
    fn unknown_syscall_number_is_fatal() {
        let (mut emu, pid) = setup();
        syscall(&mut emu, pid, 9, &[]); // link: in range, not in the set
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_syscall_number_is_fatal() {
        let (mut emu, pid) = setup();
        syscall(&mut emu, pid, 400, &[]);
    }

    #[test]
    fn proc_self_maps_is_a_virtual_file_unlinked_on_close() {
        let (mut emu, pid) = setup();
        write_cstr(&emu, pid, SCRATCH, "/proc/self/maps");
        let fd = syscall(&mut emu, pid, 5, &[SCRATCH, kernel_abi::O_RDONLY as u32, 0]);
        assert!(fd >= 3);

        let (kind, temp_path) = {
            let ctx = emu.context(pid).unwrap();
            let c = ctx.borrow();
            let table = c.fds.borrow();
            let entry = table.entry_get(fd).unwrap();
            (entry.kind, entry.path.clone())
        };
        assert_eq!(kind, FdKind::Virtual);
        assert!(std::path::Path::new(&temp_path).exists());

        // The snapshot lists the scratch page with its permissions.
        let contents = std::fs::read_to_string(&temp_path).unwrap();
        assert!(contents.contains("30000000-30001000 rw-p"));

        assert_eq!(syscall(&mut emu, pid, 6, &[fd as u32]), 0);
        assert!(!std::path::Path::new(&temp_path).exists());
    }

    #[test]
    fn getpid_reports_context_pid() {
        let (mut emu, pid) = setup();
        assert_eq!(syscall(&mut emu, pid, 20, &[]), pid);
    }

    #[test]
    fn itimer_expiry_queues_sigalrm() {
        let (mut emu, pid) = setup();
        let value = GuestItimerval {
            interval: GuestTimeval::default(),
            value: GuestTimeval { sec: 0, usec: 1_000 },
        };
        guest_mem(&emu, pid)
            .borrow_mut()
            .write(SCRATCH, &value.to_bytes());
        assert_eq!(syscall(&mut emu, pid, 104, &[0, SCRATCH, 0]), 0);

        std::thread::sleep(std::time::Duration::from_millis(10));
        // No handler installed: the expiry queues SIGALRM, delivery with
        // the default disposition discards it, and the timer disarms.
        emu.process_events();
        let ctx = emu.context(pid).unwrap();
        assert_eq!(ctx.borrow().itimers[0].expiry_us, 0);
        assert!(!ctx.borrow().signals.pending.contains(crate::signal::SIGALRM));
    }
}
