//! The emulator kernel: context arena, monotonic timer, and the event loop
//! that wakes suspended contexts.
//!
//! Scheduling is cooperative and single-threaded: exactly one context is
//! current while a syscall is serviced, and no handler is re-entered. The
//! only parallelism is the host waker thread, which blocks on the union of
//! the host fds that suspended contexts wait on (plus the earliest timer
//! deadline) and communicates with the scheduler solely by flipping the
//! scheduled-events flag. Cancelling its wait is done through a self-pipe.

use crate::context::{Context, ContextSharedPtr, Itimer, RunState, Wakeup, ITIMER_COUNT};
use crate::fd_table::FdTable;
use crate::kernel_abi::{self, assert_host_guest_matches, POLLOUT};
use crate::log::LogLevel::LogDebug;
use crate::memory::Memory;
use crate::signal::{self, SignalHandlerTable, SIG_DFL, SIG_IGN};
use crate::syscall;
use libc::pid_t;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{close, pipe, read as pipe_read, write as pipe_write};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

/// What the (external) loader tells the syscall layer about the program it
/// placed in guest memory.
pub struct LoaderInfo {
    pub exe_path: String,
    pub cwd: PathBuf,
    pub stack_size: u32,
}

const FIRST_PID: pid_t = 100;

pub struct Emu {
    contexts: BTreeMap<pid_t, ContextSharedPtr>,
    next_pid: pid_t,
    start: Instant,
    pub loader: LoaderInfo,
    scheduled: Arc<AtomicBool>,
    waker: Waker,
}

impl Emu {
    pub fn new(loader: LoaderInfo) -> Emu {
        assert_host_guest_matches();
        let scheduled = Arc::new(AtomicBool::new(false));
        Emu {
            contexts: BTreeMap::new(),
            next_pid: FIRST_PID,
            start: Instant::now(),
            loader,
            scheduled: Arc::clone(&scheduled),
            waker: Waker::spawn(scheduled),
        }
    }

    /// Monotonic emulator time in microseconds; the domain interval timers
    /// and sleep deadlines are expressed in.
    pub fn timer_us(&self) -> u64 {
        let elapsed = self.start.elapsed();
        elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros())
    }

    pub fn new_pid(&mut self) -> pid_t {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Create the initial context with fresh resources. The loader populates
    /// its memory and registers afterwards.
    pub fn create_root_context(&mut self) -> pid_t {
        let pid = self.new_pid();
        let ctx = Context::new(
            pid,
            Memory::new().shared(),
            FdTable::new().shared(),
            SignalHandlerTable::new().shared(),
        );
        log!(LogDebug, "root context created with pid {}", pid);
        self.contexts.insert(pid, ctx.shared());
        pid
    }

    pub fn register_context(&mut self, ctx: Context) -> ContextSharedPtr {
        let pid = ctx.pid;
        let shared = ctx.shared();
        self.contexts.insert(pid, Rc::clone(&shared));
        shared
    }

    pub fn context(&self, pid: pid_t) -> Option<ContextSharedPtr> {
        self.contexts.get(&pid).cloned()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Resolve a guest-supplied path against the loader's working directory.
    pub fn full_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            self.loader.cwd.join(path).to_string_lossy().into_owned()
        }
    }

    /// Ask the scheduler to run [`Emu::process_events`] at the next
    /// opportunity, interrupting any in-flight host wait.
    pub fn schedule_events(&mut self) {
        self.scheduled.store(true, Ordering::SeqCst);
        self.waker.cancel();
    }

    pub fn events_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Exit path shared by `exit`, the execve trampoline and fatal teardown:
    /// clear the child-tid word, go zombie (or vanish when nobody can reap),
    /// notify the parent, and deal with our own children.
    pub fn finish_context(&mut self, pid: pid_t, exit_code: i32) {
        let ctx = match self.context(pid) {
            Some(ctx) => ctx,
            None => fatal!("finish of unknown context {}", pid),
        };

        let (parent, exit_signal) = {
            let mut c = ctx.borrow_mut();
            if c.clear_child_tid != 0 {
                let addr = c.clear_child_tid;
                c.mem.borrow_mut().write_u32(addr, 0);
                c.clear_child_tid = 0;
            }
            c.state = RunState::Zombie(exit_code);
            (c.parent, c.exit_signal)
        };
        log!(
            LogDebug,
            "context {} finished with code {} (exit signal {})",
            pid,
            exit_code,
            signal::signal_name(exit_signal)
        );

        let parent_alive = parent.map_or(false, |p| {
            self.context(p).map_or(false, |c| !c.borrow().is_zombie())
        });
        if parent_alive {
            if exit_signal != 0 {
                let parent_ctx = self.context(parent.unwrap()).unwrap();
                parent_ctx.borrow_mut().signals.pending.add(exit_signal);
            }
        } else {
            // Nobody will ever reap this context.
            self.contexts.remove(&pid);
        }

        // Zombie children are discarded with their reaper; running children
        // are orphaned and report parent pid 1 from now on.
        let children: Vec<pid_t> = self
            .contexts
            .values()
            .filter(|c| c.borrow().parent == Some(pid))
            .map(|c| c.borrow().pid)
            .collect();
        for child in children {
            let child_ctx = self.context(child).unwrap();
            let zombie = child_ctx.borrow().is_zombie();
            if zombie {
                self.contexts.remove(&child);
            } else {
                child_ctx.borrow_mut().parent = None;
            }
        }

        self.schedule_events();
    }

    pub fn find_zombie(&self, parent: pid_t, pid_filter: pid_t) -> Option<ContextSharedPtr> {
        self.contexts
            .values()
            .find(|c| c.borrow().reapable_by(parent, pid_filter))
            .cloned()
    }

    /// Remove a reaped zombie from the arena. Its pid is never reused.
    pub fn reap(&mut self, pid: pid_t) {
        debug_assert!(self
            .context(pid)
            .map_or(false, |c| c.borrow().is_zombie()));
        self.contexts.remove(&pid);
    }

    /// Re-examine every suspended context against its wake condition, fire
    /// expired interval timers, deliver pending signals, and re-arm the host
    /// waker for whatever is still outstanding.
    pub fn process_events(&mut self) {
        self.scheduled.store(false, Ordering::SeqCst);
        let now = self.timer_us();
        let pids: Vec<pid_t> = self.contexts.keys().cloned().collect();

        for pid in pids {
            let ctx = match self.context(pid) {
                Some(ctx) => ctx,
                None => continue, // removed by an earlier wake this pass
            };
            self.fire_itimers(&ctx, now);

            let state = ctx.borrow().state;
            let cause = match state {
                RunState::Suspended(cause) => cause,
                _ => {
                    self.deliver_signals(&ctx);
                    continue;
                }
            };

            let signal_ready = ctx.borrow().signals.deliverable().is_some();
            match cause {
                Wakeup::Read { fd, events } => {
                    if signal_ready {
                        self.wake_with_eintr(&ctx);
                    } else if self.guest_fd_ready(&ctx, fd, events) {
                        log!(LogDebug, "context {} wakes from blocking read", pid);
                        ctx.borrow_mut().wake();
                        syscall::dispatch(self, pid);
                    }
                }
                Wakeup::Write { fd } => {
                    if signal_ready {
                        self.wake_with_eintr(&ctx);
                    } else if self.guest_fd_ready(&ctx, fd, POLLOUT) {
                        log!(LogDebug, "context {} wakes from blocking write", pid);
                        ctx.borrow_mut().wake();
                        syscall::dispatch(self, pid);
                    }
                }
                Wakeup::WaitPid { pid: filter } => {
                    if signal_ready {
                        self.wake_with_eintr(&ctx);
                    } else if self.find_zombie(pid, filter).is_some() {
                        ctx.borrow_mut().wake();
                        syscall::dispatch(self, pid);
                    }
                }
                Wakeup::Nanosleep { deadline_us } => {
                    if signal_ready {
                        self.wake_with_eintr(&ctx);
                    } else if now >= deadline_us {
                        let mut c = ctx.borrow_mut();
                        c.wake();
                        c.regs.set_syscall_result(0);
                    }
                }
                Wakeup::Poll {
                    pfds_ptr,
                    fd,
                    events,
                    deadline_us,
                } => {
                    let revents = self.guest_fd_revents(&ctx, fd, events);
                    if signal_ready {
                        self.wake_with_eintr(&ctx);
                    } else if revents != 0 {
                        let mut c = ctx.borrow_mut();
                        c.mem
                            .borrow_mut()
                            .write(pfds_ptr + 6, &revents.to_le_bytes());
                        c.wake();
                        c.regs.set_syscall_result(1);
                    } else if deadline_us != 0 && now >= deadline_us {
                        let mut c = ctx.borrow_mut();
                        c.mem.borrow_mut().write(pfds_ptr + 6, &0u16.to_le_bytes());
                        c.wake();
                        c.regs.set_syscall_result(0);
                    }
                }
                Wakeup::Signal => {
                    if signal_ready {
                        ctx.borrow_mut().wake();
                    }
                }
            }

            if let Some(ctx) = self.context(pid) {
                self.deliver_signals(&ctx);
            }
        }

        self.rearm_waker();
    }

    /// Interrupted-by-signal wake: the blocked call reports `-EINTR` and the
    /// signal is delivered on top of that return.
    fn wake_with_eintr(&mut self, ctx: &ContextSharedPtr) {
        let mut c = ctx.borrow_mut();
        c.wake();
        c.regs.set_syscall_result(-kernel_abi::EINTR);
    }

    fn fire_itimers(&self, ctx: &ContextSharedPtr, now: u64) {
        let mut c = ctx.borrow_mut();
        if c.is_zombie() {
            return;
        }
        for which in 0..ITIMER_COUNT {
            let Itimer {
                expiry_us,
                interval_us,
            } = c.itimers[which];
            if expiry_us == 0 || now < expiry_us {
                continue;
            }
            let sig = match which as u32 {
                crate::context::ITIMER_REAL => signal::SIGALRM,
                crate::context::ITIMER_VIRTUAL => signal::SIGVTALRM,
                _ => signal::SIGPROF,
            };
            log!(
                LogDebug,
                "itimer {} of context {} expired, queueing {}",
                which,
                c.pid,
                signal::signal_name(sig)
            );
            c.signals.pending.add(sig);
            c.itimers[which].expiry_us = if interval_us > 0 {
                let mut next = expiry_us + interval_us;
                while next <= now {
                    next += interval_us;
                }
                next
            } else {
                0
            };
        }
    }

    /// Deliver at most one pending unblocked signal to a running context:
    /// save the interrupted register file, push the signal number as the
    /// handler argument, and redirect execution to the guest handler.
    /// `SIG_IGN` and (for this surface) `SIG_DFL` discard the signal.
    fn deliver_signals(&self, ctx: &ContextSharedPtr) {
        let mut c = ctx.borrow_mut();
        if !c.is_running() {
            return;
        }
        while let Some(sig) = c.signals.deliverable() {
            c.signals.pending.remove(sig);
            let action = c.signals.handlers.borrow().action(sig);
            match action.handler {
                SIG_IGN => {}
                SIG_DFL => log!(
                    LogDebug,
                    "context {}: {} with default disposition discarded",
                    c.pid,
                    signal::signal_name(sig)
                ),
                handler => {
                    log!(
                        LogDebug,
                        "context {}: delivering {} to handler {:#010x}",
                        c.pid,
                        signal::signal_name(sig),
                        handler
                    );
                    let interrupted = c.regs;
                    c.signals.push_handler_frame(interrupted, sig);
                    c.signals.blocked.add(sig);
                    let sp = c.regs.esp.wrapping_sub(8);
                    {
                        let mem = Rc::clone(&c.mem);
                        let mut mem = mem.borrow_mut();
                        mem.write_u32(sp, 0); // return lands in the sigreturn trampoline
                        mem.write_u32(sp + 4, sig as u32);
                    }
                    c.regs.esp = sp;
                    c.regs.eip = handler;
                    break;
                }
            }
        }
    }

    fn guest_fd_ready(&self, ctx: &ContextSharedPtr, guest_fd: i32, events: i16) -> bool {
        self.guest_fd_revents(ctx, guest_fd, events) != 0
    }

    fn guest_fd_revents(&self, ctx: &ContextSharedPtr, guest_fd: i32, events: i16) -> i16 {
        let host_fd = match ctx.borrow().fds.borrow().host_fd_of(guest_fd) {
            Some(fd) => fd,
            // The fd was closed while the context slept; wake it so the
            // retried call can report the error.
            None => return libc::POLLNVAL,
        };
        poll_host_fd(host_fd, events)
    }

    fn rearm_waker(&mut self) {
        let mut fds: Vec<(RawFd, i16)> = Vec::new();
        let mut deadline: Option<u64> = None;
        let mut track_deadline = |d: u64, deadline: &mut Option<u64>| {
            if d != 0 {
                *deadline = Some(deadline.map_or(d, |cur: u64| cur.min(d)));
            }
        };

        for ctx in self.contexts.values() {
            let c = ctx.borrow();
            if c.is_zombie() {
                continue;
            }
            for timer in &c.itimers {
                track_deadline(timer.expiry_us, &mut deadline);
            }
            let host_of = |fd: i32| c.fds.borrow().host_fd_of(fd);
            match c.state {
                RunState::Suspended(Wakeup::Read { fd, events }) => {
                    if let Some(host_fd) = host_of(fd) {
                        fds.push((host_fd, events));
                    }
                }
                RunState::Suspended(Wakeup::Write { fd }) => {
                    if let Some(host_fd) = host_of(fd) {
                        fds.push((host_fd, POLLOUT));
                    }
                }
                RunState::Suspended(Wakeup::Poll {
                    fd,
                    events,
                    deadline_us,
                    ..
                }) => {
                    if let Some(host_fd) = host_of(fd) {
                        fds.push((host_fd, events));
                    }
                    track_deadline(deadline_us, &mut deadline);
                }
                RunState::Suspended(Wakeup::Nanosleep { deadline_us }) => {
                    track_deadline(deadline_us, &mut deadline);
                }
                _ => {}
            }
        }

        if fds.is_empty() && deadline.is_none() {
            self.waker.cancel();
            return;
        }
        let timeout_ms = match deadline {
            // Round up so we never wake a hair before the deadline.
            Some(d) => (d.saturating_sub(self.timer_us()) / 1000 + 1).min(i32::max_value() as u64) as i32,
            None => -1,
        };
        self.waker.arm(fds, timeout_ms);
    }
}

impl Drop for Emu {
    fn drop(&mut self) {
        self.waker.shutdown();
    }
}

/// Zero-timeout poll of one host fd; returns the revents mask (0 = not
/// ready). Handlers use this for the non-blocking fast path before deciding
/// to suspend.
pub(crate) fn poll_host_fd(host_fd: i32, events: i16) -> i16 {
    let mut pfd = libc::pollfd {
        fd: host_fd,
        events,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 0) };
    if n < 0 {
        fatal!(
            "host poll of fd {} failed: {}",
            host_fd,
            std::io::Error::last_os_error()
        );
    }
    if n == 0 {
        0
    } else {
        pfd.revents
    }
}

/*
 * Host waker thread.
 */

struct WakeRequest {
    generation: u64,
    fds: Vec<(RawFd, i16)>,
    timeout_ms: i32,
    armed: bool,
    shutdown: bool,
}

struct WakerShared {
    scheduled: Arc<AtomicBool>,
    request: Mutex<WakeRequest>,
    cond: Condvar,
}

struct Waker {
    shared: Arc<WakerShared>,
    pipe_write: RawFd,
    thread: Option<thread::JoinHandle<()>>,
}

impl Waker {
    fn spawn(scheduled: Arc<AtomicBool>) -> Waker {
        let (pipe_r, pipe_w) = pipe().expect("waker self-pipe");
        fcntl(pipe_r, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).expect("waker pipe flags");
        let shared = Arc::new(WakerShared {
            scheduled,
            request: Mutex::new(WakeRequest {
                generation: 0,
                fds: Vec::new(),
                timeout_ms: -1,
                armed: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("vx86-waker".to_string())
            .spawn(move || waker_thread(thread_shared, pipe_r))
            .expect("waker thread");
        Waker {
            shared,
            pipe_write: pipe_w,
            thread: Some(thread),
        }
    }

    fn poke(&self) {
        let _ = pipe_write(self.pipe_write, &[1u8]);
        self.shared.cond.notify_one();
    }

    fn arm(&self, fds: Vec<(RawFd, i16)>, timeout_ms: i32) {
        {
            let mut req = self.shared.request.lock().unwrap();
            req.generation += 1;
            req.fds = fds;
            req.timeout_ms = timeout_ms;
            req.armed = true;
        }
        self.poke();
    }

    fn cancel(&self) {
        {
            let mut req = self.shared.request.lock().unwrap();
            req.generation += 1;
            req.armed = false;
        }
        self.poke();
    }

    fn shutdown(&mut self) {
        {
            let mut req = self.shared.request.lock().unwrap();
            req.generation += 1;
            req.shutdown = true;
        }
        self.poke();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = close(self.pipe_write);
    }
}

fn waker_thread(shared: Arc<WakerShared>, pipe_r: RawFd) {
    loop {
        let (generation, fds, timeout_ms) = {
            let mut req = shared.request.lock().unwrap();
            loop {
                if req.shutdown {
                    let _ = close(pipe_r);
                    return;
                }
                if req.armed {
                    break;
                }
                req = shared.cond.wait(req).unwrap();
            }
            (req.generation, req.fds.clone(), req.timeout_ms)
        };

        // Drain stale pokes first: a byte left over from the arm/cancel that
        // produced this request must not cut the fresh wait short. A poke
        // arriving after this point still interrupts the poll, and the
        // generation check below tells it apart from real readiness.
        let mut buf = [0u8; 64];
        while let Ok(n) = pipe_read(pipe_r, &mut buf) {
            if n < buf.len() {
                break;
            }
        }

        let mut pollfds = vec![PollFd::new(pipe_r, PollFlags::POLLIN)];
        for (fd, events) in &fds {
            pollfds.push(PollFd::new(
                *fd,
                PollFlags::from_bits_truncate(*events as libc::c_short),
            ));
        }
        let _ = poll(&mut pollfds, timeout_ms);

        let mut req = shared.request.lock().unwrap();
        if req.generation == generation && !req.shutdown {
            // Readiness or deadline, not a cancellation: hand control back.
            req.armed = false;
            shared.scheduled.store(true, Ordering::SeqCst);
            log!(LogDebug, "host waker observed readiness, events scheduled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_loader() -> LoaderInfo {
        LoaderInfo {
            exe_path: "/tmp/app".to_string(),
            cwd: PathBuf::from("/tmp"),
            stack_size: 0x800000,
        }
    }

    #[test]
    fn pids_are_unique_and_monotonic() {
        let mut emu = Emu::new(test_loader());
        let a = emu.create_root_context();
        let b = emu.new_pid();
        assert!(b > a);
        emu.finish_context(a, 0);
        // A finished root has no reaper and is gone; its pid is not reused.
        assert_eq!(emu.context_count(), 0);
        assert!(emu.new_pid() > b);
    }

    #[test]
    fn timer_is_monotonic_microseconds() {
        let emu = Emu::new(test_loader());
        let a = emu.timer_us();
        thread::sleep(Duration::from_millis(2));
        let b = emu.timer_us();
        assert!(b >= a + 1_000);
    }

    #[test]
    fn full_path_resolves_against_loader_cwd() {
        let emu = Emu::new(test_loader());
        assert_eq!(emu.full_path("/etc/hosts"), "/etc/hosts");
        assert_eq!(emu.full_path("data.txt"), "/tmp/data.txt");
    }

    #[test]
    fn zombie_reaping_lifecycle() {
        let mut emu = Emu::new(test_loader());
        let parent = emu.create_root_context();
        let child_pid = emu.new_pid();
        let child = {
            let parent_ctx = emu.context(parent).unwrap();
            let c = parent_ctx.borrow();
            c.fork_copying(child_pid)
        };
        emu.register_context(child);
        assert_eq!(emu.context_count(), 2);

        emu.finish_context(child_pid, 5);
        let zombie = emu.find_zombie(parent, -1).expect("zombie child");
        assert_eq!(zombie.borrow().exit_code(), Some(5));
        assert!(emu.find_zombie(parent, 999).is_none());

        emu.reap(child_pid);
        assert!(emu.context(child_pid).is_none());
        assert_eq!(emu.context_count(), 1);
    }

    #[test]
    fn parent_exit_discards_zombie_children_and_orphans_runners() {
        let mut emu = Emu::new(test_loader());
        let parent = emu.create_root_context();
        let (zombie_pid, runner_pid) = (emu.new_pid(), emu.new_pid());
        {
            let parent_ctx = emu.context(parent).unwrap();
            let z = parent_ctx.borrow().fork_copying(zombie_pid);
            let r = parent_ctx.borrow().fork_copying(runner_pid);
            emu.register_context(z);
            emu.register_context(r);
        }
        emu.finish_context(zombie_pid, 0);
        emu.finish_context(parent, 0);

        assert!(emu.context(zombie_pid).is_none());
        let runner = emu.context(runner_pid).unwrap();
        assert_eq!(runner.borrow().parent, None);
    }

    #[test]
    fn exit_signal_lands_in_parent_pending_set() {
        let mut emu = Emu::new(test_loader());
        let parent = emu.create_root_context();
        let child_pid = emu.new_pid();
        {
            let parent_ctx = emu.context(parent).unwrap();
            let mut child = parent_ctx.borrow().fork_copying(child_pid);
            child.exit_signal = 17; // SIGCHLD
            emu.register_context(child);
        }
        emu.finish_context(child_pid, 0);
        let parent_ctx = emu.context(parent).unwrap();
        assert!(parent_ctx.borrow().signals.pending.contains(17));
    }

    #[test]
    fn waker_deadline_schedules_events() {
        let mut emu = Emu::new(test_loader());
        emu.waker.arm(Vec::new(), 1);
        thread::sleep(Duration::from_millis(60));
        assert!(emu.events_scheduled());
        emu.process_events();
        assert!(!emu.events_scheduled());
    }

    #[test]
    fn waker_cancel_suppresses_wake() {
        let emu = Emu::new(test_loader());
        emu.waker.arm(Vec::new(), 10_000);
        emu.waker.cancel();
        thread::sleep(Duration::from_millis(30));
        assert!(!emu.events_scheduled());
    }
}
