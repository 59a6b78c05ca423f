//! Guest-visible ABI: constant values and struct layouts.
//!
//! The guest is always little-endian 32-bit x86, regardless of the host, so
//! every structure that crosses the guest-memory boundary is marshalled
//! to/from explicit byte images here instead of being transmuted. Constants
//! whose host and guest values are required to coincide are checked once at
//! emulator startup by [`assert_host_guest_matches`]; values known (or
//! likely) to differ are translated explicitly by the handlers.

use crate::string_map::StringMap;
use static_assertions::const_assert_eq;

/*
 * Guest errno codes (Linux 2.6 x86). The guest C library inspects the sign
 * of the syscall return value; `-1..-4095` encodes these.
 */

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const ENXIO: i32 = 6;
pub const E2BIG: i32 = 7;
pub const ENOEXEC: i32 = 8;
pub const EBADF: i32 = 9;
pub const ECHILD: i32 = 10;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EACCES: i32 = 13;
pub const EFAULT: i32 = 14;
pub const ENOTBLK: i32 = 15;
pub const EBUSY: i32 = 16;
pub const EEXIST: i32 = 17;
pub const EXDEV: i32 = 18;
pub const ENODEV: i32 = 19;
pub const ENOTDIR: i32 = 20;
pub const EISDIR: i32 = 21;
pub const EINVAL: i32 = 22;
pub const ENFILE: i32 = 23;
pub const EMFILE: i32 = 24;
pub const ENOTTY: i32 = 25;
pub const ETXTBSY: i32 = 26;
pub const EFBIG: i32 = 27;
pub const ENOSPC: i32 = 28;
pub const ESPIPE: i32 = 29;
pub const EROFS: i32 = 30;
pub const EMLINK: i32 = 31;
pub const EPIPE: i32 = 32;
pub const EDOM: i32 = 33;
pub const ERANGE: i32 = 34;

pub static ERRNO_MAP: StringMap = StringMap(&[
    ("EPERM", 1),
    ("ENOENT", 2),
    ("ESRCH", 3),
    ("EINTR", 4),
    ("EIO", 5),
    ("ENXIO", 6),
    ("E2BIG", 7),
    ("ENOEXEC", 8),
    ("EBADF", 9),
    ("ECHILD", 10),
    ("EAGAIN", 11),
    ("ENOMEM", 12),
    ("EACCES", 13),
    ("EFAULT", 14),
    ("ENOTBLK", 15),
    ("EBUSY", 16),
    ("EEXIST", 17),
    ("EXDEV", 18),
    ("ENODEV", 19),
    ("ENOTDIR", 20),
    ("EISDIR", 21),
    ("EINVAL", 22),
    ("ENFILE", 23),
    ("EMFILE", 24),
    ("ENOTTY", 25),
    ("ETXTBSY", 26),
    ("EFBIG", 27),
    ("ENOSPC", 28),
    ("ESPIPE", 29),
    ("EROFS", 30),
    ("EMLINK", 31),
    ("EPIPE", 32),
    ("EDOM", 33),
    ("ERANGE", 34),
]);

/// Translate a host errno into the guest encoding. The startup assertions
/// guarantee the low range is identical; anything outside it has no guest
/// counterpart and is reported as `EINVAL` rather than leaked verbatim.
pub fn guest_errno_from_host(host: i32) -> i32 {
    if (1..=34).contains(&host) {
        host
    } else {
        EINVAL
    }
}

/*
 * Open flags, guest encoding (identical to the Linux x86 ABI).
 */

pub const O_RDONLY: i32 = 0o0;
pub const O_WRONLY: i32 = 0o1;
pub const O_RDWR: i32 = 0o2;
pub const O_CREAT: i32 = 0o100;
pub const O_EXCL: i32 = 0o200;
pub const O_TRUNC: i32 = 0o1000;
pub const O_APPEND: i32 = 0o2000;
pub const O_NONBLOCK: i32 = 0o4000;

pub static OPEN_FLAGS_MAP: StringMap = StringMap(&[
    ("O_RDONLY", 0o0),
    ("O_WRONLY", 0o1),
    ("O_RDWR", 0o2),
    ("O_CREAT", 0o100),
    ("O_EXCL", 0o200),
    ("O_NOCTTY", 0o400),
    ("O_TRUNC", 0o1000),
    ("O_APPEND", 0o2000),
    ("O_NONBLOCK", 0o4000),
    ("O_SYNC", 0o10000),
    ("FASYNC", 0o20000),
    ("O_DIRECT", 0o40000),
    ("O_LARGEFILE", 0o100000),
    ("O_DIRECTORY", 0o200000),
    ("O_NOFOLLOW", 0o400000),
    ("O_NOATIME", 0o1000000),
]);

/*
 * waitpid options and access modes.
 */

pub const WNOHANG: u32 = 0x1;

pub static WAITPID_OPTIONS_MAP: StringMap = StringMap(&[
    ("WNOHANG", 0x00000001),
    ("WUNTRACED", 0x00000002),
    ("WEXITED", 0x00000004),
    ("WCONTINUED", 0x00000008),
    ("WNOWAIT", 0x01000000),
    ("WNOTHREAD", 0x20000000),
    ("WALL", 0x40000000),
    ("WCLONE", 0x80000000),
]);

pub static ACCESS_MODE_MAP: StringMap = StringMap(&[("X_OK", 1), ("W_OK", 2), ("R_OK", 4)]);

/*
 * mmap protection and flags, guest encoding.
 */

bitflags! {
    pub struct ProtFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

pub static MMAP_PROT_MAP: StringMap = StringMap(&[
    ("PROT_READ", 0x1),
    ("PROT_WRITE", 0x2),
    ("PROT_EXEC", 0x4),
    ("PROT_SEM", 0x8),
    ("PROT_GROWSDOWN", 0x01000000),
    ("PROT_GROWSUP", 0x02000000),
]);

pub static MMAP_FLAGS_MAP: StringMap = StringMap(&[
    ("MAP_SHARED", 0x01),
    ("MAP_PRIVATE", 0x02),
    ("MAP_FIXED", 0x10),
    ("MAP_ANONYMOUS", 0x20),
    ("MAP_GROWSDOWN", 0x00100),
    ("MAP_DENYWRITE", 0x00800),
    ("MAP_EXECUTABLE", 0x01000),
    ("MAP_LOCKED", 0x02000),
    ("MAP_NORESERVE", 0x04000),
    ("MAP_POPULATE", 0x08000),
    ("MAP_NONBLOCK", 0x10000),
]);

/// `mremap` flag: the only supported relocation policy.
pub const MREMAP_MAYMOVE: u32 = 0x1;

/*
 * clone flags, guest encoding. The exit signal rides in the low byte of the
 * flags word and is stripped before these bits are inspected.
 */

bitflags! {
    pub struct CloneFlags: u32 {
        const VM = 0x00000100;
        const FS = 0x00000200;
        const FILES = 0x00000400;
        const SIGHAND = 0x00000800;
        const PTRACE = 0x00002000;
        const VFORK = 0x00004000;
        const PARENT = 0x00008000;
        const THREAD = 0x00010000;
        const NEWNS = 0x00020000;
        const SYSVSEM = 0x00040000;
        const SETTLS = 0x00080000;
        const PARENT_SETTID = 0x00100000;
        const CHILD_CLEARTID = 0x00200000;
        const DETACHED = 0x00400000;
        const UNTRACED = 0x00800000;
        const CHILD_SETTID = 0x01000000;
        const STOPPED = 0x02000000;
        const NEWUTS = 0x04000000;
        const NEWIPC = 0x08000000;
        const NEWUSER = 0x10000000;
        const NEWPID = 0x20000000;
        const NEWNET = 0x40000000;
        const IO = 0x80000000;
    }
}

impl CloneFlags {
    /// The subset this emulator implements; anything else is fatal.
    pub fn supported() -> CloneFlags {
        CloneFlags::VM
            | CloneFlags::FS
            | CloneFlags::FILES
            | CloneFlags::SIGHAND
            | CloneFlags::THREAD
            | CloneFlags::SYSVSEM
            | CloneFlags::SETTLS
            | CloneFlags::PARENT_SETTID
            | CloneFlags::CHILD_CLEARTID
            | CloneFlags::CHILD_SETTID
    }
}

pub static CLONE_FLAGS_MAP: StringMap = StringMap(&[
    ("CLONE_VM", 0x00000100),
    ("CLONE_FS", 0x00000200),
    ("CLONE_FILES", 0x00000400),
    ("CLONE_SIGHAND", 0x00000800),
    ("CLONE_PTRACE", 0x00002000),
    ("CLONE_VFORK", 0x00004000),
    ("CLONE_PARENT", 0x00008000),
    ("CLONE_THREAD", 0x00010000),
    ("CLONE_NEWNS", 0x00020000),
    ("CLONE_SYSVSEM", 0x00040000),
    ("CLONE_SETTLS", 0x00080000),
    ("CLONE_PARENT_SETTID", 0x00100000),
    ("CLONE_CHILD_CLEARTID", 0x00200000),
    ("CLONE_DETACHED", 0x00400000),
    ("CLONE_UNTRACED", 0x00800000),
    ("CLONE_CHILD_SETTID", 0x01000000),
    ("CLONE_STOPPED", 0x02000000),
    ("CLONE_NEWUTS", 0x04000000),
    ("CLONE_NEWIPC", 0x08000000),
    ("CLONE_NEWUSER", 0x10000000),
    ("CLONE_NEWPID", 0x20000000),
    ("CLONE_NEWNET", 0x40000000),
    ("CLONE_IO", 0x80000000),
]);

/*
 * Misc trace tables.
 */

pub static RLIMIT_RESOURCE_MAP: StringMap = StringMap(&[
    ("RLIMIT_CPU", 0),
    ("RLIMIT_FSIZE", 1),
    ("RLIMIT_DATA", 2),
    ("RLIMIT_STACK", 3),
    ("RLIMIT_CORE", 4),
    ("RLIMIT_RSS", 5),
    ("RLIMIT_NPROC", 6),
    ("RLIMIT_NOFILE", 7),
    ("RLIMIT_MEMLOCK", 8),
    ("RLIMIT_AS", 9),
    ("RLIMIT_LOCKS", 10),
    ("RLIMIT_SIGPENDING", 11),
    ("RLIMIT_MSGQUEUE", 12),
    ("RLIMIT_NICE", 13),
    ("RLIMIT_RTPRIO", 14),
    ("RLIM_NLIMITS", 15),
]);

pub static ITIMER_WHICH_MAP: StringMap = StringMap(&[
    ("ITIMER_REAL", 0),
    ("ITIMER_VIRTUAL", 1),
    ("ITIMER_PROF", 2),
]);

pub static SOCKETCALL_CALL_MAP: StringMap = StringMap(&[
    ("SYS_SOCKET", 1),
    ("SYS_BIND", 2),
    ("SYS_CONNECT", 3),
    ("SYS_LISTEN", 4),
    ("SYS_ACCEPT", 5),
    ("SYS_GETSOCKNAME", 6),
    ("SYS_GETPEERNAME", 7),
    ("SYS_SOCKETPAIR", 8),
    ("SYS_SEND", 9),
    ("SYS_RECV", 10),
    ("SYS_SENDTO", 11),
    ("SYS_RECVFROM", 12),
    ("SYS_SHUTDOWN", 13),
    ("SYS_SETSOCKOPT", 14),
    ("SYS_GETSOCKOPT", 15),
    ("SYS_SENDMSG", 16),
    ("SYS_RECVMSG", 17),
]);

pub static SOCKET_FAMILY_MAP: StringMap = StringMap(&[
    ("PF_UNSPEC", 0),
    ("PF_UNIX", 1),
    ("PF_INET", 2),
    ("PF_AX25", 3),
    ("PF_IPX", 4),
    ("PF_APPLETALK", 5),
    ("PF_NETROM", 6),
    ("PF_BRIDGE", 7),
    ("PF_ATMPVC", 8),
    ("PF_X25", 9),
    ("PF_INET6", 10),
    ("PF_NETLINK", 16),
    ("PF_PACKET", 17),
    ("PF_BLUETOOTH", 31),
]);

pub static SOCKET_TYPE_MAP: StringMap = StringMap(&[
    ("SOCK_STREAM", 1),
    ("SOCK_DGRAM", 2),
    ("SOCK_RAW", 3),
    ("SOCK_RDM", 4),
    ("SOCK_SEQPACKET", 5),
    ("SOCK_DCCP", 6),
    ("SOCK_PACKET", 10),
]);

pub static FCNTL_CMD_MAP: StringMap = StringMap(&[
    ("F_DUPFD", 0),
    ("F_GETFD", 1),
    ("F_SETFD", 2),
    ("F_GETFL", 3),
    ("F_SETFL", 4),
    ("F_GETLK", 5),
    ("F_SETLK", 6),
    ("F_SETLKW", 7),
    ("F_SETOWN", 8),
    ("F_GETOWN", 9),
    ("F_SETSIG", 10),
    ("F_GETSIG", 11),
    ("F_GETLK64", 12),
    ("F_SETLK64", 13),
    ("F_SETLKW64", 14),
]);

pub static MSYNC_FLAGS_MAP: StringMap =
    StringMap(&[("MS_ASYNC", 1), ("MS_INVALIDATE", 2), ("MS_SYNC", 4)]);

/*
 * Poll events (guest == host on Linux; asserted at startup).
 */

pub const POLLIN: i16 = 0x1;
pub const POLLOUT: i16 = 0x4;

/*
 * Guest struct layouts. All little-endian 32-bit words unless noted.
 */

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(w)
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GuestTimeval {
    pub sec: u32,
    pub usec: u32,
}

impl GuestTimeval {
    pub const SIZE: u32 = 8;

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&self.sec.to_le_bytes());
        b[4..8].copy_from_slice(&self.usec.to_le_bytes());
        b
    }

    pub fn from_bytes(bytes: &[u8]) -> GuestTimeval {
        GuestTimeval {
            sec: u32_at(bytes, 0),
            usec: u32_at(bytes, 4),
        }
    }

    pub fn total_usec(&self) -> u64 {
        u64::from(self.sec) * 1_000_000 + u64::from(self.usec)
    }

    pub fn from_usec(usec: u64) -> GuestTimeval {
        GuestTimeval {
            sec: (usec / 1_000_000) as u32,
            usec: (usec % 1_000_000) as u32,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GuestItimerval {
    pub interval: GuestTimeval,
    pub value: GuestTimeval,
}

impl GuestItimerval {
    pub const SIZE: u32 = 16;

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..8].copy_from_slice(&self.interval.to_bytes());
        b[8..16].copy_from_slice(&self.value.to_bytes());
        b
    }

    pub fn from_bytes(bytes: &[u8]) -> GuestItimerval {
        GuestItimerval {
            interval: GuestTimeval::from_bytes(&bytes[0..8]),
            value: GuestTimeval::from_bytes(&bytes[8..16]),
        }
    }
}

const_assert_eq!(GuestItimerval::SIZE, 2 * GuestTimeval::SIZE);

#[derive(Copy, Clone, Debug, Default)]
pub struct GuestTms {
    pub utime: u32,
    pub stime: u32,
    pub cutime: u32,
    pub cstime: u32,
}

impl GuestTms {
    pub const SIZE: u32 = 16;

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&self.utime.to_le_bytes());
        b[4..8].copy_from_slice(&self.stime.to_le_bytes());
        b[8..12].copy_from_slice(&self.cutime.to_le_bytes());
        b[12..16].copy_from_slice(&self.cstime.to_le_bytes());
        b
    }

    pub fn from_host(host: &libc::tms) -> GuestTms {
        GuestTms {
            utime: host.tms_utime as u32,
            stime: host.tms_stime as u32,
            cutime: host.tms_cutime as u32,
            cstime: host.tms_cstime as u32,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct GuestRlimit {
    pub cur: u32,
    pub max: u32,
}

impl GuestRlimit {
    pub const SIZE: u32 = 8;

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&self.cur.to_le_bytes());
        b[4..8].copy_from_slice(&self.max.to_le_bytes());
        b
    }

    pub fn from_bytes(bytes: &[u8]) -> GuestRlimit {
        GuestRlimit {
            cur: u32_at(bytes, 0),
            max: u32_at(bytes, 4),
        }
    }
}

/// Eighteen 32-bit words, in field order of the 32-bit `struct rusage`.
#[derive(Copy, Clone, Debug, Default)]
pub struct GuestRusage {
    pub utime: GuestTimeval,
    pub stime: GuestTimeval,
    pub maxrss: u32,
    pub ixrss: u32,
    pub idrss: u32,
    pub isrss: u32,
    pub minflt: u32,
    pub majflt: u32,
    pub nswap: u32,
    pub inblock: u32,
    pub oublock: u32,
    pub msgsnd: u32,
    pub msgrcv: u32,
    pub nsignals: u32,
    pub nvcsw: u32,
    pub nivcsw: u32,
}

impl GuestRusage {
    pub const SIZE: u32 = 72;

    pub fn to_bytes(&self) -> [u8; 72] {
        let words = [
            self.utime.sec,
            self.utime.usec,
            self.stime.sec,
            self.stime.usec,
            self.maxrss,
            self.ixrss,
            self.idrss,
            self.isrss,
            self.minflt,
            self.majflt,
            self.nswap,
            self.inblock,
            self.oublock,
            self.msgsnd,
            self.msgrcv,
            self.nsignals,
            self.nvcsw,
            self.nivcsw,
        ];
        let mut b = [0u8; 72];
        for (i, w) in words.iter().enumerate() {
            b[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        b
    }

    pub fn from_host(host: &libc::rusage) -> GuestRusage {
        GuestRusage {
            utime: GuestTimeval {
                sec: host.ru_utime.tv_sec as u32,
                usec: host.ru_utime.tv_usec as u32,
            },
            stime: GuestTimeval {
                sec: host.ru_stime.tv_sec as u32,
                usec: host.ru_stime.tv_usec as u32,
            },
            maxrss: host.ru_maxrss as u32,
            ixrss: host.ru_ixrss as u32,
            idrss: host.ru_idrss as u32,
            isrss: host.ru_isrss as u32,
            minflt: host.ru_minflt as u32,
            majflt: host.ru_majflt as u32,
            nswap: host.ru_nswap as u32,
            inblock: host.ru_inblock as u32,
            oublock: host.ru_oublock as u32,
            msgsnd: host.ru_msgsnd as u32,
            msgrcv: host.ru_msgrcv as u32,
            nsignals: host.ru_nsignals as u32,
            nvcsw: host.ru_nvcsw as u32,
            nivcsw: host.ru_nivcsw as u32,
        }
    }
}

const_assert_eq!(GuestRusage::SIZE, 18 * 4);

#[derive(Copy, Clone, Debug, Default)]
pub struct GuestUtimbuf {
    pub actime: u32,
    pub modtime: u32,
}

impl GuestUtimbuf {
    pub const SIZE: u32 = 8;

    pub fn from_bytes(bytes: &[u8]) -> GuestUtimbuf {
        GuestUtimbuf {
            actime: u32_at(bytes, 0),
            modtime: u32_at(bytes, 4),
        }
    }
}

/// TLS segment descriptor as passed to `set_thread_area` and `clone` with
/// `CLONE_SETTLS`. Three 32-bit words followed by one bitfield word; the
/// bitfields are declared LSB-first as a 32-bit GCC guest lays them out.
#[derive(Copy, Clone, Debug, Default)]
pub struct GuestUserDesc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub flags: u32,
}

impl GuestUserDesc {
    pub const SIZE: u32 = 16;

    pub fn from_bytes(bytes: &[u8]) -> GuestUserDesc {
        GuestUserDesc {
            entry_number: u32_at(bytes, 0),
            base_addr: u32_at(bytes, 4),
            limit: u32_at(bytes, 8),
            flags: u32_at(bytes, 12),
        }
    }

    pub fn seg_32bit(&self) -> bool {
        self.flags & 0x1 != 0
    }

    pub fn contents(&self) -> u32 {
        (self.flags >> 1) & 0x3
    }

    pub fn read_exec_only(&self) -> bool {
        self.flags & 0x8 != 0
    }

    pub fn limit_in_pages(&self) -> bool {
        self.flags & 0x10 != 0
    }

    pub fn seg_not_present(&self) -> bool {
        self.flags & 0x20 != 0
    }

    pub fn useable(&self) -> bool {
        self.flags & 0x40 != 0
    }
}

/// Six fixed 65-byte NUL-padded fields.
pub struct GuestUtsname {
    pub sysname: &'static str,
    pub nodename: &'static str,
    pub release: &'static str,
    pub version: &'static str,
    pub machine: &'static str,
    pub domainname: &'static str,
}

impl GuestUtsname {
    pub const FIELD_SIZE: usize = 65;
    pub const SIZE: u32 = 390;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(Self::SIZE as usize);
        for field in &[
            self.sysname,
            self.nodename,
            self.release,
            self.version,
            self.machine,
            self.domainname,
        ] {
            let mut cell = [0u8; Self::FIELD_SIZE];
            let src = field.as_bytes();
            debug_assert!(src.len() < Self::FIELD_SIZE);
            cell[..src.len()].copy_from_slice(src);
            b.extend_from_slice(&cell);
        }
        b
    }
}

const_assert_eq!(GuestUtsname::SIZE as usize, 6 * GuestUtsname::FIELD_SIZE);

/// Guest `dirent` record length: 32-bit d_ino + 32-bit d_off + 16-bit
/// d_reclen + name + NUL + trailing d_type byte, rounded up to 4 bytes.
pub fn dirent_reclen(name_len: usize) -> u16 {
    ((15 + name_len) / 4 * 4) as u16
}

/*
 * Startup host/guest agreement checks.
 */

macro_rules! host_guest_match {
    ($host:expr, $guest:expr) => {
        if ($host) as i64 != ($guest) as i64 {
            fatal!(
                "host/guest constant mismatch: {} is {} on this host, guest expects {}",
                stringify!($host),
                $host,
                $guest
            );
        }
    };
}

/// Assert that every constant the handlers pass through untranslated has the
/// same value on this host as in the guest ABI. A mismatch halts startup;
/// this is what removes per-call translation of the common values.
pub fn assert_host_guest_matches() {
    host_guest_match!(libc::EPERM, EPERM);
    host_guest_match!(libc::ENOENT, ENOENT);
    host_guest_match!(libc::ESRCH, ESRCH);
    host_guest_match!(libc::EINTR, EINTR);
    host_guest_match!(libc::EIO, EIO);
    host_guest_match!(libc::ENXIO, ENXIO);
    host_guest_match!(libc::E2BIG, E2BIG);
    host_guest_match!(libc::ENOEXEC, ENOEXEC);
    host_guest_match!(libc::EBADF, EBADF);
    host_guest_match!(libc::ECHILD, ECHILD);
    host_guest_match!(libc::EAGAIN, EAGAIN);
    host_guest_match!(libc::ENOMEM, ENOMEM);
    host_guest_match!(libc::EACCES, EACCES);
    host_guest_match!(libc::EFAULT, EFAULT);
    host_guest_match!(libc::ENOTBLK, ENOTBLK);
    host_guest_match!(libc::EBUSY, EBUSY);
    host_guest_match!(libc::EEXIST, EEXIST);
    host_guest_match!(libc::EXDEV, EXDEV);
    host_guest_match!(libc::ENODEV, ENODEV);
    host_guest_match!(libc::ENOTDIR, ENOTDIR);
    host_guest_match!(libc::EISDIR, EISDIR);
    host_guest_match!(libc::EINVAL, EINVAL);
    host_guest_match!(libc::ENFILE, ENFILE);
    host_guest_match!(libc::EMFILE, EMFILE);
    host_guest_match!(libc::ENOTTY, ENOTTY);
    host_guest_match!(libc::ETXTBSY, ETXTBSY);
    host_guest_match!(libc::EFBIG, EFBIG);
    host_guest_match!(libc::ENOSPC, ENOSPC);
    host_guest_match!(libc::ESPIPE, ESPIPE);
    host_guest_match!(libc::EROFS, EROFS);
    host_guest_match!(libc::EMLINK, EMLINK);
    host_guest_match!(libc::EPIPE, EPIPE);
    host_guest_match!(libc::EDOM, EDOM);
    host_guest_match!(libc::ERANGE, ERANGE);

    host_guest_match!(libc::PROT_READ, ProtFlags::READ.bits());
    host_guest_match!(libc::PROT_WRITE, ProtFlags::WRITE.bits());
    host_guest_match!(libc::PROT_EXEC, ProtFlags::EXEC.bits());
    host_guest_match!(libc::MAP_SHARED, MapFlags::SHARED.bits());
    host_guest_match!(libc::MAP_PRIVATE, MapFlags::PRIVATE.bits());
    host_guest_match!(libc::MAP_FIXED, MapFlags::FIXED.bits());
    host_guest_match!(libc::MAP_ANONYMOUS, MapFlags::ANONYMOUS.bits());

    host_guest_match!(libc::O_RDONLY, O_RDONLY);
    host_guest_match!(libc::O_WRONLY, O_WRONLY);
    host_guest_match!(libc::O_RDWR, O_RDWR);
    host_guest_match!(libc::O_CREAT, O_CREAT);
    host_guest_match!(libc::O_EXCL, O_EXCL);
    host_guest_match!(libc::O_TRUNC, O_TRUNC);
    host_guest_match!(libc::O_APPEND, O_APPEND);
    host_guest_match!(libc::O_NONBLOCK, O_NONBLOCK);

    host_guest_match!(libc::POLLIN, POLLIN);
    host_guest_match!(libc::POLLOUT, POLLOUT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_matches_guest_on_this_platform() {
        assert_host_guest_matches();
    }

    #[test]
    fn timeval_round_trip() {
        let tv = GuestTimeval { sec: 3, usec: 250_000 };
        assert_eq!(GuestTimeval::from_bytes(&tv.to_bytes()), tv);
        assert_eq!(tv.total_usec(), 3_250_000);
        assert_eq!(GuestTimeval::from_usec(3_250_000), tv);
    }

    #[test]
    fn itimerval_layout() {
        let it = GuestItimerval {
            interval: GuestTimeval { sec: 1, usec: 2 },
            value: GuestTimeval { sec: 3, usec: 4 },
        };
        let b = it.to_bytes();
        // it_interval first, then it_value, each (sec, usec).
        assert_eq!(&b[0..4], &1u32.to_le_bytes());
        assert_eq!(&b[12..16], &4u32.to_le_bytes());
        assert_eq!(GuestItimerval::from_bytes(&b), it);
    }

    #[test]
    fn user_desc_bitfields() {
        let desc = GuestUserDesc {
            entry_number: !0,
            base_addr: 0x1000,
            limit: 0xfffff,
            flags: 0b101_0001,
        };
        assert!(desc.seg_32bit());
        assert_eq!(desc.contents(), 0);
        assert!(!desc.read_exec_only());
        assert!(desc.limit_in_pages());
        assert!(!desc.seg_not_present());
        assert!(desc.useable());
    }

    #[test]
    fn dirent_reclen_rounds_to_word() {
        // 11 fixed bytes (ino, off, reclen, NUL, d_type) + name.
        assert_eq!(dirent_reclen(1), 16);
        assert_eq!(dirent_reclen(5), 20);
        assert_eq!(dirent_reclen(8), 20);
    }

    #[test]
    fn utsname_is_six_fixed_fields() {
        let uts = GuestUtsname {
            sysname: "Linux",
            nodename: "n",
            release: "r",
            version: "v",
            machine: "i686",
            domainname: "",
        };
        let b = uts.to_bytes();
        assert_eq!(b.len(), 390);
        assert_eq!(&b[0..5], b"Linux");
        assert_eq!(b[5], 0);
        assert_eq!(&b[65..66], b"n");
    }

    #[test]
    fn unknown_host_errno_becomes_einval() {
        assert_eq!(guest_errno_from_host(9), EBADF);
        assert_eq!(guest_errno_from_host(125), EINVAL);
    }
}
