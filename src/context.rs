//! Per-guest-thread emulator state.
//!
//! A `Context` is one guest thread of execution: its register file plus
//! handles to the resources it may share with clones (address space, file
//! descriptor table, signal handler table). Parent and thread-group links
//! are pids into the emulator's context arena; a lookup that misses plays
//! the role of a dead weak reference.

use crate::fd_table::{FdTable, FdTableSharedPtr};
use crate::memory::{Memory, MemorySharedPtr};
use crate::registers::Registers;
use crate::signal::{SignalHandlerTableSharedPtr, SignalState};
use libc::pid_t;
use std::cell::RefCell;
use std::rc::Rc;

pub type ContextSharedPtr = Rc<RefCell<Context>>;

pub const ITIMER_REAL: u32 = 0;
pub const ITIMER_VIRTUAL: u32 = 1;
pub const ITIMER_PROF: u32 = 2;
pub const ITIMER_COUNT: usize = 3;

/// One interval timer slot. `expiry_us` is an absolute time in the
/// emulator's monotonic µs domain; zero means disarmed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Itimer {
    pub expiry_us: u64,
    pub interval_us: u64,
}

/// Why a suspended context is waiting, carrying the blocking call's
/// arguments so the event loop can test the wake condition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wakeup {
    /// Blocking read: wake when the host fd reports `events`.
    Read { fd: i32, events: i16 },
    /// Blocking write: wake when the host fd is writable.
    Write { fd: i32 },
    /// `waitpid`: wake when a matching child turns zombie (-1 = any).
    WaitPid { pid: pid_t },
    /// Wake on any deliverable signal.
    Signal,
    /// `nanosleep` until the absolute deadline.
    Nanosleep { deadline_us: u64 },
    /// Single-fd `poll`: readiness or deadline, whichever first. Deadline
    /// zero means no timeout. `pfds_ptr` is the guest `pollfd` array, where
    /// `revents` is written on wake.
    Poll {
        pfds_ptr: u32,
        fd: i32,
        events: i16,
        deadline_us: u64,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    Running,
    Suspended(Wakeup),
    /// Exited; retained with its exit code until the parent reaps it.
    Zombie(i32),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlsSegment {
    pub base: u32,
    pub limit: u32,
}

pub struct Context {
    pub pid: pid_t,
    /// None for the root context (its `getppid` reports 1).
    pub parent: Option<pid_t>,
    /// Thread-group leader for `CLONE_THREAD` clones; None outside a group.
    pub group_parent: Option<pid_t>,
    pub regs: Registers,
    pub mem: MemorySharedPtr,
    pub fds: FdTableSharedPtr,
    pub signals: SignalState,
    pub state: RunState,
    pub itimers: [Itimer; ITIMER_COUNT],
    /// TLS segment installed by `set_thread_area` or `CLONE_SETTLS`;
    /// GDT entry number 6 by convention.
    pub tls: Option<TlsSegment>,
    /// Guest address zeroed on exit (`CLONE_CHILD_CLEARTID`), or 0.
    pub clear_child_tid: u32,
    /// Signal delivered to the parent at exit; 0 for thread-group clones.
    pub exit_signal: i32,
}

impl Context {
    pub fn new(
        pid: pid_t,
        mem: MemorySharedPtr,
        fds: FdTableSharedPtr,
        handlers: SignalHandlerTableSharedPtr,
    ) -> Context {
        Context {
            pid,
            parent: None,
            group_parent: None,
            regs: Registers::default(),
            mem,
            fds,
            signals: SignalState::new(handlers),
            state: RunState::Running,
            itimers: [Itimer::default(); ITIMER_COUNT],
            tls: None,
            clear_child_tid: 0,
            exit_signal: 0,
        }
    }

    pub fn shared(self) -> ContextSharedPtr {
        Rc::new(RefCell::new(self))
    }

    /// `CLONE_VM` child: shares the address space, fd table and signal
    /// handler table with the caller; registers are copied.
    pub fn clone_sharing(&self, pid: pid_t) -> Context {
        let mut child = Context::new(
            pid,
            Rc::clone(&self.mem),
            Rc::clone(&self.fds),
            Rc::clone(&self.signals.handlers),
        );
        child.parent = Some(self.pid);
        child.regs = self.regs;
        child.tls = self.tls;
        child
    }

    /// fork-style child: deep copies of the address space and fd table,
    /// private signal handler table.
    pub fn fork_copying(&self, pid: pid_t) -> Context {
        let mem = self.mem.borrow().duplicate().shared();
        let fds = self.fds.borrow().duplicate().shared();
        let handlers = self.signals.handlers.borrow().duplicate().shared();
        let mut child = Context::new(pid, mem, fds, handlers);
        child.parent = Some(self.pid);
        child.regs = self.regs;
        child.tls = self.tls;
        child
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, RunState::Suspended(_))
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state, RunState::Zombie(_))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            RunState::Zombie(code) => Some(code),
            _ => None,
        }
    }

    pub fn suspend(&mut self, cause: Wakeup) {
        debug_assert!(self.is_running());
        self.state = RunState::Suspended(cause);
    }

    pub fn wake(&mut self) {
        debug_assert!(self.is_suspended());
        self.state = RunState::Running;
    }

    /// The context every `CLONE_THREAD` sibling points at: the caller's
    /// group parent, or the caller itself when it leads the group.
    pub fn thread_group_leader(&self) -> pid_t {
        self.group_parent.unwrap_or(self.pid)
    }

    /// Does this context's exit satisfy a `waitpid(pid, ...)` by `parent`?
    pub fn reapable_by(&self, parent: pid_t, pid_filter: pid_t) -> bool {
        self.is_zombie()
            && self.parent == Some(parent)
            && (pid_filter == -1 || pid_filter == self.pid)
    }
}

/// Shared handles used when creating the root context.
pub fn root_resources() -> (MemorySharedPtr, FdTableSharedPtr, SignalHandlerTableSharedPtr) {
    (
        Memory::new().shared(),
        FdTable::new().shared(),
        crate::signal::SignalHandlerTable::new().shared(),
    )
}
