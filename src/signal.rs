//! Signal surface consumed by the syscall layer and the event loop.
//!
//! Full delivery semantics (frame setup, sigaltstack, restorers) belong to
//! the signal subsystem proper; what lives here is the state the syscall
//! handlers touch: pending/blocked sets, the guest handler table shared by
//! `CLONE_SIGHAND` clones, and the saved-register stack that `sigreturn`
//! pops.

use crate::registers::Registers;
use crate::string_map::StringMap;
use std::cell::RefCell;
use std::rc::Rc;

pub const SIGALRM: i32 = 14;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;

pub static SIGNAL_NAME_MAP: StringMap = StringMap(&[
    ("SIGHUP", 1),
    ("SIGINT", 2),
    ("SIGQUIT", 3),
    ("SIGILL", 4),
    ("SIGTRAP", 5),
    ("SIGABRT", 6),
    ("SIGBUS", 7),
    ("SIGFPE", 8),
    ("SIGKILL", 9),
    ("SIGUSR1", 10),
    ("SIGSEGV", 11),
    ("SIGUSR2", 12),
    ("SIGPIPE", 13),
    ("SIGALRM", 14),
    ("SIGTERM", 15),
    ("SIGSTKFLT", 16),
    ("SIGCHLD", 17),
    ("SIGCONT", 18),
    ("SIGSTOP", 19),
    ("SIGTSTP", 20),
    ("SIGTTIN", 21),
    ("SIGTTOU", 22),
    ("SIGURG", 23),
    ("SIGXCPU", 24),
    ("SIGXFSZ", 25),
    ("SIGVTALRM", 26),
    ("SIGPROF", 27),
    ("SIGWINCH", 28),
    ("SIGIO", 29),
    ("SIGPWR", 30),
    ("SIGSYS", 31),
]);

pub fn signal_name(sig: i32) -> String {
    if sig == 0 {
        return "none".to_string();
    }
    SIGNAL_NAME_MAP.value_str(sig as u32)
}

/// Set of guest signals 1..=64, one bit per signal.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SigSet(u64);

impl SigSet {
    pub fn empty() -> SigSet {
        SigSet(0)
    }

    fn bit(sig: i32) -> u64 {
        debug_assert!((1..=64).contains(&sig));
        1u64 << (sig - 1)
    }

    pub fn add(&mut self, sig: i32) {
        self.0 |= Self::bit(sig);
    }

    pub fn remove(&mut self, sig: i32) {
        self.0 &= !Self::bit(sig);
    }

    pub fn contains(&self, sig: i32) -> bool {
        self.0 & Self::bit(sig) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered signal present and not masked by `blocked`.
    pub fn first_deliverable(&self, blocked: SigSet) -> Option<i32> {
        let ready = self.0 & !blocked.0;
        if ready == 0 {
            None
        } else {
            Some(ready.trailing_zeros() as i32 + 1)
        }
    }
}

/// Guest handler address conventions.
pub const SIG_DFL: u32 = 0;
pub const SIG_IGN: u32 = 1;

#[derive(Copy, Clone, Debug, Default)]
pub struct SigAction {
    /// Guest address of the handler, or `SIG_DFL`/`SIG_IGN`.
    pub handler: u32,
    pub flags: u32,
    pub mask: u64,
}

/// One disposition per signal; shared between `CLONE_SIGHAND` clones.
pub struct SignalHandlerTable {
    actions: [SigAction; 64],
}

pub type SignalHandlerTableSharedPtr = Rc<RefCell<SignalHandlerTable>>;

impl SignalHandlerTable {
    pub fn new() -> SignalHandlerTable {
        SignalHandlerTable {
            actions: [SigAction::default(); 64],
        }
    }

    pub fn shared(self) -> SignalHandlerTableSharedPtr {
        Rc::new(RefCell::new(self))
    }

    pub fn action(&self, sig: i32) -> SigAction {
        self.actions[(sig - 1) as usize]
    }

    pub fn set_action(&mut self, sig: i32, action: SigAction) {
        self.actions[(sig - 1) as usize] = action;
    }

    pub fn duplicate(&self) -> SignalHandlerTable {
        SignalHandlerTable {
            actions: self.actions,
        }
    }
}

impl Default for SignalHandlerTable {
    fn default() -> SignalHandlerTable {
        SignalHandlerTable::new()
    }
}

/// Per-context signal state. Pending and blocked masks are never shared;
/// the handler table may be.
pub struct SignalState {
    pub pending: SigSet,
    pub blocked: SigSet,
    pub handlers: SignalHandlerTableSharedPtr,
    /// Frames saved at handler entry, popped by `sigreturn`.
    saved: Vec<HandlerFrame>,
}

/// What `sigreturn` needs to undo a delivery: the interrupted register file
/// and the signal that was added to the blocked mask.
#[derive(Copy, Clone, Debug)]
pub struct HandlerFrame {
    pub regs: Registers,
    pub sig: i32,
}

impl SignalState {
    pub fn new(handlers: SignalHandlerTableSharedPtr) -> SignalState {
        SignalState {
            pending: SigSet::empty(),
            blocked: SigSet::empty(),
            handlers,
            saved: Vec::new(),
        }
    }

    pub fn deliverable(&self) -> Option<i32> {
        self.pending.first_deliverable(self.blocked)
    }

    /// Enter a guest handler: the interrupted register file is saved and the
    /// caller redirects execution to `action.handler`. Returns the saved
    /// depth, purely for the trace.
    pub fn push_handler_frame(&mut self, interrupted: Registers, sig: i32) -> usize {
        self.saved.push(HandlerFrame {
            regs: interrupted,
            sig,
        });
        self.saved.len()
    }

    /// `sigreturn`: pop the frame saved at handler entry.
    pub fn pop_handler_frame(&mut self) -> Option<HandlerFrame> {
        self.saved.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigset_add_remove_contains() {
        let mut set = SigSet::empty();
        set.add(SIGALRM);
        set.add(1);
        assert!(set.contains(SIGALRM));
        set.remove(SIGALRM);
        assert!(!set.contains(SIGALRM));
        assert!(set.contains(1));
    }

    #[test]
    fn first_deliverable_respects_blocked_mask() {
        let mut pending = SigSet::empty();
        pending.add(10);
        pending.add(14);
        let mut blocked = SigSet::empty();
        blocked.add(10);
        assert_eq!(pending.first_deliverable(blocked), Some(14));
        blocked.add(14);
        assert_eq!(pending.first_deliverable(blocked), None);
    }

    #[test]
    fn handler_frames_pop_in_lifo_order() {
        let table = SignalHandlerTable::new().shared();
        let mut state = SignalState::new(table);
        let mut regs = Registers::default();
        regs.eip = 0x1000;
        state.push_handler_frame(regs, 2);
        regs.eip = 0x2000;
        state.push_handler_frame(regs, 14);
        let top = state.pop_handler_frame().unwrap();
        assert_eq!((top.regs.eip, top.sig), (0x2000, 14));
        assert_eq!(state.pop_handler_frame().unwrap().regs.eip, 0x1000);
        assert!(state.pop_handler_frame().is_none());
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(14), "SIGALRM");
        assert_eq!(signal_name(0), "none");
        assert_eq!(signal_name(63), "0x3f");
    }
}
