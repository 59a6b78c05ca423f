//! System-call interception layer of a user-space emulator that executes
//! unmodified 32-bit x86 programs on a (possibly different) host machine.
//!
//! The instruction executor traps on the software-interrupt opcode and hands
//! the current context to [`syscall::dispatch`]; handlers read the guest
//! register file and guest memory, and either forward the request to the host
//! or mutate emulator state (mappings, contexts, timers, signals, file
//! descriptors). The instruction decoder, the ELF loader and the page-table
//! internals are external collaborators consumed through narrow interfaces.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod context;
pub mod emu;
pub mod fd_table;
pub mod kernel_abi;
pub mod memory;
pub mod opengl;
pub mod registers;
pub mod signal;
pub mod string_map;
pub mod syscall;
