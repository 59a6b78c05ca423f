//! OpenGL runtime dispatch.
//!
//! Auxiliary runtimes (OpenGL, OpenCL, ...) enter the emulator through the
//! same software-interrupt convention as system calls, but with their own
//! code register: a virtual guest library places a per-runtime function
//! code in `ebx` and arguments in the registers after it. This module is
//! the representative template for how such a runtime plugs in: a
//! macro-defined call manifest keyed by code, a version negotiation on
//! `init`, and loud failure for stale guest libraries.

use crate::context::ContextSharedPtr;
use crate::emu::Emu;
use crate::log::LogLevel::LogDebug;
use crate::memory::MemorySharedPtr;
use std::rc::Rc;

/// Host-side runtime version. Minor bumps keep backward compatibility
/// (an older guest library runs against a newer host); major bumps do not.
pub const RUNTIME_VERSION_MAJOR: u32 = 0;
pub const RUNTIME_VERSION_MINOR: u32 = 669;

/// The call manifest: one entry per runtime entry point, keyed by the code
/// the guest library loads into `ebx`. Adding a call means adding a line
/// here and a handler below; the enum stays closed and the dispatch match
/// stays exhaustive.
macro_rules! define_opengl_calls {
    ($(($variant:ident, $name:expr, $code:expr, $handler:ident)),+ $(,)?) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum OpenglCall {
            $($variant = $code),+
        }

        impl OpenglCall {
            pub fn from_code(code: u32) -> Option<OpenglCall> {
                match code {
                    $($code => Some(OpenglCall::$variant),)+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(OpenglCall::$variant => $name),+
                }
            }
        }

        fn run_opengl_handler(emu: &mut Emu, ctx: &ContextSharedPtr, call: OpenglCall) -> i32 {
            match call {
                $(OpenglCall::$variant => $handler(emu, ctx)),+
            }
        }
    };
}

define_opengl_calls! {
    (Init, "init", 1, opengl_init),
}

/// Entry point from the executor for the OpenGL interrupt. The function
/// code is taken from `ebx`; an unknown code means the guest linked a
/// runtime library this emulator does not speak.
pub fn call(emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let code = ctx.borrow().regs.arg1();
    let call = match OpenglCall::from_code(code) {
        Some(call) => call,
        None => fatal!(
            "invalid OpenGL runtime function (code {}); the guest OpenGL \
             runtime library is probably incompatible with this emulator",
            code
        ),
    };
    log!(LogDebug, "OpenGL runtime call '{}' (code {})", call.name(), code);
    run_opengl_handler(emu, ctx, call)
}

/*
 * OpenGL call 'init' (code 1)
 *
 * The guest library hands over a {major, minor} version pair; the host
 * writes its own back through the same pointer. The run is compatible when
 * the majors are equal and the host minor is at least the guest minor.
 */

fn opengl_init(_emu: &mut Emu, ctx: &ContextSharedPtr) -> i32 {
    let version_ptr = ctx.borrow().regs.arg2();
    log!(LogDebug, "  version_ptr={:#x}", version_ptr);

    let m: MemorySharedPtr = Rc::clone(&ctx.borrow().mem);
    let guest_major = m.borrow_mut().read_u32(version_ptr);
    let guest_minor = m.borrow_mut().read_u32(version_ptr + 4);
    log!(
        LogDebug,
        "  guest runtime library v. {}.{}",
        guest_major,
        guest_minor
    );

    if guest_major != RUNTIME_VERSION_MAJOR {
        fatal!(
            "OpenGL runtime major version mismatch: guest {}.{}, host {}.{}",
            guest_major,
            guest_minor,
            RUNTIME_VERSION_MAJOR,
            RUNTIME_VERSION_MINOR
        );
    }
    if guest_minor > RUNTIME_VERSION_MINOR {
        fatal!(
            "guest OpenGL runtime v. {}.{} is newer than the host \
             implementation v. {}.{}",
            guest_major,
            guest_minor,
            RUNTIME_VERSION_MAJOR,
            RUNTIME_VERSION_MINOR
        );
    }

    m.borrow_mut().write_u32(version_ptr, RUNTIME_VERSION_MAJOR);
    m.borrow_mut().write_u32(version_ptr + 4, RUNTIME_VERSION_MINOR);
    log!(
        LogDebug,
        "  OpenGL runtime host implementation v. {}.{}",
        RUNTIME_VERSION_MAJOR,
        RUNTIME_VERSION_MINOR
    );
    0
}
