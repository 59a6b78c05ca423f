use std::env;
use std::fmt;

/// Ordered so that a level is enabled whenever it is <= the configured
/// maximum; `LogDebug` is the chattiest and carries the per-syscall trace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

use LogLevel::*;

lazy_static! {
    static ref MAX_LEVEL: LogLevel = init_level();
}

/// The level is read once from `VX86_LOG`. Unknown values fall back to the
/// default rather than aborting: logging must never take the emulator down.
fn init_level() -> LogLevel {
    match env::var("VX86_LOG").as_ref().map(|v| v.as_str()) {
        Ok("fatal") => LogFatal,
        Ok("error") => LogError,
        Ok("warn") => LogWarn,
        Ok("info") => LogInfo,
        Ok("debug") => LogDebug,
        _ => LogWarn,
    }
}

pub fn log_enabled(level: LogLevel) -> bool {
    level <= *MAX_LEVEL
}

pub fn log_write(level: LogLevel, args: fmt::Arguments) {
    if !log_enabled(level) {
        return;
    }
    let tag = match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    };
    eprintln!("[vx86 {}] {}", tag, args);
}

/// Shown with every `fatal!` diagnostic. Unsupported guest behavior halts the
/// emulator instead of surfacing as a spurious guest error.
pub const SYS_NOTE: &str = "\
\tThe system calls performed by the emulated program are intercepted and\n\
\tserviced by vx86. The most common calls are supported, but this program\n\
\tused an unsupported call or combination of arguments. Please open a\n\
\treport with the vx86 maintainers naming the diagnostic above.";

pub fn fatal_write(args: fmt::Arguments) -> ! {
    log_write(LogFatal, format_args!("{}\n{}", args, SYS_NOTE));
    panic!("fatal: {}", args);
}

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        crate::log::log_write($level, format_args!($($arg)*))
    };
}

/// Hard abort with a structured diagnostic. The emulator contract is
/// behavioral fidelity on supported inputs and loud failure on unsupported
/// ones, never silent approximation.
macro_rules! fatal {
    ($($arg:tt)*) => {
        crate::log::fatal_write(format_args!($($arg)*))
    };
}
