//! Per-subsystem leveled logging
//!
//! A thin layer over the serial console with one runtime-adjustable level per
//! subsystem. The `log` crate facade is wired to the same sink so third-party
//! code logging through `log::info!` lands on the serial port too.

use core::sync::atomic::{AtomicU8, Ordering};

/// Log severities, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Panic = 0,
    Fatal = 1,
    Error = 2,
    Warning = 3,
    Info = 4,
    Debug = 5,
    Verbose = 6,
    Trace = 7,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Panic => "PANIC",
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Verbose => "VERBOSE",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Panic,
            1 => LogLevel::Fatal,
            2 => LogLevel::Error,
            3 => LogLevel::Warning,
            4 => LogLevel::Info,
            5 => LogLevel::Debug,
            6 => LogLevel::Verbose,
            _ => LogLevel::Trace,
        }
    }
}

/// Kernel subsystems with independently tunable verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Subsystem {
    Kernel = 0,
    Frame = 1,
    Paging = 2,
    Heap = 3,
    Tasking = 4,
    Sync = 5,
    Interrupt = 6,
    Timer = 7,
    Hypervisor = 8,
    Tosdb = 9,
    Storage = 10,
    Cli = 11,
}

const SUBSYSTEM_COUNT: usize = 12;

impl Subsystem {
    pub const fn as_str(self) -> &'static str {
        match self {
            Subsystem::Kernel => "kernel",
            Subsystem::Frame => "frame",
            Subsystem::Paging => "paging",
            Subsystem::Heap => "heap",
            Subsystem::Tasking => "tasking",
            Subsystem::Sync => "sync",
            Subsystem::Interrupt => "interrupt",
            Subsystem::Timer => "timer",
            Subsystem::Hypervisor => "hypervisor",
            Subsystem::Tosdb => "tosdb",
            Subsystem::Storage => "storage",
            Subsystem::Cli => "cli",
        }
    }
}

const DEFAULT_LEVEL: u8 = LogLevel::Info as u8;

static LEVELS: [AtomicU8; SUBSYSTEM_COUNT] = [const { AtomicU8::new(DEFAULT_LEVEL) }; SUBSYSTEM_COUNT];

/// Change the verbosity of one subsystem at runtime.
pub fn set_level(subsystem: Subsystem, level: LogLevel) {
    LEVELS[subsystem as usize].store(level as u8, Ordering::Relaxed);
}

/// Current verbosity of a subsystem.
pub fn level_of(subsystem: Subsystem) -> LogLevel {
    LogLevel::from_u8(LEVELS[subsystem as usize].load(Ordering::Relaxed))
}

/// Should a message of `level` in `subsystem` be emitted?
#[inline]
pub fn enabled(subsystem: Subsystem, level: LogLevel) -> bool {
    level as u8 <= LEVELS[subsystem as usize].load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(subsystem: Subsystem, level: LogLevel, args: core::fmt::Arguments) {
    if enabled(subsystem, level) {
        crate::println!("[{}] {}: {}", level.as_str(), subsystem.as_str(), args);
    }
}

/// Subsystem-aware logging macro.
#[macro_export]
macro_rules! klog {
    ($subsys:ident, $level:ident, $($arg:tt)*) => {
        $crate::logging::_log(
            $crate::logging::Subsystem::$subsys,
            $crate::logging::LogLevel::$level,
            format_args!($($arg)*),
        )
    };
}

/// Bridge so `log::info!` and friends reach the serial console.
struct FacadeLogger;

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static FACADE: FacadeLogger = FacadeLogger;

/// Install the facade logger. Called once during boot; subsequent calls are
/// no-ops because `log` rejects a second logger.
pub fn init() {
    let _ = log::set_logger(&FACADE).map(|()| log::set_max_level(log::LevelFilter::Info));
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_is_info() {
        assert_eq!(level_of(Subsystem::Tosdb), LogLevel::Info);
        assert!(enabled(Subsystem::Tosdb, LogLevel::Error));
        assert!(!enabled(Subsystem::Tosdb, LogLevel::Trace));
    }

    #[test]
    fn test_runtime_reconfiguration() {
        set_level(Subsystem::Sync, LogLevel::Trace);
        assert!(enabled(Subsystem::Sync, LogLevel::Trace));
        set_level(Subsystem::Sync, LogLevel::Fatal);
        assert!(!enabled(Subsystem::Sync, LogLevel::Error));
        assert!(enabled(Subsystem::Sync, LogLevel::Panic));
        set_level(Subsystem::Sync, LogLevel::Info);
    }
}
