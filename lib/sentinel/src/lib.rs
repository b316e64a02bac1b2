//! A small leveled-logging facade.
//!
//! The service never calls `println!` directly: every component logs
//! through [`log`], which dispatches to whatever [`LoggerBackend`] was
//! installed with [`set_logger`]. This mirrors the logging convention used
//! throughout the rest of the codebase this service grew out of, just
//! swapping the no_std backend for one that writes to a process's stderr.

use std::fmt::{Arguments, Display, Formatter};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use c_enum::c_enum;

#[macro_export]
macro_rules! log {
    ($level:ident, $($arg:tt)*) => {{
        $crate::log_message(module_path!(), $crate::LogLevel::$level, format_args!("{}", format_args!($($arg)*)));
    }};
}

static LOGGER_BACKEND: OnceLock<&'static dyn LoggerBackend> = OnceLock::new();

c_enum! {
    #[derive(Debug, Default)]
    pub enum LogLevel: u8 {
        Trace       = 1
        Debug       = 2
        Info        = 3
        Warning     = 4
        Error       = 5
        Critical    = 6
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Trace => write!(f, "\x1b[94mTRACE\x1b[0m"),
            Self::Debug => write!(f, "\x1b[92mDEBUG\x1b[0m"),
            Self::Info => write!(f, "\x1b[92mINFO\x1b[0m"),
            Self::Warning => write!(f, "\x1b[93mWARNING\x1b[0m"),
            Self::Error => write!(f, "\x1b[91mERROR\x1b[0m"),
            Self::Critical => write!(f, "\x1b[31mCRITICAL\x1b[0m"),
            _ => write!(f, "UNKNOWN"),
        }
    }
}

/// Receives formatted log lines. Implementations decide where they go
/// (stderr, syslog, a ring buffer under test) and whether to filter by
/// level; the facade itself does no filtering.
pub trait LoggerBackend: Sync {
    fn log(&self, module_path: &'static str, level: LogLevel, formatter: Arguments);
}

/// Installs the process-wide logger. Only the first call has effect;
/// `varstored::main` calls this once before anything else runs.
pub fn set_logger(backend: &'static dyn LoggerBackend) {
    let _ = LOGGER_BACKEND.set(backend);
}

pub fn get_logger() -> Option<&'static dyn LoggerBackend> {
    LOGGER_BACKEND.get().copied()
}

#[doc(hidden)]
pub fn log_message(module_path: &'static str, level: LogLevel, formatter: Arguments) {
    if let Some(logger) = LOGGER_BACKEND.get() {
        logger.log(module_path, level, formatter);
    }
}

/// A [`LoggerBackend`] that writes `{timestamp} {level} {module}: {message}`
/// lines to stderr, filtering out anything below `min_level`. The timestamp
/// is seconds since the Unix epoch; nothing here detects whether the process
/// is running under a service manager that would stamp its own, so it is
/// always included.
pub struct StderrLogger {
    pub min_level: LogLevel,
}

impl LoggerBackend for StderrLogger {
    fn log(&self, module_path: &'static str, level: LogLevel, formatter: Arguments) {
        if level < self.min_level {
            return;
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        eprintln!("{}.{:03} {level} {module_path}: {formatter}", now.as_secs(), now.subsec_millis());
    }
}
