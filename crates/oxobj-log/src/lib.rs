//! Minimal, zero-dependency logging for the `OxObj` runtime.
//!
//! Level-filtered macros capture `module_path!()` and hand a [`Record`] to
//! the active sink. The default sink writes a coloured line to stderr;
//! freestanding hosts install their own with [`set_sink`].
//!
//! The level defaults to `WARN` and can be taken from the `OXOBJ_LOG`
//! environment variable with [`init_from_env`].
//!
//! # Example
//!
//! ```
//! use oxobj_log::{Level, debug, warn};
//!
//! oxobj_log::set_level(Level::Debug);
//!
//! debug!("resolved class {}", "Widget");
//! warn!("duplicate class name {}", "Widget");
//! ```

use std::fmt::{self, Arguments};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};

/// Environment variable read by [`init_from_env`].
pub const ENV_VAR: &str = "OXOBJ_LOG";

/// Severity of a log message, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Invariant breaks and fatal faults
    Error = 0,
    /// Recoverable anomalies (duplicate names, stale pool marks)
    Warn = 1,
    /// Module loading and other coarse events
    Info = 2,
    /// Class registration and resolution
    Debug = 3,
    /// Per-message detail (initialize, table builds)
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Upper-case name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Level::Error),
            1 => Some(Level::Warn),
            2 => Some(Level::Info),
            3 => Some(Level::Debug),
            4 => Some(Level::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid log level: {}", self.0)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, ignoring case. `"off"` is not a level.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// One log event, as handed to a sink.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Severity.
    pub level: Level,
    /// Module path of the call site.
    pub target: &'a str,
    /// Formatted message.
    pub args: Arguments<'a>,
}

/// Destination for log records.
pub type Sink = Box<dyn Fn(&Record<'_>) + Send + Sync>;

/// Global logger state: the level filter and the optional custom sink.
pub struct Logger {
    level: AtomicU8,
    sink: RwLock<Option<Sink>>,
}

impl Logger {
    const fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            sink: RwLock::new(None),
        }
    }

    /// Sets the most verbose level that is still emitted.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Returns the current level.
    #[must_use]
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed)).unwrap_or(Level::Warn)
    }

    /// Returns true if messages at `level` are emitted.
    #[must_use]
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    fn emit(&self, record: &Record<'_>) {
        let sink = self.sink.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        match sink.as_ref() {
            Some(sink) => sink(record),
            None => {
                const RESET: &str = "\x1b[0m";
                eprintln!(
                    "{}[{}]{RESET} {}: {}",
                    record.level.color_code(),
                    record.level,
                    record.target,
                    record.args
                );
            }
        }
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the global logger, creating it at `Level::Warn` on first use.
pub fn get_logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the global level.
pub fn set_level(level: Level) {
    get_logger().set_level(level);
}

/// Sets the global level from a level name.
///
/// # Errors
///
/// Returns [`ParseLevelError`] if `s` names no level.
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Reads [`ENV_VAR`] and applies it if it names a level.
///
/// Returns the level that was applied, if any. An unparsable value is
/// ignored so a typo never prevents start-up.
pub fn init_from_env() -> Option<Level> {
    let level = std::env::var(ENV_VAR).ok()?.parse().ok()?;
    set_level(level);
    Some(level)
}

/// Routes every record to `sink` instead of stderr.
pub fn set_sink(sink: Sink) {
    *get_logger()
        .sink
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
}

/// Restores the default stderr sink.
pub fn reset_sink() {
    *get_logger()
        .sink
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments<'_>) {
    let logger = get_logger();
    if logger.enabled(level) {
        logger.emit(&Record { level, target, args });
    }
}

/// Logs at an explicit level.
///
/// ```
/// use oxobj_log::{log, Level};
///
/// log!(level: Level::Info, "loaded {} classes", 3);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target($level, module_path!(), format_args!($($arg)*));
            }
        }
    };
}

/// Logs at `Level::Error`.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs at `Level::Warn`.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs at `Level::Info`.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs at `Level::Debug`.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs at `Level::Trace`.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}
