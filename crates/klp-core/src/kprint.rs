//! Kernel-style log macros for klpatch
//!
//! Thread-safe, optionally-flushing output to stderr in the spirit of
//! `printk`. Leveled messages carry the `livepatch: ` prefix so engine
//! output reads like the kernel's.
//!
//! # Environment Variables
//!
//! - `KLP_FLUSH_EPRINT=1` - Flush stderr after each print
//! - `KLP_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=notice, 4=info,
//!   5=debug, 6=trace (names accepted too)
//!
//! # Usage
//!
//! ```ignore
//! use klp_core::{knotice, kwarn};
//!
//! knotice!("enabling patch '{}'", name);
//! kwarn!("failed to enable patch '{}'", name);
//! ```

use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

use crate::constants::LOG_PREFIX;

/// `printk` levels, ordered by verbosity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Notice = 3,
    Info = 4,
    Debug = 5,
    Trace = 6,
}

const LEVELS: [LogLevel; 7] = [
    LogLevel::Off,
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Notice,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

impl LogLevel {
    /// Numeric level; anything above 6 saturates to `Trace`
    pub fn from_u8(v: u8) -> Self {
        LEVELS[usize::from(v.min(6))]
    }

    /// Parse a level name or number
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return (n <= 6).then(|| Self::from_u8(n));
        }
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Some(LogLevel::Off),
            "err" | "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "notice" => Some(LogLevel::Notice),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Kernel log level marker (`KERN_*`)
    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "<3>",
            LogLevel::Warn => "<4>",
            LogLevel::Notice => "<5>",
            LogLevel::Info => "<6>",
            LogLevel::Debug | LogLevel::Trace => "<7>",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

/// Console state shared by every macro
struct Console {
    level: AtomicU8,
    flush: AtomicBool,
    env: Once,
}

static CONSOLE: Console = Console {
    level: AtomicU8::new(LogLevel::Notice as u8),
    flush: AtomicBool::new(false),
    env: Once::new(),
};

/// Read `KLP_LOG_LEVEL` and `KLP_FLUSH_EPRINT`
///
/// Runs once, on the first log line at the latest. Explicit setters
/// called before it take precedence.
pub fn init() {
    CONSOLE.env.call_once(|| {
        if let Some(level) = std::env::var("KLP_LOG_LEVEL").ok().and_then(|v| LogLevel::parse(&v)) {
            CONSOLE.level.store(level as u8, Ordering::Relaxed);
        }
        if let Some(flush) = std::env::var("KLP_FLUSH_EPRINT").ok().and_then(|v| crate::env::parse_bool(&v)) {
            CONSOLE.flush.store(flush, Ordering::Relaxed);
        }
    });
}

#[inline]
pub fn flush_enabled() -> bool {
    init();
    CONSOLE.flush.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(CONSOLE.level.load(Ordering::Relaxed))
}

/// Override the console level
pub fn set_log_level(level: LogLevel) {
    init();
    CONSOLE.level.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    CONSOLE.flush.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

fn emit(level: Option<LogLevel>, args: std::fmt::Arguments<'_>, newline: bool) {
    let mut err = std::io::stderr().lock();
    if let Some(level) = level {
        let _ = write!(err, "{}{}", level.tag(), LOG_PREFIX);
    }
    let _ = err.write_fmt(args);
    if newline {
        let _ = err.write_all(b"\n");
    }
    if flush_enabled() {
        let _ = err.flush();
    }
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>, newline: bool) {
    emit(None, args, newline);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args, true);
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Print to stderr (no newline, no level)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*), false);
    }};
}

/// Print to stderr with newline (no level)
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprint_impl(format_args!(""), true);
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprint_impl(format_args!($($arg)*), true);
    }};
}

/// `pr_err`
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// `pr_warn`
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// `pr_notice`
#[macro_export]
macro_rules! knotice {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Notice, format_args!($($arg)*));
    }};
}

/// `pr_info`
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// `pr_debug`
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Most verbose
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}
