//! Leveled file logging for relay.
//!
//! Lines go to `<state_dir>/relay.log` as
//! `<rfc3339 timestamp> <LEVEL> <module>: <message>`, so a slot's history can
//! be grepped out with `slot=<id>`. Before [`init`] runs, nothing is written.
//!
//! The threshold is INFO, DEBUG with `--debug` or `RELAY_DEBUG=1`, and
//! `RELAY_LOG_LEVEL=<level>` overrides both. Debug mode also echoes every
//! line to stderr.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

static SINK: OnceLock<Mutex<File>> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static ECHO: AtomicBool = AtomicBool::new(false);

pub const LOG_FILE: &str = "relay.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        LogLevel::ALL
            .into_iter()
            .find(|l| l.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown log level '{}'", wanted))
    }
}

fn threshold_from_env(debug: bool) -> LogLevel {
    let env_debug = std::env::var("RELAY_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let base = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    std::env::var("RELAY_LOG_LEVEL")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(base)
}

/// Open the log file under `state_dir`.
///
/// `run` truncates the previous run's log; one-shot commands append to it.
/// Failing to open the file leaves logging disabled rather than aborting.
pub fn init(state_dir: &Path, debug: bool, truncate: bool) {
    let threshold = threshold_from_env(debug);
    THRESHOLD.store(threshold as u8, Ordering::Relaxed);
    ECHO.store(threshold >= LogLevel::Debug, Ordering::Relaxed);

    if std::fs::create_dir_all(state_dir).is_err() {
        return;
    }
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    if let Ok(file) = options.open(state_dir.join(LOG_FILE)) {
        let _ = SINK.set(Mutex::new(file));
    }
}

pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

fn format_line(level: LogLevel, target: &str, args: fmt::Arguments<'_>) -> String {
    let target = target.strip_prefix("relay::").unwrap_or(target);
    format!(
        "{} {:<5} {}: {}",
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        level.label(),
        target,
        args
    )
}

/// Backend of the `rlog*` macros.
pub fn write(level: LogLevel, target: &str, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let line = format_line(level, target, args);
    if let Some(sink) = SINK.get() {
        if let Ok(mut file) = sink.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
    if ECHO.load(Ordering::Relaxed) {
        eprintln!("{}", line);
    }
}

#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Info, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Error, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Warn, module_path!(), format_args!($($arg)*))
    };
}

/// Routing and scoring decisions; off unless debugging.
#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Debug, module_path!(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Trace, module_path!(), format_args!($($arg)*))
    };
}
