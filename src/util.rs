use flexi_logger::writers::LogWriter;
use flexi_logger::{colored_with_thread, DeferredNow, FormatFunction, LogSpecBuilder, Logger, WriteMode};
use log::{LevelFilter, Record};
use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

/// Log verbosity accepted on the command line and by [`steady_logger::initialize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

const LEVELS: [(&str, LogLevel, LevelFilter); 6] = [
    ("trace", LogLevel::Trace, LevelFilter::Trace),
    ("debug", LogLevel::Debug, LevelFilter::Debug),
    ("info", LogLevel::Info, LevelFilter::Info),
    ("warn", LogLevel::Warn, LevelFilter::Warn),
    ("error", LogLevel::Error, LevelFilter::Error),
    ("off", LogLevel::Off, LevelFilter::Off),
];

impl LogLevel {
    fn entry(self) -> (&'static str, LevelFilter) {
        LEVELS
            .iter()
            .find(|(_, level, _)| *level == self)
            .map(|(name, _, filter)| (*name, *filter))
            .unwrap_or(("off", LevelFilter::Off))
    }

    pub fn to_level_filter(self) -> LevelFilter {
        self.entry().1
    }

    pub fn variants() -> &'static [&'static str] {
        &["trace", "debug", "info", "warn", "error", "off"]
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        LEVELS
            .iter()
            .find(|(name, _, _)| *name == wanted)
            .map(|(_, level, _)| *level)
            .ok_or_else(|| format!("Invalid logging level: {}", wanted))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry().0)
    }
}

thread_local! {
    // Some while the thread has a live capture guard.
    static CAPTURED: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

/// Sends each formatted line to the calling thread's capture buffer, or to stderr when that
/// thread is not capturing.
struct CaptureOrStderr {
    format: FormatFunction,
}

impl LogWriter for CaptureOrStderr {
    fn write(&self, now: &mut DeferredNow, record: &Record) -> io::Result<()> {
        let mut line = Vec::new();
        (self.format)(&mut line, now, record)?;
        let kept = CAPTURED.with(|captured| match captured.borrow_mut().as_mut() {
            Some(lines) => {
                lines.push(String::from_utf8_lossy(&line).into_owned());
                true
            }
            None => false,
        });
        if !kept {
            line.push(b'\n');
            io::stderr().write_all(&line)?;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().flush()
    }

    fn max_log_level(&self) -> LevelFilter {
        LevelFilter::max()
    }
}

pub mod steady_logger {
    use super::*;
    use flexi_logger::LoggerHandle;
    use lazy_static::lazy_static;
    use parking_lot::Mutex;

    lazy_static! {
        static ref LOGGER_HANDLE: Mutex<Option<LoggerHandle>> = Mutex::new(None);
    }

    /// Starts the process logger at `level`, or switches the level of the running one.
    pub fn initialize(level: LogLevel) -> Result<(), Box<dyn Error>> {
        let spec = LogSpecBuilder::new().default(level.to_level_filter()).build();
        let mut logger_handle = LOGGER_HANDLE.lock();
        match logger_handle.as_mut() {
            Some(handle) => handle.set_new_spec(spec),
            None => {
                let handle = Logger::with(spec)
                    .log_to_writer(Box::new(CaptureOrStderr { format: colored_with_thread }))
                    .write_mode(WriteMode::Direct)
                    .start()?;
                *logger_handle = Some(handle);
            }
        }
        Ok(())
    }

    /// Ends capture on the owning thread and discards what it collected.
    pub struct LogCaptureGuard {
        _not_send: std::marker::PhantomData<*const ()>,
    }

    impl Drop for LogCaptureGuard {
        fn drop(&mut self) {
            CAPTURED.with(|captured| captured.borrow_mut().take());
        }
    }

    /// Collects the lines logged by the current thread until the guard drops.
    pub fn start_log_capture() -> LogCaptureGuard {
        CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
        LogCaptureGuard { _not_send: std::marker::PhantomData }
    }

    /// Lines captured so far on the current thread. Empty when not capturing.
    pub fn captured_lines() -> Vec<String> {
        CAPTURED.with(|captured| captured.borrow().clone().unwrap_or_default())
    }
}

/// Starts the process logger at the named level, or switches the level if it already runs.
pub fn init_logging(level: &str) -> Result<(), Box<dyn Error>> {
    let level: LogLevel = level.parse()?;
    steady_logger::initialize(level)
}

/// Panics unless each text appears in the captured log lines, in the given order.
#[macro_export]
macro_rules! assert_in_logs {
    ($texts:expr) => {{
        let lines = $crate::util::steady_logger::captured_lines();
        let texts = $texts;
        let mut remaining = texts.iter().peekable();
        for line in &lines {
            if remaining.peek().is_some_and(|text| line.contains(*text)) {
                remaining.next();
            }
        }
        if let Some(missing) = remaining.next() {
            panic!("{}:{}: {:?} not found in order in logs {:?}", file!(), line!(), missing, lines);
        }
    }};
}
