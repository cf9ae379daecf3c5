//! Callback logging for embedding applications.
//!
//! The station's internal diagnostics go through the `log` facade. This
//! module is the *observability* channel instead: a host application (a
//! panel UI, a test harness) registers one callback and receives status
//! lines and the raw packet trace without configuring a global logger.

use std::sync::Arc;

/// Severity for callback messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Callback receiving a level and a formatted message.
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Cloneable logger handle shared by the transport tasks.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
        }
    }

    /// Logger printing to stdout/stderr with a timestamp.
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                _ => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Logger that discards everything.
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Emit one raw frame on the packet trace, hex-dumped with a direction
    /// tag ("RX"/"TX").
    pub fn trace_frame(&self, tag: &str, data: &[u8]) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let dump = data
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        self.log(
            LogLevel::Info,
            &format!("{} ({} bytes): {}", tag, data.len(), dump),
        );
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}
