use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;

/// Records kept for `recent_logs`
const LOG_CAPACITY: usize = 512;

static LOGGER: OnceLock<DiagnosticLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Echoes records to stderr and keeps the latest ones in memory, so raw
/// transport detail stays available while the user only sees short messages.
pub struct DiagnosticLogger {
    level: Level,
    buffer: Mutex<VecDeque<LogMessage>>,
}

impl DiagnosticLogger {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            buffer: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
        }
    }

    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| DiagnosticLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))
    }

    /// Latest records, oldest first. Empty when another logger is installed.
    pub fn recent_logs() -> Vec<LogMessage> {
        LOGGER.get().map(DiagnosticLogger::snapshot).unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<LogMessage> {
        match self.buffer.lock() {
            Ok(buffer) => buffer.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn keep(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        if let Ok(mut buffer) = self.buffer.lock() {
            if buffer.len() == LOG_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(log_message);
        }
    }
}

impl log::Log for DiagnosticLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // 同时输出到标准错误
            eprintln!("[{}] {}", record.level(), record.args());
            self.keep(record);
        }
    }

    fn flush(&self) {}
}

/// Installs the diagnostic logger, falling back to `env_logger`.
pub fn setup_logging(level: LevelFilter) {
    let installed = level
        .to_level()
        .map(|level| DiagnosticLogger::init(level).is_ok())
        .unwrap_or(false);
    if !installed {
        let _ = env_logger::builder().filter_level(level).try_init();
    }
    log::info!("Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn buffer_keeps_latest_records_up_to_capacity() {
        let logger = DiagnosticLogger::new(Level::Info);
        for i in 0..(LOG_CAPACITY + 3) {
            logger.log(
                &Record::builder()
                    .level(Level::Info)
                    .args(format_args!("line {}", i))
                    .build(),
            );
        }
        let logs = logger.snapshot();
        assert_eq!(logs.len(), LOG_CAPACITY);
        assert_eq!(logs[0].message, "line 3");
        assert_eq!(logs.last().unwrap().level, "INFO");
    }

    #[test]
    fn records_above_level_are_ignored() {
        let logger = DiagnosticLogger::new(Level::Warn);
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("noise"))
                .build(),
        );
        assert!(logger.snapshot().is_empty());
    }
}
