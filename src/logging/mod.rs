//! Log target dispatch (§4.9). `autopinned` always runs its own `log::Log`
//! implementation rather than `env_logger::init()` directly, because the
//! target (stdout, a file, or syslog) is a runtime config choice, not an
//! environment variable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::LogTarget;
use crate::error::{errors, AutopinError};

enum Sink {
    Stdout,
    File(Mutex<File>),
    Syslog(Mutex<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>),
}

pub struct AutopinLogger {
    sink: Sink,
    level: LevelFilter,
}

impl AutopinLogger {
    pub fn init(target: LogTarget, log_file: Option<&str>, level: LevelFilter) -> Result<(), AutopinError> {
        let sink = match target {
            LogTarget::Stdout => Sink::Stdout,
            LogTarget::File => {
                let path = log_file.ok_or_else(|| errors::bad_config("log_file", "log_type=file requires log_file"))?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| errors::system("log_file", format!("cannot open {path}: {e}")))?;
                Sink::File(Mutex::new(file))
            }
            LogTarget::Syslog => {
                let formatter = syslog::Formatter3164 {
                    facility: syslog::Facility::LOG_DAEMON,
                    hostname: None,
                    process: "autopinned".into(),
                    pid: std::process::id() as i32,
                };
                let logger = syslog::unix(formatter)
                    .map_err(|e| errors::system("syslog", e.to_string()))?;
                Sink::Syslog(Mutex::new(logger))
            }
        };

        let logger = Self { sink, level };
        log::set_max_level(level);
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| errors::unknown("log_init", e.to_string()))
    }
}

impl Log for AutopinLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{}] {}: {}", record.level(), record.target(), record.args());
        match &self.sink {
            Sink::Stdout => println!("{line}"),
            Sink::File(f) => {
                if let Ok(mut f) = f.lock() {
                    let _ = writeln!(f, "{line}");
                }
            }
            Sink::Syslog(s) => {
                if let Ok(mut s) = s.lock() {
                    let _ = match record.level() {
                        Level::Error => s.err(line),
                        Level::Warn => s.warning(line),
                        Level::Info => s.info(line),
                        Level::Debug | Level::Trace => s.debug(line),
                    };
                }
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(f) = &self.sink {
            if let Ok(mut f) = f.lock() {
                let _ = f.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_target_without_log_file_is_a_bad_config_error() {
        let result = AutopinLogger::init(LogTarget::File, None, LevelFilter::Info);
        assert!(result.is_err());
    }
}
