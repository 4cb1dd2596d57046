//! Event logger behind the `log` facade

use crate::config::Config;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;

/// Expand `%p` (pid), `%h` (host), `%n` (my pe), `%N` (npes) in a log
/// file template.
pub fn expand_file_template(template: &str, pe: usize, npes: usize) -> String {
    let host = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    template
        .replace("%p", &std::process::id().to_string())
        .replace("%h", &host)
        .replace("%n", &pe.to_string())
        .replace("%N", &npes.to_string())
}

/// `log::Log` sink honoring the event-category filter and optional file
/// destination from the environment.
pub struct EventLogger {
    events: Vec<String>,
    pe: usize,
    sink: Mutex<Option<File>>,
}

impl EventLogger {
    fn category_enabled(&self, target: &str) -> bool {
        if self.events.is_empty() {
            return true;
        }
        self.events.iter().any(|e| target.contains(e.as_str()))
    }
}

impl Log for EventLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.category_enabled(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[pe {}] {} {}: {}\n",
            self.pe,
            record.level(),
            record.target(),
            record.args()
        );
        let mut sink = self.sink.lock();
        match sink.as_mut() {
            Some(f) => {
                let _ = f.write_all(line.as_bytes());
            }
            None => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Some(f) = self.sink.lock().as_mut() {
            let _ = f.flush();
        }
    }
}

/// Install the logger if `SHMEM_LOGGING` asked for one. Only the first
/// runtime in a process wins; later installs are ignored.
pub fn install(config: &Config, pe: usize, npes: usize) {
    if !config.logging {
        return;
    }
    let sink = config
        .logging_file
        .as_deref()
        .and_then(|t| File::create(expand_file_template(t, pe, npes)).ok());
    let logger = EventLogger {
        events: config.logging_events.clone(),
        pe,
        sink: Mutex::new(sink),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(if config.debug_checks {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion() {
        let s = expand_file_template("log.%n-of-%N.%p", 3, 8);
        assert!(s.starts_with("log.3-of-8."));
        assert!(s.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn category_filter() {
        let l = EventLogger {
            events: vec!["coll".into(), "heap".into()],
            pe: 0,
            sink: Mutex::new(None),
        };
        assert!(l.category_enabled("symm_core::coll::barrier"));
        assert!(l.category_enabled("symm_core::heap"));
        assert!(!l.category_enabled("symm_core::context"));
    }
}
