//! Per-application log ring buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use marquee_core::db::unix_timestamp;
use marquee_core::event::Event;

const MAX_ENTRIES: usize = 512;

/// Log entry severity/origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLogLevel {
    /// Script output via print.
    Log,
    /// Script output via debug/warn.
    Warn,
    /// Script errors.
    Error,
    /// Host lifecycle messages.
    Runtime,
    /// Host-detected failures (watchdog, interrupts, panics).
    RuntimeError,
}

#[derive(Debug, Clone)]
pub struct AppLogEntry {
    pub level: AppLogLevel,
    pub message: String,
    pub created_at: i64,
}

/// Bounded in-memory log for one application instance.
pub struct AppLogger {
    entries: Mutex<VecDeque<AppLogEntry>>,
    on_entry_added: Event<AppLogEntry>,
}

impl AppLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
            on_entry_added: Event::new(),
        })
    }

    pub fn on_entry_added(&self) -> &Event<AppLogEntry> {
        &self.on_entry_added
    }

    fn push(&self, level: AppLogLevel, message: impl Into<String>) {
        let entry = AppLogEntry {
            level,
            message: message.into(),
            created_at: unix_timestamp(),
        };
        {
            let mut entries = self.entries.lock().expect("app log poisoned");
            if entries.len() == MAX_ENTRIES {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        self.on_entry_added.notify(entry);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.push(AppLogLevel::Log, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(AppLogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(AppLogLevel::Error, message);
    }

    pub fn runtime_log(&self, message: impl Into<String>) {
        self.push(AppLogLevel::Runtime, message);
    }

    pub fn runtime_error(&self, message: impl Into<String>) {
        self.push(AppLogLevel::RuntimeError, message);
    }

    pub fn entries(&self) -> Vec<AppLogEntry> {
        self.entries
            .lock()
            .expect("app log poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Whether any entry at the given level contains the needle.
    pub fn contains(&self, level: AppLogLevel, needle: &str) -> bool {
        self.entries
            .lock()
            .expect("app log poisoned")
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_buffer_caps_entries() {
        let logger = AppLogger::new();
        for i in 0..(MAX_ENTRIES + 10) {
            logger.log(format!("entry {i}"));
        }
        let entries = logger.entries();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0].message, "entry 10");
    }

    #[tokio::test]
    async fn levels_are_recorded() {
        let logger = AppLogger::new();
        logger.runtime_error("event loop stuck for at least 30s");
        assert!(logger.contains(AppLogLevel::RuntimeError, "event loop stuck"));
        assert!(!logger.contains(AppLogLevel::Log, "event loop stuck"));
    }
}
