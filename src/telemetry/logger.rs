//! Structured logging sink (§4.10): a `tracing_subscriber` [`Layer`] that
//! mirrors formatted events into an in-memory ring for `/logs`-style
//! inspection, alongside whatever other layer does the real output.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

pub struct Logger {
    capacity: usize,
    ring: Mutex<VecDeque<LogEntry>>,
}

impl Logger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let ring = self.ring.lock();
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, entry: LogEntry) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for Logger {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "trace",
        };
        self.push(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let logger = Logger::new(2);
        for i in 0..5 {
            logger.push(LogEntry {
                timestamp: Utc::now(),
                level: "info".to_string(),
                target: "test".to_string(),
                message: format!("entry {i}"),
            });
        }
        assert_eq!(logger.len(), 2);
        let recent = logger.recent(10);
        assert_eq!(recent[0].message, "entry 4");
        assert_eq!(recent[1].message, "entry 3");
    }
}
