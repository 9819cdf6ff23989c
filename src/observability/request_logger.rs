// src/observability/request_logger.rs
//! Request-scoped asynchronous logger
//!
//! Entries are queued on a bounded channel and re-emitted as `tracing`
//! events by a dedicated consumer thread, tagged with the request, chat and
//! assistant ids. A full queue never blocks the caller: the entry is
//! emitted inline instead.
//!
//! ```text
//! request path ──try_send──▶ [bounded(100)] ──▶ consumer thread ──▶ tracing
//!        └──────── full ─────────────────────────────────────────────▲
//! ```

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Queue capacity for pending entries
const LOG_QUEUE_CAPACITY: usize = 100;

/// Severity of a request log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug)]
struct LogEntry {
    level: LogLevel,
    message: String,
}

/// Identity stamped on every emitted event
#[derive(Debug, Clone, Default)]
struct RequestTags {
    request_id: String,
    chat_id: String,
    assistant_id: String,
}

impl RequestTags {
    fn emit(&self, entry: &LogEntry) {
        let request_id = self.request_id.as_str();
        let chat_id = self.chat_id.as_str();
        let assistant_id = self.assistant_id.as_str();
        let message = entry.message.as_str();
        match entry.level {
            LogLevel::Trace => trace!(request_id, chat_id, assistant_id, "{}", message),
            LogLevel::Debug => debug!(request_id, chat_id, assistant_id, "{}", message),
            LogLevel::Info => info!(request_id, chat_id, assistant_id, "{}", message),
            LogLevel::Warn => warn!(request_id, chat_id, assistant_id, "{}", message),
            LogLevel::Error => error!(request_id, chat_id, assistant_id, "{}", message),
        }
    }
}

/// Last 8 characters of an id, for log readability
///
/// Generated ids end in a ULID, whose leading characters are a timestamp
/// shared by ids created close together.
pub fn short_id(id: &str) -> String {
    let count = id.chars().count();
    id.chars().skip(count.saturating_sub(8)).collect()
}

/// Per-request logger
pub struct RequestLogger {
    tags: Arc<RequestTags>,

    /// Producer side; `None` once closed or for a no-op logger
    sender: Mutex<Option<Sender<LogEntry>>>,

    /// Consumer thread
    worker: Mutex<Option<JoinHandle<()>>>,

    closed: AtomicBool,

    /// When set, nothing is emitted at all
    silent: bool,
}

impl RequestLogger {
    /// Create a logger and start its consumer thread
    pub fn new(request_id: &str, chat_id: &str, assistant_id: &str) -> Self {
        let tags = Arc::new(RequestTags {
            request_id: short_id(request_id),
            chat_id: chat_id.to_string(),
            assistant_id: assistant_id.to_string(),
        });

        let (tx, rx) = bounded::<LogEntry>(LOG_QUEUE_CAPACITY);
        let consumer_tags = Arc::clone(&tags);
        let spawned = std::thread::Builder::new()
            .name(format!("reqlog-{}", tags.request_id))
            .spawn(move || {
                for entry in rx.iter() {
                    consumer_tags.emit(&entry);
                }
            });

        let (sender, worker) = match spawned {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                warn!("Failed to start request logger thread, logging inline: {}", e);
                (None, None)
            }
        };

        Self {
            tags,
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
            closed: AtomicBool::new(false),
            silent: false,
        }
    }

    /// A logger that drops everything
    pub fn noop() -> Self {
        Self {
            tags: Arc::new(RequestTags::default()),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            closed: AtomicBool::new(true),
            silent: true,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.tags.request_id
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if self.silent {
            return;
        }
        let entry = LogEntry {
            level,
            message: message.into(),
        };

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => match tx.try_send(entry) {
                Ok(()) => {}
                Err(TrySendError::Full(entry)) | Err(TrySendError::Disconnected(entry)) => {
                    self.tags.emit(&entry)
                }
            },
            None => self.tags.emit(&entry),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Record that a resource was cleaned up
    pub fn cleanup(&self, resource: &str) {
        self.log(LogLevel::Debug, format!("Cleanup: {}", resource));
    }

    /// Record the start of context release
    pub fn release_started(&self) {
        self.log(LogLevel::Debug, "Release started");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drain pending entries and stop the consumer. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender ends the consumer's iterator once drained
        drop(self.sender.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Request logger thread panicked");
            }
        }
    }
}

impl Drop for RequestLogger {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLogger")
            .field("request_id", &self.tags.request_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("ctx-01HZXYZABCDEF"), "YZABCDEF");
        assert_eq!(short_id("ctx-01M56KBD8QZ87TKFYBR8C6V310"), "R8C6V310");
        assert_ne!(
            short_id("ctx-01M56KBD8QZ87TKFYBR8C6V310"),
            short_id("ctx-01M56KBD8QXR1GT8M7PJ6JF1RX")
        );
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_close_is_idempotent() {
        let logger = RequestLogger::new("ctx-123456789", "chat-1", "assistant-1");
        logger.info("hello");
        logger.cleanup("trace");
        logger.release_started();
        assert!(!logger.is_closed());

        logger.close();
        assert!(logger.is_closed());
        logger.close();

        // Logging after close falls back to inline emission
        logger.warn("after close");
    }

    #[test]
    fn test_noop_logger() {
        let logger = RequestLogger::noop();
        assert!(logger.is_closed());
        logger.error("ignored");
        logger.close();
    }

    #[test]
    fn test_burst_does_not_block() {
        let logger = RequestLogger::new("ctx-burst", "", "");
        for i in 0..1_000 {
            logger.debug(format!("entry {}", i));
        }
        logger.close();
    }
}
