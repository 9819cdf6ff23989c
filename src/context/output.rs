// src/context/output.rs
//! Thread-safe output sink
//!
//! Many tasks (a request and all its forks) write to one client stream.
//! Writes are queued to a single writer thread that writes and flushes each
//! chunk in arrival order, so concurrent writers never interleave bytes.
//!
//! After `close()` writes are silently dropped and report 0 bytes.

use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

enum Command {
    Write(Bytes),
    Flush(Sender<()>),
}

/// One outward message, serialized as a JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    /// Message type understood by the client (text, loading, error, ...)
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub props: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Shared by every message sent through one `send_group` call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl OutputMessage {
    pub fn new(kind: impl Into<String>, props: Value) -> Self {
        Self {
            kind: kind.into(),
            props,
            id: None,
            group_id: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new("text", json!({ "content": content.into() }))
    }

    /// Accept either a plain string or a structured object with a `type`
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(content) => Ok(Self::text(content)),
            Value::Object(ref map) if map.contains_key("type") => {
                Ok(serde_json::from_value(value)?)
            }
            other => Err(EngineError::OutputError(format!(
                "message must be a string or an object with a type, got {}",
                other
            ))),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl From<&str> for OutputMessage {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

impl From<String> for OutputMessage {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

/// Sink statistics
#[derive(Debug, Clone)]
pub struct OutputStats {
    pub bytes_written: u64,
    pub messages_sent: u64,
    pub closed: bool,
}

/// Serialized writer shared by a context and its forks
pub struct OutputSink {
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    bytes_written: Arc<AtomicU64>,
    messages_sent: AtomicU64,
}

impl OutputSink {
    /// Wrap a writer and start the writer thread
    pub fn new<W: Write + Send + 'static>(writer: W) -> Result<Self> {
        let (tx, rx) = unbounded::<Command>();
        let bytes_written = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&bytes_written);

        let worker = std::thread::Builder::new()
            .name("output-sink".to_string())
            .spawn(move || {
                let mut writer = writer;
                for command in rx.iter() {
                    match command {
                        Command::Write(chunk) => {
                            let result = writer.write_all(&chunk).and_then(|_| writer.flush());
                            match result {
                                Ok(()) => {
                                    counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                                }
                                Err(e) => error!("Output write failed: {}", e),
                            }
                        }
                        Command::Flush(ack) => {
                            if let Err(e) = writer.flush() {
                                error!("Output flush failed: {}", e);
                            }
                            let _ = ack.send(());
                        }
                    }
                }
                debug!("Output writer stopped");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            bytes_written,
            messages_sent: AtomicU64::new(0),
        })
    }

    /// A sink that discards everything
    pub fn discard() -> Result<Self> {
        Self::new(std::io::sink())
    }

    /// Queue raw bytes. Returns the number of bytes accepted (0 once closed).
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() || data.is_empty() {
            return Ok(0);
        }
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => match tx.send(Command::Write(Bytes::copy_from_slice(data))) {
                Ok(()) => Ok(data.len()),
                Err(_) => Ok(0),
            },
            None => Ok(0),
        }
    }

    /// Serialize and queue one message
    pub fn send(&self, message: &OutputMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        if self.write(&line)? > 0 {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Block until everything queued so far has been written
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        {
            let sender = self.sender.lock();
            let Some(tx) = sender.as_ref() else {
                return Ok(());
            };
            if tx.send(Command::Flush(ack_tx)).is_err() {
                return Ok(());
            }
        }
        ack_rx
            .recv()
            .map_err(|_| EngineError::OutputError("writer stopped before flush".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for pending writes and stop the writer thread. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.sender.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("Output writer thread panicked");
            }
        }
    }

    pub fn stats(&self) -> OutputStats {
        OutputStats {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory writer whose clones share one buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Parse the buffer as JSON lines
    pub fn messages(&self) -> Vec<OutputMessage> {
        self.as_string()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
