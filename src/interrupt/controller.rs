// src/interrupt/controller.rs
//! Per-context interrupt controller
//!
//! # States
//!
//! - **idle**: no signal held
//! - **holding**: a current signal, possibly more queued behind it
//! - **force-cancelled**: a force signal fired the cancellation token; a
//!   fresh token is installed for subsequent work
//!
//! The mailbox is a bounded tokio channel drained by one listener task per
//! controller. Senders wait at most `send_timeout` for a free slot.

use crate::context::{Context, ContextRegistry};
use crate::interrupt::signal::InterruptSignal;
use crate::observability::INTERRUPT_SIGNALS;
use crate::utils::config::InterruptConfig;
use crate::utils::errors::{EngineError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback run for every accepted signal, on its own task
pub type InterruptHandler =
    Arc<dyn Fn(Arc<Context>, InterruptSignal) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`InterruptHandler`]
pub fn handler<F, Fut>(f: F) -> InterruptHandler
where
    F: Fn(Arc<Context>, InterruptSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, signal| f(ctx, signal).boxed())
}

/// Controller statistics
#[derive(Debug, Clone)]
pub struct InterruptStats {
    pub received: u64,
    pub pending: usize,
    pub started: bool,
    pub stopped: bool,
}

#[derive(Default)]
struct State {
    current: Option<InterruptSignal>,
    pending: VecDeque<InterruptSignal>,
    /// Token cancelled by the most recent force signal
    last_fired: Option<CancellationToken>,
}

struct Inner {
    /// Mailbox producer; taken on stop, which closes the queue
    tx: Mutex<Option<mpsc::Sender<InterruptSignal>>>,

    /// Taken by the listener on start
    rx: Mutex<Option<mpsc::Receiver<InterruptSignal>>>,

    state: Mutex<State>,

    /// Parent of every cancellable sub-context this controller hands out
    parent: CancellationToken,

    /// Current cancellable sub-context
    active: Mutex<CancellationToken>,

    handler: RwLock<Option<InterruptHandler>>,

    listener: Mutex<Option<JoinHandle<()>>>,

    /// Context the listener looks up when running the handler
    owner_id: RwLock<String>,

    contexts: Weak<ContextRegistry>,

    shutdown: CancellationToken,

    stopped: AtomicBool,

    received: AtomicU64,

    send_timeout: Duration,
}

/// Interrupt mailbox for one context. Clones share state.
#[derive(Clone)]
pub struct InterruptController {
    inner: Arc<Inner>,
}

impl InterruptController {
    /// Create a controller whose cancellable sub-contexts derive from `parent`
    pub fn new(
        config: &InterruptConfig,
        parent: CancellationToken,
        contexts: Weak<ContextRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let active = parent.child_token();
        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                state: Mutex::new(State::default()),
                parent,
                active: Mutex::new(active),
                handler: RwLock::new(None),
                listener: Mutex::new(None),
                owner_id: RwLock::new(String::new()),
                contexts,
                shutdown: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                received: AtomicU64::new(0),
                send_timeout: config.send_timeout(),
            }),
        }
    }

    /// Start the listener. Idempotent; a stopped controller cannot restart.
    pub fn start(&self, owner_id: &str) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(EngineError::InterruptStopped);
        }

        let mut rx_slot = self.inner.rx.lock();
        if rx_slot.is_none() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::RuntimeUnavailable(e.to_string()))?;

        let Some(mut rx) = rx_slot.take() else {
            return Ok(());
        };
        *self.inner.owner_id.write() = owner_id.to_string();

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let listener = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(signal) => inner.handle_signal(signal),
                        None => break,
                    },
                }
            }
            debug!("Interrupt listener stopped");
        });
        *self.inner.listener.lock() = Some(listener);

        debug!(context_id = owner_id, "Interrupt listener started");
        Ok(())
    }

    /// Enqueue a signal, waiting up to the configured timeout for space
    pub async fn send_signal(&self, signal: InterruptSignal) -> Result<()> {
        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .ok_or(EngineError::InterruptStopped)?;
        match tx.send_timeout(signal, self.inner.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(EngineError::InterruptTimeout {
                timeout_ms: self.inner.send_timeout.as_millis() as u64,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(EngineError::InterruptStopped),
        }
    }

    /// Install the handler run for every accepted signal
    pub fn set_handler(&self, handler: InterruptHandler) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Take the current signal and promote the next queued one
    pub fn check(&self) -> Option<InterruptSignal> {
        let mut state = self.inner.state.lock();
        let current = state.current.take();
        state.current = state.pending.pop_front();
        current
    }

    /// Take every held signal, merged into one when more than one is held
    pub fn check_with_merge(&self) -> Option<InterruptSignal> {
        let mut state = self.inner.state.lock();
        let current = state.current.take()?;
        if state.pending.is_empty() {
            return Some(current);
        }
        let mut signals = Vec::with_capacity(state.pending.len() + 1);
        signals.push(current);
        signals.extend(state.pending.drain(..));
        InterruptSignal::merge(signals)
    }

    /// The current signal, without consuming it
    pub fn peek(&self) -> Option<InterruptSignal> {
        self.inner.state.lock().current.clone()
    }

    /// Current signal plus queued ones
    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        usize::from(state.current.is_some()) + state.pending.len()
    }

    /// Drop every held signal and reset the interrupted flag
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.current = None;
        state.pending.clear();
        state.last_fired = None;
    }

    /// True once a force signal has fired, until [`clear`](Self::clear)
    ///
    /// Also true when the owning request itself was cancelled.
    pub fn is_interrupted(&self) -> bool {
        let fired = self
            .inner
            .state
            .lock()
            .last_fired
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false);
        fired || self.inner.active.lock().is_cancelled()
    }

    /// Token for the current cancellable sub-context
    ///
    /// Work started under this token is cancelled by the next force signal.
    pub fn token(&self) -> CancellationToken {
        self.inner.active.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the listener, cancel the active sub-context, close the mailbox
    /// and drop every held signal. Terminal.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.active.lock().cancel();
        drop(self.inner.tx.lock().take());
        drop(self.inner.rx.lock().take());
        // The listener exits on the shutdown token; detach it
        drop(self.inner.listener.lock().take());
        {
            let mut state = self.inner.state.lock();
            state.current = None;
            state.pending.clear();
            state.last_fired = None;
        }
        let owner = self.inner.owner_id.read().clone();
        debug!(context_id = %owner, "Interrupt controller stopped");
    }

    pub fn stats(&self) -> InterruptStats {
        InterruptStats {
            received: self.inner.received.load(Ordering::Relaxed),
            pending: self.pending_count(),
            started: self.is_started(),
            stopped: self.is_stopped(),
        }
    }
}

impl Inner {
    fn handle_signal(&self, signal: InterruptSignal) {
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(INTERRUPT_SIGNALS).increment(1);

        {
            let mut state = self.state.lock();
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            if state.current.is_none() {
                state.current = Some(signal.clone());
            } else {
                state.pending.push_back(signal.clone());
            }

            if signal.is_force() {
                let fresh = self.parent.child_token();
                let fired = std::mem::replace(&mut *self.active.lock(), fresh);
                fired.cancel();
                state.last_fired = Some(fired);
            }
        }

        let owner_id = self.owner_id.read().clone();
        info!(
            context_id = %owner_id,
            kind = ?signal.kind,
            messages = signal.messages.len(),
            "Interrupt signal received"
        );

        let Some(handler) = self.handler.read().clone() else {
            return;
        };
        let Some(ctx) = self
            .contexts
            .upgrade()
            .and_then(|contexts| contexts.get(&owner_id).ok())
        else {
            warn!(context_id = %owner_id, "Interrupt handler skipped, context not registered");
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = handler(ctx, signal).await {
                warn!(context_id = %owner_id, "Interrupt handler failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::signal::InterruptMessage;

    fn controller(timeout_ms: u64) -> InterruptController {
        let config = InterruptConfig {
            queue_capacity: 10,
            send_timeout_ms: timeout_ms,
        };
        InterruptController::new(&config, CancellationToken::new(), Weak::new())
    }

    async fn wait_for_pending(ctrl: &InterruptController, expected: usize) {
        for _ in 0..200 {
            if ctrl.pending_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} pending signals, found {}",
            expected,
            ctrl.pending_count()
        );
    }

    fn graceful(text: &str) -> InterruptSignal {
        InterruptSignal::graceful(vec![InterruptMessage::user(text)])
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let ctrl = controller(500);
        ctrl.start("ctx-fifo").unwrap();

        for text in ["a", "b", "c"] {
            ctrl.send_signal(graceful(text)).await.unwrap();
        }
        wait_for_pending(&ctrl, 3).await;

        assert_eq!(ctrl.peek().unwrap().messages[0].content, "a");
        assert_eq!(ctrl.pending_count(), 3);

        let order: Vec<String> = std::iter::from_fn(|| ctrl.check())
            .map(|s| s.messages[0].content.clone())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(ctrl.pending_count(), 0);
        ctrl.stop();
    }

    #[tokio::test]
    async fn test_check_with_merge() {
        let ctrl = controller(500);
        ctrl.start("ctx-merge").unwrap();
        for text in ["first", "second", "third"] {
            ctrl.send_signal(graceful(text)).await.unwrap();
        }
        wait_for_pending(&ctrl, 3).await;

        let merged = ctrl.check_with_merge().unwrap();
        let contents: Vec<_> = merged.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert!(merged.is_merged());
        assert_eq!(merged.metadata["merged_count"], serde_json::json!(3));
        assert_eq!(ctrl.pending_count(), 0);
        assert!(ctrl.check_with_merge().is_none());
        ctrl.stop();
    }

    #[tokio::test]
    async fn test_merge_two_then_check_is_empty() {
        let ctrl = controller(500);
        ctrl.start("ctx-merge-two").unwrap();
        ctrl.send_signal(graceful("a")).await.unwrap();
        ctrl.send_signal(graceful("b")).await.unwrap();
        wait_for_pending(&ctrl, 2).await;

        let merged = ctrl.check_with_merge().unwrap();
        let contents: Vec<_> = merged.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
        assert_eq!(merged.metadata["merged_count"], serde_json::json!(2));
        assert!(ctrl.check().is_none());
        ctrl.stop();
    }

    #[tokio::test]
    async fn test_merge_single_signal_has_no_tag() {
        let ctrl = controller(500);
        ctrl.start("ctx-single").unwrap();
        ctrl.send_signal(graceful("only")).await.unwrap();
        wait_for_pending(&ctrl, 1).await;

        let signal = ctrl.check_with_merge().unwrap();
        assert!(!signal.is_merged());
        assert!(!signal.metadata.contains_key("merged_count"));
        ctrl.stop();
    }

    #[tokio::test]
    async fn test_full_mailbox_times_out() {
        let ctrl = controller(50);
        // Not started: nothing drains the mailbox
        for i in 0..10 {
            ctrl.send_signal(graceful(&format!("{}", i))).await.unwrap();
        }
        let err = ctrl.send_signal(graceful("overflow")).await.unwrap_err();
        assert!(matches!(err, EngineError::InterruptTimeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn test_force_cancels_and_replaces_token() {
        let ctrl = controller(500);
        ctrl.start("ctx-force").unwrap();
        let before = ctrl.token();
        assert!(!ctrl.is_interrupted());

        ctrl.send_signal(InterruptSignal::cancel()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), before.cancelled())
            .await
            .expect("old token cancelled");

        assert!(ctrl.is_interrupted());
        assert!(!ctrl.token().is_cancelled());

        ctrl.clear();
        assert!(!ctrl.is_interrupted());
        ctrl.stop();
    }

    #[tokio::test]
    async fn test_graceful_does_not_cancel() {
        let ctrl = controller(500);
        ctrl.start("ctx-graceful").unwrap();
        let token = ctrl.token();
        ctrl.send_signal(graceful("keep going")).await.unwrap();
        wait_for_pending(&ctrl, 1).await;

        assert!(!token.is_cancelled());
        assert!(!ctrl.is_interrupted());
        ctrl.stop();
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_terminal() {
        let ctrl = controller(500);
        ctrl.start("ctx-life").unwrap();
        ctrl.start("ctx-life").unwrap();
        assert!(ctrl.is_started());

        let token = ctrl.token();
        ctrl.stop();
        ctrl.stop();
        assert!(token.is_cancelled());
        assert!(matches!(ctrl.start("ctx-life"), Err(EngineError::InterruptStopped)));
        assert!(matches!(
            ctrl.send_signal(graceful("late")).await,
            Err(EngineError::InterruptStopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_drops_held_signals() {
        let ctrl = controller(500);
        ctrl.start("ctx-stop").unwrap();
        ctrl.send_signal(graceful("a")).await.unwrap();
        ctrl.send_signal(graceful("b")).await.unwrap();
        wait_for_pending(&ctrl, 2).await;

        ctrl.stop();
        assert_eq!(ctrl.pending_count(), 0);
        assert!(ctrl.peek().is_none());
        assert!(ctrl.check().is_none());
        assert!(ctrl.check_with_merge().is_none());
        assert!(matches!(
            ctrl.send_signal(graceful("c")).await,
            Err(EngineError::InterruptStopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_closes_mailbox() {
        let ctrl = controller(500);
        ctrl.send_signal(graceful("queued")).await.unwrap();
        ctrl.stop();
        assert!(ctrl.inner.tx.lock().is_none());
        assert!(ctrl.inner.rx.lock().is_none());
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[test]
    fn test_start_requires_runtime() {
        let ctrl = controller(500);
        assert!(matches!(
            ctrl.start("ctx-none"),
            Err(EngineError::RuntimeUnavailable(_))
        ));
        assert!(!ctrl.is_started());
    }

    #[tokio::test]
    async fn test_parent_cancellation_marks_interrupted() {
        let parent = CancellationToken::new();
        let ctrl = InterruptController::new(&InterruptConfig::default(), parent.clone(), Weak::new());
        parent.cancel();
        assert!(ctrl.is_interrupted());
        assert!(ctrl.token().is_cancelled());
    }
}
