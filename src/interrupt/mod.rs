// src/interrupt/mod.rs
//! Interrupt subsystem
//!
//! Lets an external actor interject into a running request:
//!
//! - **Signal**: graceful (carries messages to fold into the conversation)
//!   or force (stops in-flight work)
//! - **Controller**: per-context bounded mailbox with a background listener,
//!   plus non-blocking check/merge for the request's own flow
//!
//! ```text
//! send_signal ──(≤500ms)──▶ [mailbox cap 10] ──▶ listener ──┬─▶ current / pending FIFO
//!                                                         ├─▶ force: cancel token
//!                                                         └─▶ handler task
//! ```

pub mod controller;
pub mod signal;

pub use controller::{handler, InterruptController, InterruptHandler, InterruptStats};
pub use signal::{InterruptMessage, InterruptSignal, InterruptType, Role};
