// src/resources/mod.rs
//! Handle-based resource registry
//!
//! The single-threaded consumer never holds host objects directly; it holds
//! opaque handles issued here. Releasing a handle runs the object's
//! [`Resource::on_release`], which cascades to whatever the object owns.

pub mod registry;

pub use registry::{Resource, ResourceHandle, ResourceRegistry, ResourceStats};
