//! Backend resource access.
//!
//! This module resolves request targets against the tuple store, reusing
//! cached bindings and small tuples where it can.

pub mod resource;

pub use resource::{Continuation, Phase, ProxySettings, ResourceProxy, Target};
