//! Shared state tree for the Ensemble coordination framework.
//!
//! A hierarchical key-value store addressed by dot-separated paths, used as
//! the blackboard for cross-component communication. Supports whole-tree
//! JSON snapshots on disk and change subscriptions.
//!
//! # Main types
//!
//! - [`SharedState`] — Cloneable handle to the state tree.

/// The state tree and its persistence.
pub mod store;

pub use store::SharedState;
