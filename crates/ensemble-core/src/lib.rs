//! Core types and error definitions for the Ensemble coordination framework.
//!
//! This crate provides the foundational types shared across all Ensemble
//! crates: the unified error enum, the normalized capability representation,
//! and the contracts implemented by external collaborators (agent executors
//! and language-model clients).
//!
//! # Main types
//!
//! - [`EnsembleError`] — Unified error enum for all Ensemble subsystems.
//! - [`EnsembleResult`] — Convenience alias for `Result<T, EnsembleError>`.
//! - [`Capability`] — A named ability an agent claims to have.
//! - [`AgentExecutor`] — Contract implemented by concrete agents.
//! - [`LlmClient`] — Contract implemented by language-model backends.

/// Normalized capability representation.
pub mod capability;
/// External collaborator contracts.
pub mod executor;

pub use capability::Capability;
pub use executor::{AgentExecutor, ExecutionContext, GenerateOptions, LlmClient};

// --- Error types ---

/// Top-level error type for the Ensemble framework.
///
/// Each variant is a failure kind callers are expected to distinguish.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// An id that must be unique is already taken.
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// A referenced agent, task, or dependency does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input, rejected at an API boundary before any mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No agent matched a task's requirements. Recoverable: the task stays
    /// pending and is retried on the next scan.
    #[error("No eligible agent: {0}")]
    NoEligibleAgent(String),

    /// An agent's process call or an LLM client call failed.
    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    /// A collaborator call exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An error in the shared state tree or its persistence.
    #[error("State error: {0}")]
    State(String),

    /// An error that aborts an entire workflow.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`EnsembleError`].
pub type EnsembleResult<T> = Result<T, EnsembleError>;
