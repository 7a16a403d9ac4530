//! Error types for the trading agent orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Request / Routing Errors
    // =============================

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    // =============================
    // Specialist / Tool Errors
    // =============================

    #[error("Tool failure ({tool}): {message}")]
    ToolFailure { tool: String, message: String },

    // =============================
    // Trade Workflow Errors
    // =============================

    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    #[error("Order failure: {0}")]
    OrderFailure(String),

    #[error("Invalid proposal transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Model error: {0}")]
    Model(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Database error: {0}")]
    Database(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Failures a specialist runner feeds back into its reasoning context
    /// instead of terminating the run. A hallucinated tool name is
    /// correctable on the next round; malformed input is not.
    pub fn is_recoverable_for_specialist(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ToolFailure { .. }
                | OrchestrationError::ToolNotFound(_)
                | OrchestrationError::Http(_)
        )
    }

    /// Failures that end the whole request; the caller still receives a
    /// terminal event and stream marker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Model(_)
                | OrchestrationError::Checkpoint(_)
                | OrchestrationError::Database(_)
        )
    }
}
