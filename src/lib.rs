//! Lobster: pipe-syntax pipelines with resumable approval gates
//!
//! A pipeline is a chain of commands written the way a shell would read it:
//!
//! ```text
//! exec --json gh pr list --json number,title | approve | table
//! ```
//!
//! Each stage consumes the previous stage's items and emits its own. When a
//! run reaches an `approve` stage whose gate has not been approved, it stops
//! and hands back a resume token. Approving the gate out-of-band and calling
//! `resume` with that token continues from the same stage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ Parser       │──▶│ Runtime        │──▶│ CommandRegistry  │
//! │ "a | b | c"  │   │ stage loop     │   │ exec approve json│
//! └──────────────┘   └───────┬────────┘   │ table echo ...   │
//!                            │            └──────────────────┘
//!              pause/resume  ▼
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ ResumeToken  │◀──│ StateManager   │──▶│ GateStore        │
//! │ base64url    │   │ runs/ gates/   │   │ pending/approved │
//! └──────────────┘   └────────────────┘   └──────────────────┘
//! ```

pub mod commands;
pub mod config;
pub mod pipeline;
pub mod workflow;

// Re-exports for convenience
pub use commands::{CommandRegistry, StageContext, StageHandler, StageOutput};
pub use config::Config;
pub use pipeline::{Outcome, PipelineDefinition, ResumeToken, Runtime, StageDescriptor};
pub use workflow::{ApprovalGate, GateStatus, GateStore, RunRecord, RunStatus, StateManager};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Gate '{gate}' rejected: {reason}")]
    GateRejected { gate: String, reason: String },

    #[error("Invalid resume token: {0}")]
    InvalidToken(String),

    #[error("Command failed: {0}")]
    HandlerExecution(String),

    #[error("Invalid gate transition: {0}")]
    GateTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Stable machine-readable tag for this error class
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse(_) => "parse",
            Error::UnknownCommand(_) => "unknown_command",
            Error::GateRejected { .. } => "gate_rejected",
            Error::InvalidToken(_) => "invalid_token",
            Error::HandlerExecution(_) | Error::Http(_) => "handler_execution",
            Error::GateTransition(_) => "gate_transition",
            Error::NotFound(_) => "not_found",
            Error::State(_) | Error::Json(_) => "state",
            Error::Config(_) | Error::Toml(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
