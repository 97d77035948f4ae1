//! Error types for mltrack
//!
//! The pipeline is best-effort by design: transport failures end in a logged
//! warning, not an error surfaced to the host loop. The variants here cover
//! the cases the host must actually handle.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// mltrack error types
#[derive(Error, Debug)]
pub enum Error {
    /// A strict scope was entered under a disallowed parent
    #[error("invalid nesting: {child} cannot be entered inside {parent}")]
    InvalidNesting {
        /// Scope kind being entered
        child: String,
        /// Current top-of-stack kind (or "<empty>")
        parent: String,
    },

    /// Exit was called for a kind that is not the current top of the stack
    #[error("scope mismatch: expected to exit {expected}, found {found}")]
    ScopeMismatch {
        /// Kind passed to `exit`
        expected: String,
        /// Kind actually on top of the stack (or "<empty>")
        found: String,
    },

    /// The collector asked the experiment to stop
    ///
    /// Surfaced once, and only when no stop callback is registered. After
    /// this, reporting calls become inert no-ops.
    #[error("experiment stopped by the collector")]
    ExperimentStopped,

    /// Transport-level failure talking to the collector
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP error from the collector endpoint
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The dispatch worker has shut down; no further commands are accepted
    #[error("dispatch channel closed")]
    ChannelClosed,

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error (log socket, forwarder spawn)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
