//! Error types for the warbler toolkit
//!
//! Library-level code uses the typed `Error` enum; structural invariants that
//! can only be violated by a programming error stay assertions in the code
//! that owns them.

use thiserror::Error;

/// Errors produced while compiling a search network or driving a decoder.
#[derive(Debug, Error)]
pub enum Error {
    /// The acoustic model or lexicon is inconsistent with the requested
    /// topology. Build aborts; no partial network is handed out.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// The lexicon violates a precondition of the selected builder.
    #[error("lexicon error: {0}")]
    Lexicon(String),

    /// A search-protocol method was called in the wrong lifecycle state.
    #[error("search protocol violation: {0}")]
    Protocol(&'static str),

    /// A feature frame did not match the expected layout.
    #[error("feature error: {0}")]
    Feature(String),
}

/// Result type alias for warbler operations
pub type Result<T> = std::result::Result<T, Error>;
