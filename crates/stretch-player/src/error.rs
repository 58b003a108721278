use thiserror::Error;

/// Result alias used across the playback core.
pub type Result<T, E = PlayerError> = std::result::Result<T, E>;

/// Errors surfaced by the decoder, sinks, processor and session.
///
/// Nothing in this crate retries on its own; callers decide whether to re-open
/// with another source.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// The media source could not be read.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// No audio track, or no codec for the track's media type.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// A call received a value it cannot accept; no state was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is not allowed in the current state; the state is preserved.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The operation is not available for this player kind.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// A condition the pipeline assumes impossible; aborts the session.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The output device or its rate conversion failed.
    #[error("output error: {0}")]
    Output(String),
}

impl PlayerError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
