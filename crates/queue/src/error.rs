/// Crate-wide result type for queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors surfaced to callers of the queue.
///
/// Sender failures are never returned here; they resolve the item's
/// [`Outcome`](crate::Outcome) as `false`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The send was cancelled before it reported a result.
    #[error("delivery cancelled before a result was reported")]
    Cancelled,

    /// Timing values a queue cannot run with.
    #[error("invalid sending configuration: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    #[must_use]
    pub fn invalid_config(message: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            message: message.to_string(),
        }
    }
}

/// Why an item resolved as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The sender returned an error, panicked, or reported `false`.
    SendFailure,
    /// The item was scheduled during a block that outlived the retry window.
    BlockTimeout,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendFailure => "send_failure",
            Self::BlockTimeout => "block_timeout",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
