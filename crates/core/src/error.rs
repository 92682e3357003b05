/// Result alias that carries the custom [`CliftError`] type.
pub type Result<T> = std::result::Result<T, CliftError>;

/// Common error type for the engine crate.
#[derive(Debug, thiserror::Error)]
pub enum CliftError {
    /// Free-form failure raised by a producer or the binary.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration or control payload that failed to (de)serialise.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Failure reported by the FFT backend.
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
    /// A value supplied by the caller is outside its documented range.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Two frames that must share a size did not.
    ///
    /// Both decks render at the shared terminal size, so this means a
    /// structural invariant was broken elsewhere. The scheduler treats it as
    /// fatal.
    #[error("frame dimensions differ: {left_width}x{left_height} vs {right_width}x{right_height}")]
    DimensionMismatch {
        left_width: usize,
        left_height: usize,
        right_width: usize,
        right_height: usize,
    },
    /// An operation was invoked while the scheduler was in the wrong state.
    #[error("scheduler is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// The command intake has been closed by shutdown.
    #[error("command intake is closed")]
    Closed,
}

impl CliftError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}
