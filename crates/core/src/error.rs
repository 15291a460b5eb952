/// Result alias that carries the custom [`WaveviewError`] type.
pub type Result<T> = std::result::Result<T, WaveviewError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum WaveviewError {
    /// Input of the wrong shape, e.g. an empty sample buffer or a zero
    /// output dimension. Raised before any work starts and never retried.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The source bytes could not be acquired.
    #[error("failed to fetch audio: {0}")]
    Transport(String),
    /// The acquired bytes could not be turned into PCM samples.
    #[error("failed to decode audio: {0}")]
    Decode(String),
    /// A task observed its cancellation token. Not user facing.
    #[error("task was cancelled")]
    Cancelled,
    #[error("fft failed: {0}")]
    Fft(#[from] realfft::FftError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

impl WaveviewError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<&str> for WaveviewError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for WaveviewError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
