use serde::{Deserialize, Serialize};

/// Result alias that carries the custom [`GardenLiveError`] type.
pub type Result<T> = std::result::Result<T, GardenLiveError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum GardenLiveError {
    /// Free-form failure that has no better home, e.g. a poisoned lock.
    #[error("{0}")]
    Message(String),
    /// A caller handed the API something it cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Pattern source matched the denylist; execution never began.
    #[error("{0}")]
    Validation(String),
    /// The pattern runtime failed to load or initialise. Retryable.
    #[error("failed to load pattern runtime: {0}")]
    Load(String),
    /// The user's pattern threw while running.
    #[error("{0}")]
    Runtime(String),
    /// The analyser could not be spliced into the runtime output.
    #[error("could not tap runtime output: {0}")]
    GraphSplice(String),
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Wav(#[from] hound::Error),
}

/// User-facing classification attached to block error notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Load,
    Runtime,
}

impl GardenLiveError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns how the error should be presented to the user, or `None` for
    /// errors that degrade silently.
    pub fn classification(&self) -> Option<ErrorKind> {
        match self {
            Self::Validation(_) => Some(ErrorKind::Validation),
            Self::Load(_) => Some(ErrorKind::Load),
            Self::GraphSplice(_) => None,
            _ => Some(ErrorKind::Runtime),
        }
    }
}

impl From<&str> for GardenLiveError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for GardenLiveError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
