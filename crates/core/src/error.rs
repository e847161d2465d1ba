/// Result alias that carries the custom [`KaraokeError`] type.
pub type Result<T> = std::result::Result<T, KaraokeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum KaraokeError {
    /// Free-form message for failures that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A lyric script or configuration file was not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// An audio device fault surfaced to a caller that asked for it.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A lock guarding shared state was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// The audio worker is gone and can no longer accept commands.
    #[error("audio engine is not running")]
    EngineStopped,
    /// The worker has not drained its command queue; try again later.
    #[error("audio engine command queue is full")]
    EngineBusy,
}

impl KaraokeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

/// Recoverable faults reported by audio devices.
///
/// None of these stop the engine. A mic that fails reads as silence and a
/// monitor that fails is switched off.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("input device {index} not found")]
    NotFound { index: usize },
    #[error("failed to open {what}: {reason}")]
    Open { what: String, reason: String },
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("timed out waiting for {0} frames")]
    Timeout(usize),
    #[error("stream is closed")]
    Closed,
    #[error("no output device available")]
    NoOutputDevice,
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    pub(crate) fn open(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Open {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}
