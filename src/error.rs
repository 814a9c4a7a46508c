use thiserror::Error;

use crate::sdk::NativeCode;

/// Errors surfaced by the session, the acquisition controller and export.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera driver not initialized")]
    SdkNotInitialized,
    #[error("no camera at index {0}")]
    DeviceUnavailable(u32),
    #[error("camera not connected")]
    NotConnected,
    #[error("operation conflicts with current acquisition state")]
    Busy,
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("no frame captured yet")]
    FrameNotYetAvailable,
    #[error("native call failed: {0}")]
    NativeFailure(NativeCode),
    #[error("unsupported bit depth {0}")]
    UnsupportedDepth(u8),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("image export failed: {0}")]
    Export(#[from] image::ImageError),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("failed to spawn capture worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("capture task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<NativeCode> for CaptureError {
    fn from(code: NativeCode) -> Self {
        match code {
            NativeCode::Timeout => Self::Timeout,
            NativeCode::NotInit => Self::SdkNotInitialized,
            other => Self::NativeFailure(other),
        }
    }
}

/// A teardown step that did not complete cleanly.
///
/// These never abort a stop; they are collected into a degraded
/// [`StopReport`](crate::capture::StopReport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceCleanupWarning {
    #[error("capture worker did not exit in time and was detached")]
    JoinTimedOut,
    #[error("abort-wait failed: {0}")]
    AbortWaitFailed(NativeCode),
    #[error("stop-capture failed: {0}")]
    StopFailed(NativeCode),
    #[error("buffer release failed: {0}")]
    ReleaseFailed(NativeCode),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
