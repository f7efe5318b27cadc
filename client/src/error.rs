use std::time::Duration;

use score_stream_common::wire::WireError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to connect to scoring service at {addr}: {reason}")]
    Connection { addr: String, reason: String },
    #[error("connection to scoring service lost: {0}")]
    ConnectionLost(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("frame source failed: {0}")]
    FrameSource(String),
    #[error("capture session is already running")]
    AlreadyRunning,
    #[error("capture rate must be a positive number of frames per second, got {0}")]
    InvalidRate(f64),
    #[error("scoring service did not answer within {0:?}")]
    Timeout(Duration),
    #[error("failed to start capture worker: {0}")]
    WorkerStart(String),
    #[error("capture worker terminated abnormally: {0}")]
    WorkerPanicked(String),
}

impl From<WireError> for CaptureError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ConnectionLost(reason) => CaptureError::ConnectionLost(reason),
            WireError::Protocol(reason) => CaptureError::Protocol(reason),
        }
    }
}
