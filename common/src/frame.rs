use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// One captured frame.
///
/// The payload is opaque to the client: whatever the frame source produced
/// (a JPEG from a camera snapshot, a file from disk) is shipped as-is.
/// `captured_at_ms` and `seq` never go on the wire; they exist for logging.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data: data.into(),
            captured_at_ms,
            seq,
        }
    }

    /// Stamp a frame with the current wall-clock time.
    pub fn captured_now(data: impl Into<Bytes>, seq: u64) -> Self {
        Self::new(data, chrono::Utc::now().timestamp_millis(), seq)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reply from the scoring service for one frame.
///
/// JSON, tagged on `status`:
///   {"status": "ok", "score": 0.82}
///   {"status": "error", "message": "no face detected"}
/// Fields beyond these are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScoreResponse {
    Ok {
        score: f64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ScoreResponse {
    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(payload)
            .map_err(|e| WireError::Protocol(format!("malformed score response: {e}")))
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, WireError> {
        // JSON has no NaN or infinity; serde_json would quietly emit `null`.
        if let ScoreResponse::Ok { score } = self {
            if !score.is_finite() {
                return Err(WireError::Protocol(format!("score {score} is not representable")));
            }
        }
        serde_json::to_vec(self)
            .map_err(|e| WireError::Protocol(format!("cannot encode score response: {e}")))
    }

    /// The score, if the service accepted the frame.
    pub fn score(&self) -> Option<f64> {
        match self {
            ScoreResponse::Ok { score } => Some(*score),
            ScoreResponse::Error { .. } => None,
        }
    }
}
