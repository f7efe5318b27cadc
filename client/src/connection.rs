use std::future::Future;
use std::time::Duration;

use score_stream_common::frame::ScoreResponse;
use score_stream_common::wire;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::CaptureError;

/// The single persistent stream to the scoring service.
///
/// Strictly one request then one response; nothing is buffered between
/// calls beyond what the codec needs to assemble a message.
pub struct Connection {
    stream: Option<TcpStream>,
    addr: String,
    io_timeout: Option<Duration>,
    max_message_bytes: u64,
}

impl Connection {
    pub async fn open(
        addr: &str,
        connect_timeout: Duration,
        io_timeout: Option<Duration>,
        max_message_bytes: u64,
    ) -> Result<Self, CaptureError> {
        let connect_err = |reason: String| CaptureError::Connection {
            addr: addr.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| connect_err(format!("timed out after {connect_timeout:?}")))?
            .map_err(|e| connect_err(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }

        info!(addr, "connected to scoring service");
        Ok(Self {
            stream: Some(stream),
            addr: addr.to_string(),
            io_timeout,
            max_message_bytes,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Largest payload `send` will put on the wire.
    pub fn max_message_bytes(&self) -> u64 {
        self.max_message_bytes
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write one length-prefixed message.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), CaptureError> {
        let max = self.max_message_bytes;
        let deadline = self.io_timeout;
        let stream = self.stream_mut()?;
        with_deadline(deadline, wire::write_message(stream, payload, max)).await
    }

    /// Read one message and decode it as a score.
    pub async fn receive_response(&mut self) -> Result<ScoreResponse, CaptureError> {
        let max = self.max_message_bytes;
        let deadline = self.io_timeout;
        let stream = self.stream_mut()?;
        let payload = with_deadline(deadline, wire::read_message(stream, max)).await?;
        Ok(ScoreResponse::from_payload(&payload)?)
    }

    pub async fn round_trip(&mut self, payload: &[u8]) -> Result<ScoreResponse, CaptureError> {
        self.send(payload).await?;
        self.receive_response().await
    }

    /// Shut the stream down. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "error shutting down scoring connection");
            }
            info!(addr = self.addr, "closed scoring connection");
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, CaptureError> {
        self.stream
            .as_mut()
            .ok_or_else(|| CaptureError::ConnectionLost("connection already closed".into()))
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T, CaptureError>
where
    F: Future<Output = Result<T, wire::WireError>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CaptureError::Timeout(limit))?
            .map_err(CaptureError::from),
        None => fut.await.map_err(CaptureError::from),
    }
}
