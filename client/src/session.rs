use std::sync::Arc;
use std::thread;
use std::time::Duration;

use score_stream_common::config::Config;
use score_stream_common::wire::DEFAULT_MAX_MESSAGE_BYTES;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregate::{AggregateState, Snapshot};
use crate::error::CaptureError;
use crate::source::FrameSource;
use crate::worker::{self, WorkerSetup, WorkerState, WorkerThread};

/// Everything `start` needs besides the frame source.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub address: String,
    pub rate_hz: f64,
    pub connect_timeout: Duration,
    /// Deadline for each send and each receive. `None` waits forever.
    pub io_timeout: Option<Duration>,
    pub max_message_bytes: u64,
}

impl SessionConfig {
    pub fn new(address: impl Into<String>, rate_hz: f64) -> Self {
        Self {
            address: address.into(),
            rate_hz,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Some(Duration::from_secs(5)),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.server.address.clone(),
            rate_hz: config.capture.rate_hz,
            connect_timeout: config.server.connect_timeout(),
            io_timeout: config.server.io_timeout(),
            max_message_bytes: config.server.max_message_bytes,
        }
    }

    pub fn with_io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Time between the end of one tick and the start of the next.
    pub fn interval(&self) -> Result<Duration, CaptureError> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(CaptureError::InvalidRate(self.rate_hz));
        }
        Duration::try_from_secs_f64(1.0 / self.rate_hz)
            .map_err(|_| CaptureError::InvalidRate(self.rate_hz))
    }
}

/// Result of `stop`: the aggregate at the moment the worker quiesced, plus
/// the fatal error that ended the worker early, if there was one.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub average_score: f64,
    pub sample_count: u64,
    #[serde(skip)]
    pub error: Option<CaptureError>,
}

impl CaptureSummary {
    fn new(snapshot: Snapshot, error: Option<CaptureError>) -> Self {
        Self {
            average_score: snapshot.average,
            sample_count: snapshot.count,
            error,
        }
    }
}

struct LiveWorker {
    cancel: CancellationToken,
    thread: thread::JoinHandle<()>,
    outcome: oneshot::Receiver<Result<(), CaptureError>>,
}

/// Controller-facing handle for one capture session at a time.
///
/// `start` launches the worker, `stop` (or `shutdown`) collects it. The worker
/// runs on its own thread and owns the socket and the frame source; it closes
/// both before that thread exits. Dropping a session with a live worker
/// cancels it and blocks until the thread has exited, so the connection and
/// the source are closed by the time the drop returns. That wait is bounded
/// like `stop`: at most one in-flight round trip, capped by the I/O deadline.
pub struct CaptureSession {
    aggregate: Arc<AggregateState>,
    worker: Option<LiveWorker>,
    state_tx: watch::Sender<WorkerState>,
    state_rx: watch::Receiver<WorkerState>,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        Self {
            aggregate: Arc::new(AggregateState::new()),
            worker: None,
            state_tx,
            state_rx,
        }
    }

    /// Open the connection and launch the worker. Returns once the connection
    /// is up, without waiting for any tick. Must be called from within a
    /// tokio runtime.
    ///
    /// The session takes ownership of `source`: if `start` fails, the source
    /// has already been closed when the error comes back.
    pub async fn start(
        &mut self,
        config: SessionConfig,
        mut source: Box<dyn FrameSource>,
    ) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            source.close().await;
            return Err(CaptureError::AlreadyRunning);
        }
        let interval = match config.interval() {
            Ok(interval) => interval,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };

        self.aggregate.reset();
        let addr = config.address.clone();
        let rate_hz = config.rate_hz;
        let cancel = CancellationToken::new();
        let WorkerThread {
            thread,
            opened,
            outcome,
        } = worker::spawn(WorkerSetup {
            config,
            interval,
            source,
            aggregate: Arc::clone(&self.aggregate),
            cancel: cancel.clone(),
            state: self.state_tx.clone(),
        })?;

        let opened = match opened.await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::WorkerPanicked(
                "capture worker exited before connecting".into(),
            )),
        };
        if let Err(e) = opened {
            join_worker(thread).await;
            return Err(e);
        }

        info!(addr, rate_hz, "capture session started");
        self.worker = Some(LiveWorker {
            cancel,
            thread,
            outcome,
        });
        Ok(())
    }

    /// Cancel the worker, wait for it to exit and report the aggregate.
    ///
    /// The wait is bounded by one in-flight round trip (and so by the I/O
    /// deadline when one is configured); a sleeping worker wakes at once.
    /// Without a live worker this returns the current aggregate, which is
    /// zero for a session that was never started.
    pub async fn stop(&mut self) -> CaptureSummary {
        let Some(LiveWorker {
            cancel,
            thread,
            outcome,
        }) = self.worker.take()
        else {
            return CaptureSummary::new(self.aggregate.snapshot(), None);
        };

        cancel.cancel();
        let error = match outcome.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => {
                warn!("capture worker exited without reporting");
                Some(CaptureError::WorkerPanicked(
                    "capture worker exited without reporting".into(),
                ))
            }
        };
        join_worker(thread).await;

        let snapshot = self.aggregate.snapshot();
        info!(
            average = snapshot.average,
            count = snapshot.count,
            failed = error.is_some(),
            "capture session stopped"
        );
        CaptureSummary::new(snapshot, error)
    }

    /// `stop`, consuming the session. Everything the worker held is released
    /// when this resolves.
    pub async fn shutdown(mut self) -> CaptureSummary {
        self.stop().await
    }

    /// Live view of the running average.
    pub fn snapshot(&self) -> Snapshot {
        self.aggregate.snapshot()
    }

    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// True while a worker has been started and not yet collected by `stop`,
    /// even if it has already exited on its own.
    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Resolves once the worker has reached `Stopped`, whether it was
    /// cancelled or died on a fatal error. Resolves immediately when no
    /// worker is live.
    pub async fn stopped(&self) {
        if self.worker.is_none() {
            return;
        }
        let mut rx = self.state_rx.clone();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = rx.wait_for(|state| *state == WorkerState::Stopped).await;
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(LiveWorker { cancel, thread, .. }) = self.worker.take() {
            cancel.cancel();
            if thread.join().is_err() {
                warn!("capture worker thread panicked");
            }
        }
    }
}

async fn join_worker(thread: thread::JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(())) => {}
        _ => warn!("capture worker thread panicked"),
    }
}
