use std::sync::Arc;
use std::thread;
use std::time::Duration;

use score_stream_common::frame::ScoreResponse;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::AggregateState;
use crate::connection::Connection;
use crate::error::CaptureError;
use crate::session::SessionConfig;
use crate::source::{FrameSource, SourceError};

/// Lifecycle of the capture worker as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// What happened on one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Tick {
    Scored(f64),
    Rejected,
    Skipped,
}

#[derive(Debug, Default)]
struct TickCounters {
    ticks: u64,
    scored: u64,
    rejected: u64,
    skipped: u64,
}

/// Everything the worker thread takes ownership of.
pub(crate) struct WorkerSetup {
    pub config: SessionConfig,
    pub interval: Duration,
    pub source: Box<dyn FrameSource>,
    pub aggregate: Arc<AggregateState>,
    pub cancel: CancellationToken,
    pub state: watch::Sender<WorkerState>,
}

/// Handle to a launched worker thread.
pub(crate) struct WorkerThread {
    pub thread: thread::JoinHandle<()>,
    /// Answers once the connection is open (or failed to open).
    pub opened: oneshot::Receiver<Result<(), CaptureError>>,
    /// Answers once the worker has released its resources.
    pub outcome: oneshot::Receiver<Result<(), CaptureError>>,
}

/// Start the worker on its own thread with its own single-threaded runtime.
///
/// The connection is opened on that runtime so every I/O resource the worker
/// owns lives and dies on the worker thread. Joining the thread therefore
/// guarantees the socket is shut and the frame source closed.
pub(crate) fn spawn(setup: WorkerSetup) -> Result<WorkerThread, CaptureError> {
    let (opened_tx, opened) = oneshot::channel();
    let (outcome_tx, outcome) = oneshot::channel();

    let thread = thread::Builder::new()
        .name("capture-worker".into())
        .spawn(move || worker_thread(setup, opened_tx, outcome_tx))
        .map_err(|e| CaptureError::WorkerStart(e.to_string()))?;

    Ok(WorkerThread {
        thread,
        opened,
        outcome,
    })
}

fn worker_thread(
    setup: WorkerSetup,
    opened: oneshot::Sender<Result<(), CaptureError>>,
    outcome: oneshot::Sender<Result<(), CaptureError>>,
) {
    let WorkerSetup {
        config,
        interval,
        mut source,
        aggregate,
        cancel,
        state,
    } = setup;

    // Reaches Stopped on every exit path, unwinding included.
    let state = scopeguard::guard(state, |state| {
        state.send_replace(WorkerState::Stopped);
    });

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build capture worker runtime");
            let _ = opened.send(Err(CaptureError::WorkerStart(e.to_string())));
            return;
        }
    };

    runtime.block_on(async move {
        let connection = match Connection::open(
            &config.address,
            config.connect_timeout,
            config.io_timeout,
            config.max_message_bytes,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                source.close().await;
                let _ = opened.send(Err(e));
                return;
            }
        };

        state.send_replace(WorkerState::Running);
        let worker = CaptureWorker {
            connection,
            source,
            aggregate,
            interval,
            cancel,
            state: state.clone(),
            counters: TickCounters::default(),
        };

        // The controller gave up on `start` before it finished.
        if opened.send(Ok(())).is_err() {
            worker.cancel.cancel();
        }
        let _ = outcome.send(worker.run().await);
    });
}

/// The capture loop. Owns the connection and the frame source outright; the
/// controller only ever sees the aggregate and the state channel.
struct CaptureWorker {
    connection: Connection,
    source: Box<dyn FrameSource>,
    aggregate: Arc<AggregateState>,
    interval: Duration,
    cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
    counters: TickCounters,
}

impl CaptureWorker {
    /// Run until cancelled or until a fatal error, then release the
    /// connection and the frame source. The fatal error, if any, is returned.
    async fn run(mut self) -> Result<(), CaptureError> {
        info!(
            addr = self.connection.addr(),
            source = self.source.name(),
            interval_ms = self.interval.as_millis() as u64,
            "capture worker running"
        );

        let result = self.run_loop().await;

        self.state.send_replace(WorkerState::Stopping);
        if let Err(e) = &result {
            warn!(error = %e, "capture worker stopping on fatal error");
        }
        self.connection.close().await;
        self.source.close().await;

        let c = &self.counters;
        info!(
            ticks = c.ticks,
            scored = c.scored,
            rejected = c.rejected,
            skipped = c.skipped,
            "capture worker stopped"
        );
        result
    }

    async fn run_loop(&mut self) -> Result<(), CaptureError> {
        loop {
            // A plain sleep, not a ticker: time spent capturing and waiting for
            // the score is not subtracted, so under load the effective rate
            // drifts below the configured one. The scorer only expects
            // best-effort cadence.
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => {}
            }
            if self.cancel.is_cancelled() {
                debug!("cancellation observed");
                return Ok(());
            }

            match self.tick().await? {
                Tick::Scored(score) => {
                    self.counters.scored += 1;
                    self.aggregate.record(score);
                }
                Tick::Rejected => self.counters.rejected += 1,
                Tick::Skipped => self.counters.skipped += 1,
            }
            self.counters.ticks += 1;

            if self.counters.ticks % 100 == 0 {
                let snap = self.aggregate.snapshot();
                debug!(
                    ticks = self.counters.ticks,
                    average = snap.average,
                    count = snap.count,
                    "capture progress"
                );
            }
        }
    }

    /// One capture, send, score cycle. `Err` is always fatal.
    async fn tick(&mut self) -> Result<Tick, CaptureError> {
        let frame = match self.source.capture_frame().await {
            Ok(frame) => frame,
            Err(SourceError::Transient(reason)) => {
                warn!(source = self.source.name(), reason, "frame capture failed, skipping tick");
                return Ok(Tick::Skipped);
            }
            Err(SourceError::Permanent(reason)) => {
                return Err(CaptureError::FrameSource(reason));
            }
        };

        // Frames the wire cannot carry are the source's problem, not the
        // connection's: drop the frame and keep the session.
        if frame.is_empty() {
            warn!(seq = frame.seq, "frame source produced an empty frame, skipping tick");
            return Ok(Tick::Skipped);
        }
        let limit = self.connection.max_message_bytes();
        if frame.len() as u64 > limit {
            warn!(
                seq = frame.seq,
                bytes = frame.len(),
                limit,
                "frame exceeds message size limit, skipping tick"
            );
            return Ok(Tick::Skipped);
        }

        debug!(seq = frame.seq, bytes = frame.len(), "sending frame");
        match self.connection.round_trip(&frame.data).await? {
            ScoreResponse::Ok { score } => {
                debug!(seq = frame.seq, score, "frame scored");
                Ok(Tick::Scored(score))
            }
            ScoreResponse::Error { message } => {
                debug!(seq = frame.seq, message = message.as_deref(), "scorer rejected frame");
                Ok(Tick::Rejected)
            }
        }
    }
}
