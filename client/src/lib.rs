//! Streaming client for a remote frame-scoring service.
//!
//! A [`CaptureSession`] pulls frames from a [`FrameSource`] at a fixed rate,
//! ships each one over a persistent length-prefixed TCP connection and folds
//! the returned scores into a running average.

pub mod aggregate;
pub mod connection;
pub mod error;
pub mod session;
pub mod source;
mod worker;

pub use aggregate::{AggregateState, Snapshot};
pub use error::CaptureError;
pub use session::{CaptureSession, CaptureSummary, SessionConfig};
pub use source::{DeviceSource, DirectorySource, FrameSource, HttpSnapshotSource, SourceError};
pub use worker::WorkerState;
