use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use score_stream_common::frame::Frame;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// This tick has no frame; try again next tick.
    #[error("transient frame source failure: {0}")]
    Transient(String),
    /// The source will never produce another frame.
    #[error("frame source unavailable: {0}")]
    Permanent(String),
}

/// Something that can hand the capture worker one frame per tick.
///
/// The worker owns its source exclusively for the lifetime of a session and
/// calls `close` exactly once when it exits.
#[async_trait]
pub trait FrameSource: Send {
    async fn capture_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the underlying device. Called when the worker exits.
    async fn close(&mut self) {}

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

// ---------------------------------------------------------------------------
// HTTP snapshot camera
// ---------------------------------------------------------------------------

/// Fetches one JPEG per tick from a camera's single-frame endpoint.
///
/// A failed fetch only skips the tick. After `max_consecutive_failures`
/// failures in a row the camera is considered gone.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
    seq: u64,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl HttpSnapshotSource {
    pub fn new(
        frame_url: &str,
        quality: u32,
        max_consecutive_failures: u32,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SourceError::Permanent(format!("failed to build HTTP client: {e}")))?;
        let separator = if frame_url.contains('?') { '&' } else { '?' };
        Ok(Self {
            client,
            url: format!("{frame_url}{separator}quality={quality}"),
            seq: 0,
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn failure(&mut self, reason: String) -> SourceError {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_consecutive_failures {
            SourceError::Permanent(format!(
                "{} consecutive failures, last: {reason}",
                self.consecutive_failures
            ))
        } else {
            SourceError::Transient(reason)
        }
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => return Err(self.failure(format!("failed to fetch camera frame: {e}"))),
        };
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(self.failure(format!("camera returned HTTP {status}")));
        }
        let data = match resp.bytes().await {
            Ok(data) => data,
            Err(e) => return Err(self.failure(format!("camera body read failed: {e}"))),
        };

        self.consecutive_failures = 0;
        let seq = self.seq;
        self.seq += 1;
        debug!(seq, bytes = data.len(), "fetched camera frame");
        Ok(Frame::captured_now(data, seq))
    }

    fn name(&self) -> &str {
        "http-snapshot"
    }
}

// ---------------------------------------------------------------------------
// Directory replay
// ---------------------------------------------------------------------------

/// Replays the files of a directory, in file-name order, one per tick.
///
/// With `loop_frames` the sequence restarts after the last file; without it,
/// running off the end is a permanent failure that ends the session.
pub struct DirectorySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    seq: u64,
    loop_frames: bool,
}

impl DirectorySource {
    pub fn open(dir: &Path, loop_frames: bool) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            SourceError::Permanent(format!("cannot read frame directory {}: {e}", dir.display()))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(SourceError::Permanent(format!(
                "frame directory {} contains no files",
                dir.display()
            )));
        }

        info!(dir = %dir.display(), frames = files.len(), loop_frames, "opened frame directory");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: 0,
            seq: 0,
            loop_frames,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        if self.next >= self.files.len() {
            if !self.loop_frames {
                return Err(SourceError::Permanent(format!(
                    "all {} frames in {} replayed",
                    self.files.len(),
                    self.dir.display()
                )));
            }
            self.next = 0;
        }

        let path = &self.files[self.next];
        self.next += 1;

        let data = tokio::fs::read(path).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to read frame file");
            SourceError::Transient(format!("cannot read {}: {e}", path.display()))
        })?;

        let seq = self.seq;
        self.seq += 1;
        Ok(Frame::captured_now(data, seq))
    }

    fn name(&self) -> &str {
        "directory"
    }
}

// ---------------------------------------------------------------------------
// Local video device
// ---------------------------------------------------------------------------

/// Grabs one frame per tick from a local camera by running a capture command
/// that writes a single encoded image to stdout.
///
/// The default command is an ffmpeg V4L2 grab of `device`, emitted as JPEG.
/// The device is opened per tick and released when the command exits, so the
/// capture latency counts against the tick interval. A command that cannot
/// be started at all is permanent; a failed or empty grab only skips the tick
/// until `max_consecutive_failures` in a row.
pub struct DeviceSource {
    device: String,
    program: String,
    args: Vec<String>,
    seq: u64,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
}

impl DeviceSource {
    pub fn new(device: &str, max_consecutive_failures: u32) -> Self {
        let args = [
            "-hide_banner", "-loglevel", "error",
            "-f", "v4l2",
            "-i", device,
            "-frames:v", "1",
            "-f", "image2pipe",
            "-vcodec", "mjpeg",
            "pipe:1",
        ];
        Self::with_command(
            device,
            "ffmpeg",
            args.iter().map(|s| s.to_string()).collect(),
            max_consecutive_failures,
        )
    }

    /// Use a custom grab command instead of ffmpeg.
    pub fn with_command(
        device: &str,
        program: &str,
        args: Vec<String>,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            device: device.to_string(),
            program: program.to_string(),
            args,
            seq: 0,
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn failure(&mut self, reason: String) -> SourceError {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_consecutive_failures {
            SourceError::Permanent(format!(
                "{} consecutive failures, last: {reason}",
                self.consecutive_failures
            ))
        } else {
            SourceError::Transient(reason)
        }
    }
}

#[async_trait]
impl FrameSource for DeviceSource {
    async fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                SourceError::Permanent(format!("cannot run {} for {}: {e}", self.program, self.device))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(self.failure(format!(
                "{} grab from {} exited with {}: {detail}",
                self.program, self.device, output.status
            )));
        }
        if output.stdout.is_empty() {
            return Err(self.failure(format!("{} produced no image", self.device)));
        }

        self.consecutive_failures = 0;
        let seq = self.seq;
        self.seq += 1;
        debug!(seq, bytes = output.stdout.len(), device = self.device, "grabbed device frame");
        Ok(Frame::captured_now(output.stdout, seq))
    }

    fn name(&self) -> &str {
        "device"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_frames(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
    }

    #[tokio::test]
    async fn directory_replays_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_frames(tmp.path(), &["b.jpg", "a.jpg", "c.jpg"]);

        let mut source = DirectorySource::open(tmp.path(), false).unwrap();
        assert_eq!(source.len(), 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = source.capture_frame().await.unwrap();
            seen.push((frame.seq, String::from_utf8(frame.data.to_vec()).unwrap()));
        }
        assert_eq!(
            seen,
            vec![
                (0, "a.jpg".to_string()),
                (1, "b.jpg".to_string()),
                (2, "c.jpg".to_string())
            ]
        );

        let err = source.capture_frame().await.unwrap_err();
        assert!(matches!(err, SourceError::Permanent(_)));
    }

    #[tokio::test]
    async fn directory_loops_when_asked() {
        let tmp = tempfile::tempdir().unwrap();
        write_frames(tmp.path(), &["0001.jpg", "0002.jpg"]);

        let mut source = DirectorySource::open(tmp.path(), true).unwrap();
        let mut names = Vec::new();
        for _ in 0..5 {
            let frame = source.capture_frame().await.unwrap();
            names.push(String::from_utf8(frame.data.to_vec()).unwrap());
        }
        assert_eq!(names, ["0001.jpg", "0002.jpg", "0001.jpg", "0002.jpg", "0001.jpg"]);
    }

    #[tokio::test]
    async fn vanished_file_is_transient() {
        let tmp = tempfile::tempdir().unwrap();
        write_frames(tmp.path(), &["a.jpg", "b.jpg"]);
        let mut source = DirectorySource::open(tmp.path(), false).unwrap();
        std::fs::remove_file(tmp.path().join("a.jpg")).unwrap();

        assert!(matches!(
            source.capture_frame().await,
            Err(SourceError::Transient(_))
        ));
        let frame = source.capture_frame().await.unwrap();
        assert_eq!(&frame.data[..], b"b.jpg");
    }

    #[test]
    fn empty_or_missing_directory_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            DirectorySource::open(tmp.path(), true),
            Err(SourceError::Permanent(_))
        ));
        assert!(matches!(
            DirectorySource::open(&tmp.path().join("missing"), true),
            Err(SourceError::Permanent(_))
        ));
    }

    #[test]
    fn snapshot_url_carries_quality() {
        let source = HttpSnapshotSource::new("http://camera.local:8080/frame", 70, 5).unwrap();
        assert_eq!(source.url(), "http://camera.local:8080/frame?quality=70");

        let source = HttpSnapshotSource::new("http://camera.local/frame?cam=1", 80, 5).unwrap();
        assert_eq!(source.url(), "http://camera.local/frame?cam=1&quality=80");
    }

    #[tokio::test]
    async fn unreachable_camera_turns_permanent() {
        // Nothing listens on a port we just released.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut source = HttpSnapshotSource::new(&format!("http://{addr}/frame"), 80, 3).unwrap();
        assert!(matches!(source.capture_frame().await, Err(SourceError::Transient(_))));
        assert!(matches!(source.capture_frame().await, Err(SourceError::Transient(_))));
        assert!(matches!(source.capture_frame().await, Err(SourceError::Permanent(_))));
    }

    #[test]
    fn default_grab_targets_the_configured_device() {
        let source = DeviceSource::new("/dev/video2", 5);
        assert_eq!(source.device(), "/dev/video2");
        assert_eq!(source.program, "ffmpeg");
        let input = source.args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(source.args[input + 1], "/dev/video2");
        assert_eq!(source.args.last().map(String::as_str), Some("pipe:1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn device_grab_stdout_becomes_the_frame() {
        let mut source =
            DeviceSource::with_command("/dev/video0", "printf", vec!["jpeg-bytes".into()], 3);
        let first = source.capture_frame().await.unwrap();
        assert_eq!(&first.data[..], b"jpeg-bytes");
        assert_eq!(first.seq, 0);
        assert_eq!(source.capture_frame().await.unwrap().seq, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_device_grab_turns_permanent() {
        let mut source = DeviceSource::with_command("/dev/video0", "false", Vec::new(), 2);
        assert!(matches!(source.capture_frame().await, Err(SourceError::Transient(_))));
        assert!(matches!(source.capture_frame().await, Err(SourceError::Permanent(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_device_grab_is_transient() {
        let mut source = DeviceSource::with_command("/dev/video0", "true", Vec::new(), 5);
        assert!(matches!(source.capture_frame().await, Err(SourceError::Transient(_))));
    }

    #[tokio::test]
    async fn missing_grab_program_is_permanent() {
        let mut source = DeviceSource::with_command(
            "/dev/video0",
            "score-stream-no-such-grabber",
            Vec::new(),
            5,
        );
        assert!(matches!(source.capture_frame().await, Err(SourceError::Permanent(_))));
    }
}
