use score_stream_client::{
    CaptureSession, DeviceSource, DirectorySource, FrameSource, HttpSnapshotSource, SessionConfig,
};
use score_stream_common::config::Config;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        addr = config.server.address,
        mode = config.capture.mode,
        rate_hz = config.capture.rate_hz,
        "starting score-stream client"
    );

    let source = match build_source(&config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open frame source");
            std::process::exit(1);
        }
    };

    let mut session = CaptureSession::new();
    if let Err(e) = session.start(SessionConfig::from_config(&config), source).await {
        error!(error = %e, "failed to start capture session");
        std::process::exit(1);
    }

    let run_for = config.capture.duration();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, stopping capture"),
        _ = session.stopped() => warn!("capture worker exited on its own"),
        _ = async {
            match run_for {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        } => info!("capture duration elapsed"),
    }

    let summary = session.stop().await;
    if let Some(e) = &summary.error {
        error!(error = %e, "capture session ended with an error");
    }
    match serde_json::to_string(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "failed to serialize summary"),
    }
    if summary.error.is_some() {
        std::process::exit(2);
    }
}

fn build_source(config: &Config) -> Result<Box<dyn FrameSource>, score_stream_client::SourceError> {
    let capture = &config.capture;
    match capture.mode.as_str() {
        "directory" => {
            let dir = capture.directory.clone().unwrap_or_default();
            Ok(Box::new(DirectorySource::open(&dir, capture.loop_frames)?))
        }
        "device" => Ok(Box::new(DeviceSource::new(
            &capture.device,
            capture.max_consecutive_failures,
        ))),
        _ => {
            let url = capture.url.as_deref().unwrap_or_default();
            Ok(Box::new(HttpSnapshotSource::new(
                url,
                capture.quality,
                capture.max_consecutive_failures,
            )?))
        }
    }
}
