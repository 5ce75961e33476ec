use anyhow::{Context, Result};
use facetrack_core::{FaceTracker, OnnxAnalyzer};
use facetrack_hw::Camera;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{TrackerService, BUS_NAME, OBJECT_PATH};
use engine::{CameraSource, FrameSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facetrackd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        data_dir = %config.data_dir.display(),
        model_dir = %config.model_dir.display(),
        tolerance = config.tolerance,
        "configuration loaded"
    );

    let mut analyzer = OnnxAnalyzer::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("failed to load face models")?;
    let tracker = FaceTracker::open(&config.data_dir, config.tracker_options(), &mut analyzer)
        .context("failed to open identity store")?;

    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    let warmup_frames = config.warmup_frames;

    let engine = engine::spawn_engine(tracker, Box::new(analyzer), move || {
        let source = CameraSource::start(camera, warmup_frames)?;
        Ok(Box::new(source) as Box<dyn FrameSource>)
    });

    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, TrackerService::new(engine.clone()))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facetrackd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facetrackd shutting down");
    engine.shutdown().await.context("failed to save catalog")?;

    Ok(())
}
