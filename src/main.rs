use anyhow::Result;
use clap::Parser;
use detect_lab::{
    config::Config,
    web::{serve, AppState},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "detect-lab")]
#[command(about = "Object detection service with in-place retraining")]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "0.0.0.0:8001")]
    bind: String,

    /// Pretrained weights directory
    #[arg(long, default_value = "models")]
    models_dir: String,

    /// Dataset directory (images/, labels/, data.yaml)
    #[arg(long, default_value = "dataset")]
    dataset_dir: String,

    /// Training output directory
    #[arg(long, default_value = "runs")]
    runs_dir: String,

    /// Font file for annotation labels
    #[arg(long)]
    font: Option<String>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable development mode
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志系统
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .init();

    tracing::info!("Starting detection service...");
    tracing::info!("Bind address: {}", args.bind);
    tracing::info!("Models directory: {}", args.models_dir);
    tracing::info!("Dataset directory: {}", args.dataset_dir);

    let config = Config::new(
        args.bind,
        args.models_dir,
        args.dataset_dir,
        args.runs_dir,
        args.font,
        args.workers,
        args.dev,
    )?;

    let detector = detector_backend(&config);
    let state = AppState::new(config, detector, camera_backend(), None);
    if !state.registry.has_backend() {
        tracing::warn!("Built without the onnx feature, detection endpoints will answer 503");
    }

    serve(state).await?;

    Ok(())
}

#[cfg(feature = "onnx")]
fn detector_backend(
    config: &Config,
) -> Option<std::sync::Arc<dyn detect_lab::backend::DetectorBackend>> {
    Some(std::sync::Arc::new(
        detect_lab::backend::ort_yolo::OrtYoloBackend::new(
            config.training_config.trainer_cmd.clone(),
        ),
    ))
}

#[cfg(not(feature = "onnx"))]
fn detector_backend(
    _config: &Config,
) -> Option<std::sync::Arc<dyn detect_lab::backend::DetectorBackend>> {
    None
}

#[cfg(feature = "v4l-camera")]
fn camera_backend() -> Option<std::sync::Arc<dyn detect_lab::camera::CameraBackend>> {
    Some(std::sync::Arc::new(detect_lab::camera::v4l::V4lBackend))
}

#[cfg(not(feature = "v4l-camera"))]
fn camera_backend() -> Option<std::sync::Arc<dyn detect_lab::camera::CameraBackend>> {
    None
}
