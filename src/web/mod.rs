pub mod handlers;

use crate::backend::DetectorBackend;
use crate::camera::{CameraBackend, WebcamManager};
use crate::inference::Annotator;
use crate::models::ModelRegistry;
use crate::training::{TrainingJob, TrainingOrchestrator};
use crate::video::{ProgressCell, VideoIo};
use crate::{Config, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

/// 各处理器共享的服务状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ModelRegistry>,
    pub orchestrator: Arc<TrainingOrchestrator>,
    pub webcam: Arc<WebcamManager>,
    pub video_io: Option<Arc<dyn VideoIo>>,
    pub annotator: Arc<Annotator>,
    pub video_progress: Arc<ProgressCell>,
}

impl AppState {
    pub fn new(
        config: Config,
        detector: Option<Arc<dyn DetectorBackend>>,
        camera: Option<Arc<dyn CameraBackend>>,
        video_io: Option<Arc<dyn VideoIo>>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ModelRegistry::new(detector, config.runs_dir.clone()));
        let job = Arc::new(TrainingJob::new());
        let orchestrator = Arc::new(TrainingOrchestrator::new(
            Arc::clone(&registry),
            job,
            Arc::clone(&config),
        ));
        let annotator = Arc::new(Annotator::new(config.font_path.as_deref()));

        Self {
            config,
            registry,
            orchestrator,
            webcam: Arc::new(WebcamManager::new(camera)),
            video_io,
            annotator,
            video_progress: Arc::new(ProgressCell::new()),
        }
    }
}

pub async fn serve(state: AppState) -> Result<()> {
    // 启动时加载初始模型：优先最近训练产物
    state.registry.bootstrap(&state.config.default_weights_path());

    let addr: SocketAddr = state.config.bind_addr.parse().map_err(|e| {
        crate::DetectError::Internal(format!(
            "Invalid bind address {}: {}",
            state.config.bind_addr, e
        ))
    })?;

    let app = create_app(state);

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  POST /detect              - Multipart image detection");
    tracing::info!("  POST /detect-video        - Multipart video annotation");
    tracing::info!("  GET  /detect-webcam-frame - Single webcam frame");
    tracing::info!("  POST /train               - Start background training");
    tracing::info!("  GET  /training-progress   - Poll training state");
    tracing::info!("  GET  /models              - List available weights");
    tracing::info!("  GET  /health              - Health check");

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::DetectError::Internal(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::DetectError::Internal(format!("Server failed: {}", e)))?;

    Ok(())
}

pub fn create_app(state: AppState) -> Router {
    let server = &state.config.server_config;
    let max_request_size = server.max_request_size;
    let request_timeout = server.request_timeout;

    Router::new()
        // 检测与标注
        .route("/detect", post(handlers::detect_handler))
        .route("/detect-video", post(handlers::detect_video_handler))
        .route("/video-progress", get(handlers::video_progress_handler))
        .route("/detect-webcam-frame", get(handlers::webcam_frame_handler))
        .route("/list-cameras", get(handlers::list_cameras_handler))
        .route("/stop-webcam", post(handlers::stop_webcam_handler))
        // 模型管理
        .route("/models", get(handlers::list_models_handler))
        .route("/select-model", post(handlers::select_model_handler))
        .route("/current-model", get(handlers::current_model_handler))
        // 训练
        .route("/train", post(handlers::train_handler))
        .route(
            "/training-progress",
            get(handlers::training_progress_handler),
        )
        // 数据集
        .route(
            "/generate-dataset-yaml",
            post(handlers::generate_dataset_yaml_handler),
        )
        .route("/dataset-stats", get(handlers::dataset_stats_handler))
        // 系统
        .route("/", get(handlers::root_handler))
        .route("/health", get(handlers::health_handler))
        // 中间件分层，避免复杂类型嵌套
        .layer(RequestBodyLimitLayer::new(max_request_size))
        .layer(TimeoutLayer::new(Duration::from_secs(request_timeout)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
