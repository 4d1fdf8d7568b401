use crate::config::CAMERA_PROBE_RANGE;
use crate::dataset::{self, ClassOracle};
use crate::inference::{Detection, InferenceGateway};
use crate::utils::error::DetectError;
use crate::video::VideoBatchPipeline;
use crate::web::AppState;
use crate::Result;
use axum::{
    extract::{Multipart, Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::DynamicImage;
use serde::Deserialize;
use serde_json::json;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// 服务状态概览
pub async fn root_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "detect-lab",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "online",
        "detector_available": state.registry.has_backend(),
        "camera_available": state.webcam.has_backend(),
        "model_loaded": state.registry.current_handle().is_some(),
    }))
}

/// 健康检查端点
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 列出可选权重（预训练 + 训练产物），标出当前项
pub async fn list_models_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (models, current) = state.registry.list_models(&state.config.models_dir);
    Json(json!({ "models": models, "current": current }))
}

#[derive(Debug, Deserialize)]
pub struct SelectModelQuery {
    pub model_path: String,
}

/// 切换当前模型
pub async fn select_model_handler(
    State(state): State<AppState>,
    Query(query): Query<SelectModelQuery>,
) -> Result<Json<serde_json::Value>> {
    tracing::info!("Model switch requested: {}", query.model_path);

    let registry = Arc::clone(&state.registry);
    let path = PathBuf::from(query.model_path);
    let handle = run_blocking(move || registry.select(&path)).await?;

    Ok(Json(json!({ "status": "success", "model": handle })))
}

pub async fn current_model_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "model": state.registry.current_handle(),
        "detector_available": state.registry.has_backend(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TrainQuery {
    pub epochs: Option<u32>,
}

/// 启动后台训练；确认立即返回，进度另行轮询
pub async fn train_handler(
    State(state): State<AppState>,
    Query(query): Query<TrainQuery>,
) -> Result<Json<serde_json::Value>> {
    let epochs = query.epochs.unwrap_or(10);
    if epochs == 0 {
        return Err(DetectError::Validation("epochs must be at least 1".to_string()));
    }

    // 启动前的数据集检查和配置写出是文件IO，不占用异步线程
    let orchestrator = Arc::clone(&state.orchestrator);
    run_blocking(move || orchestrator.start(epochs)).await?;

    Ok(Json(json!({
        "status": "started",
        "epochs": epochs,
        "message": "Training started in background",
    })))
}

pub async fn training_progress_handler(
    State(state): State<AppState>,
) -> Json<crate::training::TrainingSnapshot> {
    Json((*state.orchestrator.job().snapshot()).clone())
}

/// 单图检测；响应体就是检测结果数组本身，没有外层包装
pub async fn detect_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Vec<Detection>>> {
    let start_time = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();

    let upload = read_file_field(multipart, "image/").await?;
    tracing::info!(
        "Processing detection request: request_id={}, {} bytes",
        request_id,
        upload.data.len()
    );

    let registry = Arc::clone(&state.registry);
    let data_yaml = state.config.data_yaml_path();
    let detections = run_blocking(move || {
        let frame = image::load_from_memory(&upload.data)?;
        let active = registry.current()?;
        let oracle = ClassOracle::load_for(&active.handle, &data_yaml);
        InferenceGateway::run(&frame, &active, &oracle)
    })
    .await?;

    tracing::info!(
        "Detection completed: request_id={}, objects={}, time={:.3}s",
        request_id,
        detections.len(),
        start_time.elapsed().as_secs_f32()
    );

    Ok(Json(detections))
}

/// 整段视频检测与标注，返回可下载的结果文件
pub async fn detect_video_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response> {
    let start_time = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();

    let Some(video_io) = state.video_io.clone() else {
        return Err(DetectError::DetectorUnavailable(
            "video codec backend not available".to_string(),
        ));
    };

    let upload = read_file_field(multipart, "video/").await?;
    let source_name = upload.filename.clone().unwrap_or_else(|| "video.mp4".to_string());
    tracing::info!(
        "Processing video request: request_id={}, file={}, {} bytes",
        request_id,
        source_name,
        upload.data.len()
    );

    // 上传内容与输出都落在临时文件里，句柄析构时兜底清理
    let input = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".mp4")
        .tempfile()?
        .into_temp_path();
    tokio::fs::write(&input, &upload.data).await?;
    let output = tempfile::Builder::new()
        .prefix("annotated-")
        .suffix(".mp4")
        .tempfile()?
        .into_temp_path();

    let registry = Arc::clone(&state.registry);
    let annotator = Arc::clone(&state.annotator);
    let progress = Arc::clone(&state.video_progress);
    let data_yaml = state.config.data_yaml_path();
    let input_path = input.to_path_buf();
    let output_path = output.to_path_buf();
    let frames = run_blocking(move || {
        let active = registry.current()?;
        let oracle = ClassOracle::load_for(&active.handle, &data_yaml);
        VideoBatchPipeline::process(
            video_io.as_ref(),
            &input_path,
            &output_path,
            &active,
            &oracle,
            &annotator,
            &progress,
        )
    })
    .await?;

    let body = tokio::fs::read(&output).await?;
    tracing::info!(
        "Video completed: request_id={}, frames={}, {} bytes out, time={:.3}s",
        request_id,
        frames,
        body.len(),
        start_time.elapsed().as_secs_f32()
    );

    let attachment = format!("attachment; filename=\"annotated_{}\"", source_name);
    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_DISPOSITION, attachment),
        ],
        body,
    )
        .into_response())
}

/// 视频处理进度，0..=100
pub async fn video_progress_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "progress": state.video_progress.get() }))
}

#[derive(Debug, Deserialize)]
pub struct WebcamQuery {
    pub camera_index: Option<u32>,
}

/// 抓取一帧摄像头画面并检测，返回标注后的JPEG
pub async fn webcam_frame_handler(
    State(state): State<AppState>,
    Query(query): Query<WebcamQuery>,
) -> Result<Json<serde_json::Value>> {
    let camera_index = query.camera_index.unwrap_or(0);

    let webcam = Arc::clone(&state.webcam);
    let registry = Arc::clone(&state.registry);
    let annotator = Arc::clone(&state.annotator);
    let data_yaml = state.config.data_yaml_path();
    let (detections, jpeg, width, height) = run_blocking(move || {
        let frame = webcam.capture_frame(camera_index)?;
        let (width, height) = (frame.width(), frame.height());

        let active = registry.current()?;
        let oracle = ClassOracle::load_for(&active.handle, &data_yaml);
        let dynamic = DynamicImage::ImageRgb8(frame);
        let detections = InferenceGateway::run(&dynamic, &active, &oracle)?;

        let mut frame = dynamic.into_rgb8();
        annotator.draw(&mut frame, &detections);

        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(frame)
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)?;
        Ok::<_, DetectError>((detections, jpeg, width, height))
    })
    .await?;

    Ok(Json(json!({
        "detections": detections,
        "frame": BASE64.encode(&jpeg),
        "width": width,
        "height": height,
    })))
}

/// 枚举可打开的摄像头
pub async fn list_cameras_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let webcam = Arc::clone(&state.webcam);
    let indices = run_blocking(move || Ok(webcam.probe(0..CAMERA_PROBE_RANGE))).await?;

    let cameras: Vec<serde_json::Value> = indices
        .into_iter()
        .map(|index| json!({ "index": index, "name": format!("Camera {}", index) }))
        .collect();
    Ok(Json(json!({ "cameras": cameras })))
}

/// 释放摄像头；重复调用无害
pub async fn stop_webcam_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.webcam.release();
    Json(json!({ "status": "released" }))
}

/// 根据类别表和已用标注重建 data.yaml
pub async fn generate_dataset_yaml_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let dataset_dir = state.config.dataset_dir.clone();
    let generated = run_blocking(move || dataset::generate_dataset_yaml(&dataset_dir)).await?;

    tracing::info!("Regenerated data.yaml: nc={}", generated.nc);
    Ok(Json(json!({ "status": "success", "dataset": generated })))
}

/// 数据集标注统计
pub async fn dataset_stats_handler(
    State(state): State<AppState>,
) -> Result<Json<dataset::DatasetStats>> {
    let dataset_dir = state.config.dataset_dir.clone();
    let stats = run_blocking(move || dataset::dataset_stats(&dataset_dir)).await?;
    Ok(Json(stats))
}

struct FileUpload {
    data: axum::body::Bytes,
    filename: Option<String>,
}

/// 从multipart取出 `file` 字段，校验内容类型前缀
async fn read_file_field(mut multipart: Multipart, expected_type: &str) -> Result<FileUpload> {
    let mut upload: Option<FileUpload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DetectError::InvalidInput(format!("Failed to read multipart field: {}", e)))?
    {
        let field_name = field.name().unwrap_or("unknown").to_string();
        match field_name.as_str() {
            "file" => {
                if let Some(content_type) = field.content_type() {
                    if !content_type.starts_with(expected_type) {
                        return Err(DetectError::InvalidInput(format!(
                            "Unsupported content type: {}",
                            content_type
                        )));
                    }
                }
                let filename = field.file_name().map(sanitize_filename);
                let data = field.bytes().await.map_err(|e| {
                    DetectError::InvalidInput(format!("Failed to read file data: {}", e))
                })?;
                if data.is_empty() {
                    return Err(DetectError::InvalidInput("Empty file".to_string()));
                }
                upload = Some(FileUpload { data, filename });
            }
            _ => {
                tracing::debug!("Ignoring unknown field: {}", field_name);
            }
        }
    }

    upload.ok_or_else(|| DetectError::InvalidInput("No file provided".to_string()))
}

/// 只保留上传文件名的最后一段，避免路径注入到下载头
fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

/// 把阻塞的推理/IO工作挪到专用线程池
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DetectError::Internal(format!("Worker task failed: {}", e)))?
}
