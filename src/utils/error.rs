use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("Cannot open camera {0}")]
    CameraUnavailable(u32),

    #[error("Camera backend unavailable: {0}")]
    CameraBackendUnavailable(String),

    #[error("Camera read failed: {0}")]
    CameraRead(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Dataset validation failed: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl DetectError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DetectError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            DetectError::CameraUnavailable(_) => StatusCode::NOT_FOUND,
            DetectError::DetectorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DetectError::CameraBackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DetectError::InvalidState(_) => StatusCode::BAD_REQUEST,
            DetectError::Validation(_) => StatusCode::BAD_REQUEST,
            DetectError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DetectError::ImageDecode(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            DetectError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            DetectError::ModelLoad(_) => "MODEL_LOAD_ERROR",
            DetectError::DetectorUnavailable(_) => "DETECTOR_UNAVAILABLE",
            DetectError::CameraUnavailable(_) => "CAMERA_UNAVAILABLE",
            DetectError::CameraBackendUnavailable(_) => "CAMERA_BACKEND_UNAVAILABLE",
            DetectError::CameraRead(_) => "CAMERA_READ_ERROR",
            DetectError::InvalidState(_) => "INVALID_STATE",
            DetectError::Validation(_) => "VALIDATION_FAILURE",
            DetectError::InvalidInput(_) => "INVALID_INPUT",
            DetectError::Processing(_) => "PROCESSING_ERROR",
            DetectError::Io(_) => "IO_ERROR",
            DetectError::ImageDecode(_) => "IMAGE_DECODE_ERROR",
            DetectError::Yaml(_) => "YAML_ERROR",
            DetectError::Json(_) => "JSON_ERROR",
            DetectError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        });

        tracing::error!("Request failed: {} ({})", self, status);

        (status, axum::Json(error_response)).into_response()
    }
}
