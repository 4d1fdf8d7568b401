use crate::backend::{DetectorBackend, LoadedModel};
use crate::models::ModelHandle;
use crate::{DetectError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// 当前生效的模型：句柄元数据 + 已加载的推理实例
pub struct ActiveModel {
    pub handle: ModelHandle,
    pub model: Box<dyn LoadedModel>,
}

/// 可用权重清单条目
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// 模型注册表
///
/// 进程内唯一的活动模型持有者。读者通过 `current()` 拿到一个
/// 不可变快照（`Arc`），写者用整体替换发布新模型，任何在途的
/// 推理要么看到旧模型要么看到新模型，不会看到中间状态。
/// 启动之后只有训练编排器和 `select` 会调用替换。
pub struct ModelRegistry {
    backend: Option<Arc<dyn DetectorBackend>>,
    runs_dir: PathBuf,
    active: RwLock<Option<Arc<ActiveModel>>>,
}

impl ModelRegistry {
    pub fn new(backend: Option<Arc<dyn DetectorBackend>>, runs_dir: PathBuf) -> Self {
        Self {
            backend,
            runs_dir,
            active: RwLock::new(None),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// 检测库接缝；未编译/未安装时返回503语义的错误
    pub fn backend(&self) -> Result<Arc<dyn DetectorBackend>> {
        self.backend.clone().ok_or_else(|| {
            DetectError::DetectorUnavailable("detector library not installed".to_string())
        })
    }

    /// 当前模型快照，从不阻塞写者之外的任何人
    pub fn current(&self) -> Result<Arc<ActiveModel>> {
        self.active.read().clone().ok_or_else(|| {
            DetectError::DetectorUnavailable("no model loaded".to_string())
        })
    }

    pub fn current_handle(&self) -> Option<ModelHandle> {
        self.active.read().as_ref().map(|a| a.handle.clone())
    }

    /// 原子替换活动模型
    pub fn replace(&self, handle: ModelHandle, model: Box<dyn LoadedModel>) {
        let next = Arc::new(ActiveModel { handle, model });
        *self.active.write() = Some(next);
    }

    /// 从路径加载并切换模型
    pub fn select(&self, path: &Path) -> Result<ModelHandle> {
        if !path.exists() {
            return Err(DetectError::ModelNotFound(path.display().to_string()));
        }

        let backend = self.backend()?;
        let model = backend
            .load(path)
            .map_err(|e| DetectError::ModelLoad(e.to_string()))?;
        let handle = ModelHandle::classify(path, &self.runs_dir);

        tracing::info!(
            "Switched to model: {} ({})",
            handle.display_name,
            handle.source_path
        );
        self.replace(handle.clone(), model);
        Ok(handle)
    }

    /// 启动时加载初始模型：优先最近一次训练产物，否则预训练权重
    pub fn bootstrap(&self, default_weights: &Path) {
        if self.backend.is_none() {
            tracing::warn!("Detector library not available, serving without a model");
            return;
        }

        let candidate = latest_custom_weights(&self.runs_dir.join("detect"))
            .or_else(|| default_weights.exists().then(|| default_weights.to_path_buf()));

        match candidate {
            Some(path) => match self.select(&path) {
                Ok(handle) => tracing::info!("Loaded initial model: {}", handle.display_name),
                Err(e) => tracing::warn!("Failed to load initial model {}: {}", path.display(), e),
            },
            None => tracing::warn!("No model weights found, serving without a model"),
        }
    }

    /// 扫描已知位置，列出可选权重及当前项
    pub fn list_models(&self, models_dir: &Path) -> (Vec<ModelEntry>, Option<String>) {
        let mut models = Vec::new();

        if let Ok(entries) = std::fs::read_dir(models_dir) {
            let mut pretrained: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| is_weights_file(p))
                .collect();
            pretrained.sort();
            for path in pretrained {
                let handle = ModelHandle::classify(&path, &self.runs_dir);
                models.push(ModelEntry {
                    name: format!("{} (pretrained)", handle.display_name),
                    path: path.to_string_lossy().into_owned(),
                    kind: "pretrained",
                });
            }
        }

        for path in custom_weights_newest_first(&self.runs_dir.join("detect")) {
            let handle = ModelHandle::classify(&path, &self.runs_dir);
            models.push(ModelEntry {
                name: handle.display_name,
                path: path.to_string_lossy().into_owned(),
                kind: "custom",
            });
        }

        let current = self.current_handle().map(|h| h.source_path);
        (models, current)
    }
}

fn is_weights_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("onnx") | Some("pt")
        )
}

/// 训练运行目录下的权重，按修改时间从新到旧
pub fn custom_weights_newest_first(detect_dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();

    let Ok(entries) = std::fs::read_dir(detect_dir) else {
        return Vec::new();
    };

    for entry in entries.flatten() {
        let weights_dir = entry.path().join("weights");
        for name in ["best.onnx", "best.pt"] {
            let weights = weights_dir.join(name);
            if weights.is_file() {
                let mtime = weights
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((mtime, weights));
                break;
            }
        }
    }

    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.into_iter().map(|(_, p)| p).collect()
}

/// 最近一次训练产出的权重
pub fn latest_custom_weights(detect_dir: &Path) -> Option<PathBuf> {
    custom_weights_newest_first(detect_dir).into_iter().next()
}
