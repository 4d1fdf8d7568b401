use crate::backend::{DetectorBackend, TrainEvent, TrainSpec};
use crate::dataset::{self, DatasetDescriptor};
use crate::models::{ModelHandle, ModelRegistry};
use crate::training::{TrainingJob, TrainingStatus};
use crate::{Config, DetectError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 训练编排器
///
/// 接受启动请求、做同步校验、把阻塞的训练过程放到专用工作线程，
/// 并在成功时用新模型原子替换注册表。训练一旦开始不可取消；
/// 调用方只能轮询到最终的 completed / error。
pub struct TrainingOrchestrator {
    registry: Arc<ModelRegistry>,
    job: Arc<TrainingJob>,
    config: Arc<Config>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TrainingOrchestrator {
    pub fn new(registry: Arc<ModelRegistry>, job: Arc<TrainingJob>, config: Arc<Config>) -> Self {
        Self {
            registry,
            job,
            config,
            worker: Mutex::new(None),
        }
    }

    pub fn job(&self) -> &Arc<TrainingJob> {
        &self.job
    }

    /// 最近一次启动的工作线程句柄（join钩子，当前仅测试使用）
    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().take()
    }

    /// 启动一次后台训练；立即返回确认，不等待训练结束
    ///
    /// 状态校验与数据集存在性在任何后台工作开始前同步完成。
    pub fn start(&self, epochs: u32) -> Result<()> {
        let backend = self.registry.backend()?;

        let data_yaml = self.config.data_yaml_path();
        if !data_yaml.exists() {
            return Err(DetectError::InvalidState(format!(
                "Dataset not found at {}. Create data.yaml and add training images and labels",
                data_yaml.display()
            )));
        }

        // 进行中则拒绝；检查与状态切换是原子的
        self.job.begin(epochs)?;

        let spec = match self.prepare_spec(epochs, &data_yaml) {
            Ok(spec) => spec,
            Err(e) => {
                self.job.fail(e.to_string());
                return Err(e);
            }
        };

        tracing::info!(
            "Training started: epochs={}, data={}",
            epochs,
            spec.data_yaml.display()
        );

        let registry = Arc::clone(&self.registry);
        let job = Arc::clone(&self.job);
        let config = Arc::clone(&self.config);
        let handle = tokio::task::spawn_blocking(move || {
            run_worker(registry, job, backend, config, spec);
        });
        *self.worker.lock() = Some(handle);

        Ok(())
    }

    /// 归一化数据集描述并写出训练配置
    fn prepare_spec(&self, epochs: u32, data_yaml: &std::path::Path) -> Result<TrainSpec> {
        let mut descriptor = DatasetDescriptor::load(data_yaml)?;
        if descriptor.names.is_empty() {
            // 没有类别表时退回缺省的双类别数据集
            descriptor.names = vec!["dog".to_string(), "cat".to_string()];
            descriptor.nc = 2;
        }

        let training_yaml = self.config.training_yaml_path();
        descriptor.write_training_yaml(&self.config.dataset_dir, &training_yaml)?;
        tracing::info!(
            "Training config: nc={}, names={:?}",
            descriptor.nc,
            descriptor.names
        );

        Ok(TrainSpec {
            data_yaml: training_yaml,
            epochs,
            image_size: self.config.training_config.image_size,
            batch: self.config.training_config.batch,
            runs_dir: self.config.runs_dir.clone(),
        })
    }
}

/// 后台工作线程：校验 -> 训练 -> 发布新模型
///
/// 任何失败只写入任务记录，注册表保持原样继续服务旧模型。
fn run_worker(
    registry: Arc<ModelRegistry>,
    job: Arc<TrainingJob>,
    backend: Arc<dyn DetectorBackend>,
    config: Arc<Config>,
    spec: TrainSpec,
) {
    let descriptor = match DatasetDescriptor::load(&spec.data_yaml) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            tracing::error!("Training aborted, bad dataset descriptor: {}", e);
            job.fail(e.to_string());
            return;
        }
    };

    if let Err(e) = dataset::validate_labels(
        &config.labels_dir(),
        descriptor.nc,
        config.training_config.label_sample,
    ) {
        tracing::error!("Training aborted: {}", e);
        job.fail(e.to_string());
        return;
    }

    job.set_status(TrainingStatus::LoadingModel);

    let progress_job = Arc::clone(&job);
    let total_epochs = spec.epochs;
    let progress = move |event: TrainEvent| match event {
        TrainEvent::Started => progress_job.set_status(TrainingStatus::Training),
        TrainEvent::EpochEnd(epoch) => {
            tracing::info!("Progress update: epoch {}/{}", epoch, total_epochs);
            progress_job.set_epoch(epoch);
        }
    };

    match backend.train(&spec, &progress) {
        Ok(outcome) => {
            let handle = ModelHandle::classify(&outcome.best_weights, &config.runs_dir);
            match backend.load(&outcome.best_weights) {
                Ok(model) => {
                    tracing::info!(
                        "Training completed, switching to {}",
                        outcome.best_weights.display()
                    );
                    registry.replace(handle, model);
                    job.complete(
                        outcome.best_weights.to_string_lossy().into_owned(),
                        outcome.results_dir.to_string_lossy().into_owned(),
                    );
                }
                Err(e) => {
                    tracing::error!("Trained model load failed: {}", e);
                    job.fail(format!("trained model load failed: {}", e));
                }
            }
        }
        Err(e) => {
            tracing::error!("Training failed: {}", e);
            job.fail(e.to_string());
        }
    }
}
