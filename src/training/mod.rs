//! 训练任务状态：进程内唯一的一条记录

pub mod orchestrator;

pub use orchestrator::TrainingOrchestrator;

use crate::{DetectError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Idle,
    Initializing,
    LoadingModel,
    Training,
    Completed,
    Error,
}

/// 训练任务的一次性快照
///
/// 多字段更新整体发布，读者永远不会看到写到一半的记录。
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSnapshot {
    pub status: TrainingStatus,
    pub epoch: u32,
    pub total_epochs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_folder: Option<String>,
}

impl TrainingSnapshot {
    fn idle() -> Self {
        Self {
            status: TrainingStatus::Idle,
            epoch: 0,
            total_epochs: 0,
            error: None,
            model_path: None,
            results_folder: None,
        }
    }
}

/// 进程级训练任务记录
///
/// 同一时刻最多一个任务在跑；快照只被该任务的工作线程改写，
/// 被任意数量的轮询者读取。终态（completed/error）保留到下一次
/// 任务开始时被覆盖。
pub struct TrainingJob {
    cell: RwLock<Arc<TrainingSnapshot>>,
}

impl TrainingJob {
    pub fn new() -> Self {
        Self {
            cell: RwLock::new(Arc::new(TrainingSnapshot::idle())),
        }
    }

    pub fn snapshot(&self) -> Arc<TrainingSnapshot> {
        self.cell.read().clone()
    }

    /// 接受一次新的训练请求；进行中则拒绝
    ///
    /// 检查与状态切换在同一把写锁内完成，并发的start只会有一个成功。
    pub fn begin(&self, total_epochs: u32) -> Result<()> {
        let mut cell = self.cell.write();
        if cell.status == TrainingStatus::Training {
            return Err(DetectError::InvalidState(
                "Training already in progress".to_string(),
            ));
        }
        *cell = Arc::new(TrainingSnapshot {
            status: TrainingStatus::Initializing,
            epoch: 0,
            total_epochs,
            error: None,
            model_path: None,
            results_folder: None,
        });
        Ok(())
    }

    fn publish(&self, next: TrainingSnapshot) {
        *self.cell.write() = Arc::new(next);
    }

    pub(crate) fn set_status(&self, status: TrainingStatus) {
        let current = self.snapshot();
        self.publish(TrainingSnapshot {
            status,
            ..(*current).clone()
        });
    }

    /// epoch在任务内单调不减
    pub(crate) fn set_epoch(&self, epoch: u32) {
        let current = self.snapshot();
        self.publish(TrainingSnapshot {
            status: TrainingStatus::Training,
            epoch: current.epoch.max(epoch),
            ..(*current).clone()
        });
    }

    pub(crate) fn fail(&self, message: String) {
        let current = self.snapshot();
        self.publish(TrainingSnapshot {
            status: TrainingStatus::Error,
            error: Some(message),
            ..(*current).clone()
        });
    }

    pub(crate) fn complete(&self, model_path: String, results_folder: String) {
        let current = self.snapshot();
        self.publish(TrainingSnapshot {
            status: TrainingStatus::Completed,
            epoch: current.total_epochs,
            error: None,
            model_path: Some(model_path),
            results_folder: Some(results_folder),
            ..(*current).clone()
        });
    }
}

impl Default for TrainingJob {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_rejects_while_training() {
        let job = TrainingJob::new();
        job.begin(5).unwrap();
        job.set_status(TrainingStatus::Training);
        job.set_epoch(2);

        let err = job.begin(3).unwrap_err();
        assert!(matches!(err, DetectError::InvalidState(_)));

        // 在途任务的状态不受影响
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, TrainingStatus::Training);
        assert_eq!(snapshot.epoch, 2);
        assert_eq!(snapshot.total_epochs, 5);
    }

    #[test]
    fn begin_overwrites_terminal_states() {
        let job = TrainingJob::new();
        job.begin(2).unwrap();
        job.fail("boom".to_string());
        assert_eq!(job.snapshot().status, TrainingStatus::Error);

        job.begin(4).unwrap();
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, TrainingStatus::Initializing);
        assert_eq!(snapshot.total_epochs, 4);
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn epoch_is_monotonic_within_a_job() {
        let job = TrainingJob::new();
        job.begin(10).unwrap();
        job.set_epoch(3);
        job.set_epoch(2);
        assert_eq!(job.snapshot().epoch, 3);
    }

    #[test]
    fn complete_records_artifacts() {
        let job = TrainingJob::new();
        job.begin(3).unwrap();
        job.complete(
            "runs/detect/custom_model/weights/best.onnx".to_string(),
            "runs/detect/custom_model".to_string(),
        );

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, TrainingStatus::Completed);
        assert_eq!(snapshot.epoch, 3);
        assert!(snapshot.model_path.is_some());
        assert!(snapshot.results_folder.is_some());
    }
}
