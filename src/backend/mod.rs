//! 检测器黑盒接口
//!
//! 推理算法与训练过程由外部机器学习库实现，这里只定义进程内的接缝：
//! `load(path)`、`infer(image)`、`train(config)`。服务的其余部分
//! （注册表、编排器、网关）完全通过这些trait工作。

use crate::Result;
use image::DynamicImage;
use std::path::{Path, PathBuf};

#[cfg(feature = "onnx")]
pub mod ort_yolo;

#[cfg(test)]
pub mod testing;

/// 模型原始输出：绝对像素坐标框 + 类别id + 置信度
#[derive(Debug, Clone, Copy)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// 已加载的检测模型
pub trait LoadedModel: Send + Sync {
    /// 对单帧图像做推理，返回原始检测结果
    fn infer(&self, frame: &DynamicImage) -> Result<Vec<RawDetection>>;

    /// 按模型自带的标签表解析类别id
    fn class_name(&self, class_id: usize) -> Option<String>;
}

/// 训练参数
#[derive(Debug, Clone)]
pub struct TrainSpec {
    /// 归一化后的数据集描述文件
    pub data_yaml: PathBuf,
    pub epochs: u32,
    pub image_size: u32,
    pub batch: u32,
    /// 训练产物根目录（runs/）
    pub runs_dir: PathBuf,
}

/// 训练过程事件，由后端在训练线程内回调
#[derive(Debug, Clone, Copy)]
pub enum TrainEvent {
    /// 权重加载完毕，训练循环开始
    Started,
    /// 一个epoch结束（1-based）
    EpochEnd(u32),
}

/// 成功训练的产物
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// 最优权重文件
    pub best_weights: PathBuf,
    /// 本次训练的结果目录
    pub results_dir: PathBuf,
}

/// 外部检测库的进程内表示
///
/// `train` 是阻塞调用，必须在专用工作线程上执行；实现方通过
/// `progress` 上报epoch边界，不提供取消机制。
pub trait DetectorBackend: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>>;

    fn train(
        &self,
        spec: &TrainSpec,
        progress: &(dyn Fn(TrainEvent) + Send + Sync),
    ) -> Result<TrainOutcome>;
}
