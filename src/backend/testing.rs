//! 测试替身：脚本化的检测后端、摄像头与视频IO

use super::{DetectorBackend, LoadedModel, RawDetection, TrainEvent, TrainOutcome, TrainSpec};
use crate::camera::{CameraBackend, CameraDevice};
use crate::video::{ProgressCell, VideoIo, VideoSink, VideoSource};
use crate::{DetectError, Result};
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct FakeModel {
    pub detections: Vec<RawDetection>,
    pub names: Vec<String>,
}

impl LoadedModel for FakeModel {
    fn infer(&self, _frame: &DynamicImage) -> Result<Vec<RawDetection>> {
        Ok(self.detections.clone())
    }

    fn class_name(&self, class_id: usize) -> Option<String> {
        self.names.get(class_id).cloned()
    }
}

#[derive(Clone)]
pub enum FakeTraining {
    /// 按epoch回调后在 runs/detect/<run>/weights/ 下生成权重文件
    Succeed { run_name: String },
    Fail(String),
}

pub struct FakeBackend {
    pub detections: Vec<RawDetection>,
    pub names: Vec<String>,
    pub training: FakeTraining,
    pub fail_load: bool,
    pub load_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(detections: Vec<RawDetection>, names: Vec<String>) -> Self {
        Self {
            detections,
            names,
            training: FakeTraining::Succeed {
                run_name: "custom_model".to_string(),
            },
            fail_load: false,
            load_calls: AtomicUsize::new(0),
        }
    }
}

impl DetectorBackend for FakeBackend {
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(DetectError::ModelLoad(format!(
                "cannot load {}",
                path.display()
            )));
        }
        Ok(Box::new(FakeModel {
            detections: self.detections.clone(),
            names: self.names.clone(),
        }))
    }

    fn train(
        &self,
        spec: &TrainSpec,
        progress: &(dyn Fn(TrainEvent) + Send + Sync),
    ) -> Result<TrainOutcome> {
        match &self.training {
            FakeTraining::Fail(msg) => Err(DetectError::Processing(msg.clone())),
            FakeTraining::Succeed { run_name } => {
                progress(TrainEvent::Started);
                for epoch in 1..=spec.epochs {
                    progress(TrainEvent::EpochEnd(epoch));
                }
                let results_dir = spec.runs_dir.join("detect").join(run_name);
                let weights_dir = results_dir.join("weights");
                fs::create_dir_all(&weights_dir)?;
                let best_weights = weights_dir.join("best.onnx");
                fs::write(&best_weights, b"fake weights")?;
                Ok(TrainOutcome {
                    best_weights,
                    results_dir,
                })
            }
        }
    }
}

pub struct FakeCameraDevice {
    read_failures: Arc<AtomicU32>,
}

impl CameraDevice for FakeCameraDevice {
    fn read_frame(&mut self) -> Result<RgbImage> {
        let remaining = self.read_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.read_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(DetectError::CameraRead("frame grab failed".to_string()));
        }
        Ok(RgbImage::from_pixel(64, 48, Rgb([10, 20, 30])))
    }
}

pub struct FakeCameraBackend {
    /// 打不开的设备索引
    pub fail_open: HashSet<u32>,
    /// 接下来会失败的读取次数（所有设备共享）
    pub read_failures: Arc<AtomicU32>,
    pub open_count: AtomicUsize,
}

impl FakeCameraBackend {
    pub fn new() -> Self {
        Self {
            fail_open: HashSet::new(),
            read_failures: Arc::new(AtomicU32::new(0)),
            open_count: AtomicUsize::new(0),
        }
    }
}

impl CameraBackend for FakeCameraBackend {
    fn open(&self, index: u32) -> Result<Box<dyn CameraDevice>> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.contains(&index) {
            return Err(DetectError::CameraUnavailable(index));
        }
        Ok(Box::new(FakeCameraDevice {
            read_failures: Arc::clone(&self.read_failures),
        }))
    }
}

pub struct FakeVideoSource {
    frames: u64,
    emitted: u64,
    fail_at: Option<u64>,
}

impl VideoSource for FakeVideoSource {
    fn frame_count(&self) -> u64 {
        self.frames
    }

    fn fps(&self) -> f64 {
        30.0
    }

    fn width(&self) -> u32 {
        64
    }

    fn height(&self) -> u32 {
        48
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if let Some(fail_at) = self.fail_at {
            if self.emitted == fail_at {
                return Err(DetectError::Processing("frame decode failed".to_string()));
            }
        }
        if self.emitted >= self.frames {
            return Ok(None);
        }
        self.emitted += 1;
        Ok(Some(RgbImage::from_pixel(64, 48, Rgb([0, 0, 0]))))
    }
}

pub struct FakeVideoSink {
    path: PathBuf,
    cell: Arc<ProgressCell>,
    progress_seen: Arc<Mutex<Vec<u32>>>,
}

impl VideoSink for FakeVideoSink {
    fn write_frame(&mut self, _frame: &RgbImage) -> Result<()> {
        self.progress_seen.lock().push(self.cell.get());
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .sync_all()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 记录进度观测值的视频IO替身
pub struct FakeVideoIo {
    pub frames: u64,
    pub fail_at: Option<u64>,
    pub cell: Arc<ProgressCell>,
    pub progress_seen: Arc<Mutex<Vec<u32>>>,
}

impl FakeVideoIo {
    pub fn new(frames: u64, cell: Arc<ProgressCell>) -> Self {
        Self {
            frames,
            fail_at: None,
            cell,
            progress_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl VideoIo for FakeVideoIo {
    fn open_source(&self, _path: &Path) -> Result<Box<dyn VideoSource>> {
        Ok(Box::new(FakeVideoSource {
            frames: self.frames,
            emitted: 0,
            fail_at: self.fail_at,
        }))
    }

    fn create_sink(
        &self,
        path: &Path,
        _fps: f64,
        _width: u32,
        _height: u32,
    ) -> Result<Box<dyn VideoSink>> {
        fs::write(path, b"")?;
        Ok(Box::new(FakeVideoSink {
            path: path.to_path_buf(),
            cell: Arc::clone(&self.cell),
            progress_seen: Arc::clone(&self.progress_seen),
        }))
    }
}

/// 构造一条位于图像内部的原始检测
pub fn raw_detection(class_id: usize, confidence: f32) -> RawDetection {
    RawDetection {
        class_id,
        confidence,
        x1: 8.0,
        y1: 6.0,
        x2: 32.0,
        y2: 24.0,
    }
}
