//! 视频批处理
//!
//! 编解码同样是外部能力，这里只定义帧级读写trait；流水线逐帧
//! 推理、叠加标注并写出，进度通过进程内的共享计数单元对外可见。

use crate::dataset::ClassOracle;
use crate::inference::{Annotator, InferenceGateway};
use crate::models::ActiveModel;
use crate::Result;
use image::{DynamicImage, RgbImage};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// 帧序列读取端
pub trait VideoSource: Send {
    fn frame_count(&self) -> u64;
    fn fps(&self) -> f64;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// 读下一帧；流结束返回 `Ok(None)`
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// 帧序列写出端
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// 视频IO工厂
pub trait VideoIo: Send + Sync {
    fn open_source(&self, path: &Path) -> Result<Box<dyn VideoSource>>;
    fn create_sink(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>>;
}

/// 可轮询的整数进度单元，0..=100
///
/// 写端是批处理流水线，读端是进度查询接口；取值只增不减直到
/// 下一次任务重置为0。
#[derive(Debug, Default)]
pub struct ProgressCell(AtomicU32);

impl ProgressCell {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: u32) {
        self.0.store(value.min(100), Ordering::SeqCst);
    }
}

/// 视频批处理流水线
///
/// 进度在开始时归零、按已处理帧数更新、任何退出路径上强制拉满
/// 到100，轮询方不会停在中间值。失败时先删除写了一半的输出文件
/// 再上抛错误。
pub struct VideoBatchPipeline;

impl VideoBatchPipeline {
    /// 处理整个视频，返回处理的帧数
    pub fn process(
        io: &dyn VideoIo,
        input: &Path,
        output: &Path,
        active: &ActiveModel,
        oracle: &ClassOracle,
        annotator: &Annotator,
        progress: &ProgressCell,
    ) -> Result<u64> {
        progress.set(0);
        let result = Self::run(io, input, output, active, oracle, annotator, progress);
        progress.set(100);
        if result.is_err() && output.exists() {
            if let Err(e) = fs::remove_file(output) {
                tracing::warn!("Cannot remove partial output {}: {}", output.display(), e);
            }
        }
        result
    }

    fn run(
        io: &dyn VideoIo,
        input: &Path,
        output: &Path,
        active: &ActiveModel,
        oracle: &ClassOracle,
        annotator: &Annotator,
        progress: &ProgressCell,
    ) -> Result<u64> {
        let mut source = io.open_source(input)?;
        let total = source.frame_count().max(1);
        let mut sink = io.create_sink(output, source.fps(), source.width(), source.height())?;

        tracing::info!(
            "Video processing started: {} frames, {}x{} @ {:.1} fps",
            source.frame_count(),
            source.width(),
            source.height(),
            source.fps()
        );

        let mut done: u64 = 0;
        while let Some(frame) = source.next_frame()? {
            let dynamic = DynamicImage::ImageRgb8(frame);
            let detections = InferenceGateway::run(&dynamic, active, oracle)?;
            let mut frame = dynamic.into_rgb8();
            annotator.draw(&mut frame, &detections);
            sink.write_frame(&frame)?;

            done += 1;
            progress.set((done * 100 / total) as u32);
        }
        sink.finish()?;

        tracing::info!("Video processing finished: {} frames", done);
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{raw_detection, FakeModel, FakeVideoIo};
    use crate::models::ModelHandle;
    use std::sync::Arc;

    fn active_model() -> ActiveModel {
        ActiveModel {
            handle: ModelHandle::classify(
                Path::new("models/yolov8s.onnx"),
                Path::new("runs"),
            ),
            model: Box::new(FakeModel {
                detections: vec![raw_detection(0, 0.9)],
                names: vec!["dog".to_string()],
            }),
        }
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_100() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let cell = Arc::new(ProgressCell::new());
        let io = FakeVideoIo::new(10, Arc::clone(&cell));

        let processed = VideoBatchPipeline::process(
            &io,
            Path::new("in.mp4"),
            &output,
            &active_model(),
            &ClassOracle::Unrestricted,
            &Annotator::new(None),
            &cell,
        )
        .unwrap();

        assert_eq!(processed, 10);
        assert_eq!(cell.get(), 100);
        assert!(output.exists());

        // 各帧写出时观测到的进度不回退，且从0起步
        let seen = io.progress_seen.lock().clone();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], 0);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn decode_failure_removes_partial_output_and_forces_100() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let cell = Arc::new(ProgressCell::new());
        let mut io = FakeVideoIo::new(10, Arc::clone(&cell));
        io.fail_at = Some(3);

        let err = VideoBatchPipeline::process(
            &io,
            Path::new("in.mp4"),
            &output,
            &active_model(),
            &ClassOracle::Unrestricted,
            &Annotator::new(None),
            &cell,
        )
        .unwrap_err();

        assert!(err.to_string().contains("frame decode failed"));
        assert!(!output.exists());
        assert_eq!(cell.get(), 100);
    }

    #[test]
    fn empty_video_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let cell = Arc::new(ProgressCell::new());
        let io = FakeVideoIo::new(0, Arc::clone(&cell));

        let processed = VideoBatchPipeline::process(
            &io,
            Path::new("in.mp4"),
            &output,
            &active_model(),
            &ClassOracle::Unrestricted,
            &Annotator::new(None),
            &cell,
        )
        .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(cell.get(), 100);
    }

    #[test]
    fn progress_cell_clamps_to_100() {
        let cell = ProgressCell::new();
        cell.set(250);
        assert_eq!(cell.get(), 100);
    }
}
