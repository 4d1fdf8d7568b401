//! ort检测后端：YOLOv8 ONNX推理 + 外部训练器进程
//!
//! 训练本身委托给外部的 `yolo` 命令行工具；本模块只负责起进程、
//! 从输出里解析epoch进度、以及加载训练产物做推理。

use crate::backend::{
    DetectorBackend, LoadedModel, RawDetection, TrainEvent, TrainOutcome, TrainSpec,
};
use crate::{DetectError, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array4, Axis};
use ort::{
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};

const INPUT_SIZE: u32 = 640;
const CONF_THRESHOLD: f32 = 0.25;
const IOU_THRESHOLD: f32 = 0.45;

pub struct OrtYoloBackend {
    trainer_cmd: String,
}

impl OrtYoloBackend {
    pub fn new(trainer_cmd: String) -> Self {
        Self { trainer_cmd }
    }
}

impl DetectorBackend for OrtYoloBackend {
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>> {
        Ok(Box::new(OrtYoloModel::new(path)?))
    }

    fn train(
        &self,
        spec: &TrainSpec,
        progress: &(dyn Fn(TrainEvent) + Send + Sync),
    ) -> Result<TrainOutcome> {
        let detect_dir = spec.runs_dir.join("detect");
        std::fs::create_dir_all(&detect_dir)?;

        let mut child = Command::new(&self.trainer_cmd)
            .arg("detect")
            .arg("train")
            .arg(format!("data={}", spec.data_yaml.display()))
            .arg(format!("epochs={}", spec.epochs))
            .arg(format!("imgsz={}", spec.image_size))
            .arg(format!("batch={}", spec.batch))
            .arg(format!("project={}", detect_dir.display()))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                DetectError::Processing(format!("cannot start trainer {}: {}", self.trainer_cmd, e))
            })?;

        progress(TrainEvent::Started);

        // 训练器按epoch打印 "<n>/<total>"，据此上报进度
        if let Some(stdout) = child.stdout.take() {
            let epoch_tag = format!("/{}", spec.epochs);
            let mut last_epoch = 0;
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                for token in line.split_whitespace() {
                    if let Some(prefix) = token.strip_suffix(&epoch_tag) {
                        if let Ok(epoch) = prefix.parse::<u32>() {
                            if epoch > last_epoch && epoch <= spec.epochs {
                                last_epoch = epoch;
                                progress(TrainEvent::EpochEnd(epoch));
                            }
                        }
                    }
                }
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(DetectError::Processing(format!(
                "trainer exited with {}",
                status
            )));
        }

        let best_weights = crate::models::latest_custom_weights(&detect_dir).ok_or_else(|| {
            DetectError::Processing("trainer produced no weights file".to_string())
        })?;
        let results_dir = best_weights
            .parent()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| detect_dir.clone());

        Ok(TrainOutcome {
            best_weights,
            results_dir,
        })
    }
}

pub struct OrtYoloModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    names: HashMap<usize, String>,
}

impl OrtYoloModel {
    pub fn new(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DetectError::ModelLoad(format!(
                "weights not found: {}",
                path.display()
            )));
        }

        tracing::info!("Loading detection model from: {}", path.display());
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(num_cpus::get().min(4)))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| DetectError::ModelLoad(e.to_string()))?;

        // 动态发现输入输出名称
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| DetectError::ModelLoad("model has no inputs".to_string()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| DetectError::ModelLoad("model has no outputs".to_string()))?;
        tracing::info!("Detection model output: '{}'", output_name);

        let names = read_class_names(&session);
        if names.is_empty() {
            tracing::warn!("Model metadata carries no class names");
        }

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            names,
        })
    }
}

impl LoadedModel for OrtYoloModel {
    fn infer(&self, frame: &DynamicImage) -> Result<Vec<RawDetection>> {
        let (orig_w, orig_h) = frame.dimensions();

        // letterbox到方形输入，记录比例以便映射回原图
        let scale = (INPUT_SIZE as f32 / orig_w as f32).min(INPUT_SIZE as f32 / orig_h as f32);
        let new_w = ((orig_w as f32 * scale) as u32).max(1);
        let new_h = ((orig_h as f32 * scale) as u32).max(1);
        let resized = frame
            .resize_exact(new_w, new_h, FilterType::Triangle)
            .to_rgb8();

        let mut input =
            Array4::<f32>::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel.0[0] as f32 / 255.0;
            input[[0, 1, y as usize, x as usize]] = pixel.0[1] as f32 / 255.0;
            input[[0, 2, y as usize, x as usize]] = pixel.0[2] as f32 / 255.0;
        }

        let input_tensor =
            Tensor::from_array(input).map_err(|e| DetectError::Processing(e.to_string()))?;
        let prediction = {
            let mut session = self.session.lock();
            let outputs = session
                .run(inputs![self.input_name.as_str() => input_tensor])
                .map_err(|e| DetectError::Processing(e.to_string()))?;
            match outputs.get(&self.output_name) {
                Some(output) => output
                    .try_extract_array::<f32>()
                    .map_err(|e| DetectError::Processing(e.to_string()))?
                    .into_owned(),
                None => {
                    let available: Vec<String> =
                        outputs.keys().map(|s| s.to_string()).collect();
                    return Err(DetectError::Processing(format!(
                        "output '{}' not found, available: {:?}",
                        self.output_name, available
                    )));
                }
            }
        };

        // YOLOv8输出: (1, 4+nc, N)，每列 cx cy w h + 类别分数
        let shape = prediction.shape().to_vec();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectError::Processing(format!(
                "unsupported output shape: {:?}",
                shape
            )));
        }
        let view = prediction.index_axis(Axis(0), 0);
        let num_classes = shape[1] - 4;
        let candidates = shape[2];

        let mut detections = Vec::new();
        for i in 0..candidates {
            let mut best_class = 0;
            let mut best_score = 0.0f32;
            for c in 0..num_classes {
                let score = view[[4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if best_score < CONF_THRESHOLD {
                continue;
            }

            let cx = view[[0, i]];
            let cy = view[[1, i]];
            let w = view[[2, i]];
            let h = view[[3, i]];
            detections.push(RawDetection {
                class_id: best_class,
                confidence: best_score,
                x1: (cx - w / 2.0) / scale,
                y1: (cy - h / 2.0) / scale,
                x2: (cx + w / 2.0) / scale,
                y2: (cy + h / 2.0) / scale,
            });
        }

        Ok(non_max_suppression(detections, IOU_THRESHOLD))
    }

    fn class_name(&self, class_id: usize) -> Option<String> {
        self.names.get(&class_id).cloned()
    }
}

/// 从模型元数据解析类别表
///
/// ultralytics导出的权重在custom metadata里带一个
/// `names: {0: 'person', 1: 'bicycle', ...}` 的字典字符串。
fn read_class_names(session: &Session) -> HashMap<usize, String> {
    let Ok(metadata) = session.metadata() else {
        return HashMap::new();
    };
    let Ok(Some(raw)) = metadata.custom("names") else {
        return HashMap::new();
    };

    let mut names = HashMap::new();
    for entry in raw.trim_matches(|c| c == '{' || c == '}').split(',') {
        let Some((id, name)) = entry.split_once(':') else {
            continue;
        };
        let Ok(id) = id.trim().parse::<usize>() else {
            continue;
        };
        let name = name.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
        if !name.is_empty() {
            names.insert(id, name);
        }
    }
    names
}

/// 贪心NMS，按置信度从高到低保留
fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in detections {
        let overlaps = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && iou(existing, &candidate) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = ix * iy;
    let area_a = (a.x2 - a.x1).max(0.0) * (a.y2 - a.y1).max(0.0);
    let area_b = (b.x2 - b.x1).max(0.0) * (b.y2 - b.y1).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}
