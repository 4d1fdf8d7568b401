use crate::dataset::ClassOracle;
use crate::models::ActiveModel;
use crate::{DetectError, Result};
use image::{DynamicImage, GenericImageView};
use serde::Serialize;

/// 一条对外输出的检测结果
///
/// `box_2d` 为 [ymin, xmin, ymax, xmax]，按帧尺寸归一化到 [0,1]。
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub box_2d: [f32; 4],
}

/// 推理网关
///
/// 单图、摄像头帧与视频批处理共用的唯一过滤实现：
/// 原始推理 -> 坐标归一化 -> 标签解析 -> 受限模型类别过滤。
/// 绘制标注不在这里做，由调用方在同一份检测列表上叠加。
pub struct InferenceGateway;

impl InferenceGateway {
    pub fn run(
        frame: &DynamicImage,
        active: &ActiveModel,
        oracle: &ClassOracle,
    ) -> Result<Vec<Detection>> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectError::InvalidInput("empty frame".to_string()));
        }
        let (width, height) = (width as f32, height as f32);

        let raw = active.model.infer(frame)?;

        // 受限模型 + 空白名单：回退为放行全部，按当前契约只告警
        let restricted = active.handle.is_restricted;
        if restricted && oracle.is_empty() {
            tracing::warn!(
                "Restricted model {} has no class list, allowing all detections",
                active.handle.display_name
            );
        }

        let mut detections = Vec::with_capacity(raw.len());
        for detection in raw {
            let label = active
                .model
                .class_name(detection.class_id)
                .unwrap_or_else(|| format!("class{}", detection.class_id));

            if restricted && !oracle.is_empty() && !oracle.permits(&label) {
                continue;
            }

            // 归一化并保证 min <= max
            let (x1, x2) = ordered(detection.x1, detection.x2);
            let (y1, y2) = ordered(detection.y1, detection.y2);
            detections.push(Detection {
                label,
                confidence: detection.confidence,
                box_2d: [
                    (y1 / height).clamp(0.0, 1.0),
                    (x1 / width).clamp(0.0, 1.0),
                    (y2 / height).clamp(0.0, 1.0),
                    (x2 / width).clamp(0.0, 1.0),
                ],
            });
        }

        Ok(detections)
    }
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeModel;
    use crate::backend::RawDetection;
    use crate::models::ModelHandle;
    use std::collections::HashSet;
    use std::path::Path;

    fn active(restricted: bool, detections: Vec<RawDetection>, names: Vec<&str>) -> ActiveModel {
        let path = if restricted {
            "runs/detect/custom_model/weights/best.onnx"
        } else {
            "models/yolov8s.onnx"
        };
        ActiveModel {
            handle: ModelHandle::classify(Path::new(path), Path::new("runs")),
            model: Box::new(FakeModel {
                detections,
                names: names.into_iter().map(str::to_string).collect(),
            }),
        }
    }

    fn frame() -> DynamicImage {
        DynamicImage::new_rgb8(100, 50)
    }

    fn raw(class_id: usize, x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
        RawDetection {
            class_id,
            confidence: 0.8,
            x1,
            y1,
            x2,
            y2,
        }
    }

    fn oracle(labels: &[&str]) -> ClassOracle {
        ClassOracle::Restricted(labels.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn unrestricted_model_is_never_filtered() {
        let active = active(
            false,
            vec![raw(0, 0.0, 0.0, 10.0, 10.0), raw(1, 5.0, 5.0, 20.0, 20.0)],
            vec!["dog", "truck"],
        );

        // 即使白名单只有dog，非受限模型也不过滤
        let detections = InferenceGateway::run(&frame(), &active, &oracle(&["dog"])).unwrap();
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn restricted_model_only_reports_permitted_labels() {
        let active = active(
            true,
            vec![raw(0, 0.0, 0.0, 10.0, 10.0), raw(1, 5.0, 5.0, 20.0, 20.0)],
            vec!["dog", "truck"],
        );

        let detections =
            InferenceGateway::run(&frame(), &active, &oracle(&["dog", "cat"])).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "dog");
    }

    #[test]
    fn empty_oracle_falls_back_to_allow_all() {
        let active = active(
            true,
            vec![raw(0, 0.0, 0.0, 10.0, 10.0), raw(1, 5.0, 5.0, 20.0, 20.0)],
            vec!["dog", "truck"],
        );

        let detections =
            InferenceGateway::run(&frame(), &active, &ClassOracle::Restricted(HashSet::new()))
                .unwrap();
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn boxes_are_normalized_and_ordered() {
        // 坐标顺序颠倒且超出帧边界
        let active = active(true, vec![raw(0, 120.0, -5.0, 30.0, 40.0)], vec!["dog"]);

        let detections = InferenceGateway::run(&frame(), &active, &oracle(&["dog"])).unwrap();
        let [ymin, xmin, ymax, xmax] = detections[0].box_2d;
        assert!(ymin <= ymax);
        assert!(xmin <= xmax);
        for value in [ymin, xmin, ymax, xmax] {
            assert!((0.0..=1.0).contains(&value));
        }
        assert_eq!(xmax, 1.0); // 120/100 clamp到1
        assert_eq!(ymin, 0.0); // -5截断到0
    }

    #[test]
    fn unknown_class_id_gets_placeholder_label() {
        let active = active(false, vec![raw(7, 0.0, 0.0, 10.0, 10.0)], vec!["dog"]);

        let detections =
            InferenceGateway::run(&frame(), &active, &ClassOracle::Unrestricted).unwrap();
        assert_eq!(detections[0].label, "class7");
    }
}
