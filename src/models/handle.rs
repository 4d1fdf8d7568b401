use serde::Serialize;
use std::path::Path;

/// 已加载检测模型的描述
///
/// `is_restricted` 为真表示该模型来自自定义数据集训练，
/// 其输出标签必须被限制在数据集声明的类别内。
#[derive(Debug, Clone, Serialize)]
pub struct ModelHandle {
    /// 来源路径
    pub source_path: String,
    /// 展示名称
    pub display_name: String,
    /// 是否为受限（自定义训练）模型
    pub is_restricted: bool,
}

impl ModelHandle {
    /// 根据权重路径分类：位于训练运行目录下的权重视为受限模型
    pub fn classify(path: &Path, runs_dir: &Path) -> Self {
        let text = path.to_string_lossy().replace('\\', "/");
        let is_restricted =
            path.starts_with(runs_dir) || text.contains("/detect/") || text.starts_with("runs/");

        let display_name = if is_restricted {
            match run_name(path) {
                Some(run) => format!("{} (custom trained)", run),
                None => stem_of(path),
            }
        } else {
            // 短名称大写展示，长名称原样
            let stem = stem_of(path);
            if stem.len() <= 10 {
                stem.to_uppercase()
            } else {
                stem
            }
        };

        Self {
            source_path: text,
            display_name,
            is_restricted,
        }
    }
}

/// 提取训练运行目录名（.../detect/<run>/weights/best.*）
fn run_name(path: &Path) -> Option<String> {
    let mut components = path.components();
    while let Some(component) = components.next() {
        if component.as_os_str() == "detect" {
            return components
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned());
        }
    }
    None
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn training_run_weights_are_restricted() {
        let runs = PathBuf::from("runs");
        let handle =
            ModelHandle::classify(Path::new("runs/detect/custom_model3/weights/best.onnx"), &runs);
        assert!(handle.is_restricted);
        assert_eq!(handle.display_name, "custom_model3 (custom trained)");
    }

    #[test]
    fn pretrained_weights_are_unrestricted() {
        let runs = PathBuf::from("runs");
        let handle = ModelHandle::classify(Path::new("models/yolov8s.onnx"), &runs);
        assert!(!handle.is_restricted);
        assert_eq!(handle.display_name, "YOLOV8S");
    }
}
