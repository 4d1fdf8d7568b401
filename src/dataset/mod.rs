//! 数据集描述文件（data.yaml）、类别白名单与标签校验

use crate::models::ModelHandle;
use crate::{DetectError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// 没有 predefined_classes.txt 时的缺省类别表
pub const DEFAULT_CLASSES: &[&str] = &[
    "dog",
    "cat",
    "person",
    "car",
    "bicycle",
    "motorcycle",
    "bus",
    "truck",
    "traffic_light",
    "stop_sign",
    "fire_hydrant",
    "parking_meter",
    "pedestrian",
    "traffic_cone",
    "barrier",
];

/// 标签目录里不属于标注的文件
const NON_LABEL_FILES: &[&str] = &["classes.txt", "classes.txt.backup", "predefined_classes.txt"];

/// 数据集描述（data.yaml）
///
/// `names` 必须是序列；键值映射形式按索引转换为序列。
#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
    pub nc: usize,
    pub names: Vec<String>,
}

#[derive(Deserialize)]
struct RawDescriptor {
    nc: Option<usize>,
    names: Option<NamesField>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NamesField {
    List(Vec<String>),
    Map(BTreeMap<usize, String>),
}

impl DatasetDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let raw: RawDescriptor = serde_yaml::from_str(&text)?;

        let nc = raw.nc.unwrap_or(0);
        let names = match raw.names {
            Some(NamesField::List(list)) => list,
            Some(NamesField::Map(map)) => {
                // 键值映射按索引展开为序列
                let count = if nc > 0 { nc } else { map.len() };
                (0..count)
                    .map(|i| map.get(&i).cloned().unwrap_or_else(|| format!("class{}", i)))
                    .collect()
            }
            None => Vec::new(),
        };
        let nc = if nc > 0 { nc } else { names.len() };

        Ok(Self { nc, names })
    }

    /// 写出训练用的归一化描述文件：绝对路径 + 序列形式的names
    pub fn write_training_yaml(&self, dataset_dir: &Path, out: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct TrainingYaml<'a> {
            path: String,
            train: &'a str,
            val: &'a str,
            nc: usize,
            names: &'a [String],
        }

        let doc = TrainingYaml {
            path: dataset_dir.to_string_lossy().into_owned(),
            train: "images",
            val: "images",
            nc: self.nc,
            names: &self.names,
        };

        let body = serde_yaml::to_string(&doc)?;
        fs::write(out, body)?;
        Ok(())
    }
}

/// 受限模型允许输出的标签集合
#[derive(Debug, Clone)]
pub enum ClassOracle {
    /// 非受限模型：不做过滤
    Unrestricted,
    /// 受限模型：只允许集合内的标签。空集合表示描述文件缺失或
    /// 没有类别表，此时网关回退为放行全部（已记录的策略缺口）。
    Restricted(HashSet<String>),
}

impl ClassOracle {
    /// 每次推理请求时读取描述文件，不跨请求缓存
    pub fn load_for(handle: &ModelHandle, data_yaml: &Path) -> Self {
        if !handle.is_restricted {
            return ClassOracle::Unrestricted;
        }

        match DatasetDescriptor::load(data_yaml) {
            Ok(descriptor) => ClassOracle::Restricted(descriptor.names.into_iter().collect()),
            Err(e) => {
                tracing::debug!("No class list for restricted model: {}", e);
                ClassOracle::Restricted(HashSet::new())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ClassOracle::Unrestricted => false,
            ClassOracle::Restricted(set) => set.is_empty(),
        }
    }

    pub fn permits(&self, label: &str) -> bool {
        match self {
            ClassOracle::Unrestricted => true,
            ClassOracle::Restricted(set) => set.contains(label),
        }
    }
}

/// 标注文件清单（排除类别定义文件），按文件名排序
fn label_files(labels_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(labels_dir) else {
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("txt")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !NON_LABEL_FILES.contains(&n))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// 训练前的标签抽样校验：类别id必须小于声明的类别数
///
/// 只检查前 `sample` 个文件；发现任何非法id则整个任务失败，
/// 错误信息里点名文件与id。
pub fn validate_labels(labels_dir: &Path, nc: usize, sample: usize) -> Result<()> {
    let files = label_files(labels_dir);
    tracing::info!("Found {} label files", files.len());

    let mut invalid = Vec::new();
    for path in files.iter().take(sample) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = fs::read_to_string(path)?;
        for line in text.lines() {
            let Some(first) = line.split_whitespace().next() else {
                continue;
            };
            match first.parse::<usize>() {
                Ok(class_id) if class_id >= nc => {
                    invalid.push(format!("{}: class_id={} >= nc={}", name, class_id, nc));
                }
                Ok(_) => {}
                Err(_) => invalid.push(format!("{}: invalid class_id={}", name, first)),
            }
        }
    }

    if invalid.is_empty() {
        Ok(())
    } else {
        Err(DetectError::Validation(format!(
            "invalid labels found: {}",
            invalid[..invalid.len().min(5)].join("; ")
        )))
    }
}

/// 生成的数据集配置摘要
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedDataset {
    pub nc: usize,
    pub names: Vec<String>,
    pub image_count: usize,
    pub label_count: usize,
    pub yaml_path: String,
}

/// 根据预定义类别表和标注中实际出现的类别id重建 data.yaml
pub fn generate_dataset_yaml(dataset_dir: &Path) -> Result<GeneratedDataset> {
    let all_class_names = read_class_table(dataset_dir);

    // 扫描标注收集用到的类别id；没有标注时退回 {0, 1}
    let mut used_ids: BTreeSet<usize> = BTreeSet::new();
    for path in label_files(&dataset_dir.join("labels")) {
        let Ok(text) = fs::read_to_string(&path) else {
            tracing::warn!("Failed to read label file {}", path.display());
            continue;
        };
        for line in text.lines() {
            if let Some(first) = line.split_whitespace().next() {
                if let Ok(id) = first.parse::<usize>() {
                    used_ids.insert(id);
                }
            }
        }
    }
    if used_ids.is_empty() {
        used_ids.extend([0, 1]);
    }

    let names: Vec<String> = used_ids
        .iter()
        .map(|&id| {
            all_class_names
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("class{}", id))
        })
        .collect();
    let nc = names.len();

    let descriptor = DatasetDescriptor {
        nc,
        names: names.clone(),
    };
    let yaml_path = dataset_dir.join("data.yaml");
    let mut body = format!(
        "# YOLO dataset configuration - generated\n# generated at: {}\n\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    body.push_str(&serde_yaml::to_string(&serde_json::json!({
        "path": dataset_dir.to_string_lossy(),
        "train": "images",
        "val": "images",
        "nc": descriptor.nc,
        "names": descriptor.names,
    }))?);
    fs::write(&yaml_path, body)?;

    let stats = dataset_stats(dataset_dir)?;
    Ok(GeneratedDataset {
        nc,
        names,
        image_count: stats.total_images,
        label_count: stats.label_files,
        yaml_path: yaml_path.to_string_lossy().into_owned(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassCount {
    pub id: usize,
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub total_images: usize,
    pub annotated_images: usize,
    pub unannotated_images: usize,
    /// 标注进度百分比
    pub progress: f32,
    pub total_boxes: u64,
    pub label_files: usize,
    pub class_distribution: Vec<ClassCount>,
}

/// 数据集统计：图片数、标注覆盖率、各类别的框数
pub fn dataset_stats(dataset_dir: &Path) -> Result<DatasetStats> {
    let images_dir = dataset_dir.join("images");
    let image_stems: Vec<String> = fs::read_dir(&images_dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()).map(str::to_lowercase),
                        Some(ext) if ["jpg", "jpeg", "png"].contains(&ext.as_str())
                    )
                })
                .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .collect()
        })
        .unwrap_or_default();

    let labels = label_files(&dataset_dir.join("labels"));
    let label_stems: HashSet<String> = labels
        .iter()
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();

    let mut class_counts: BTreeMap<usize, u64> = BTreeMap::new();
    let mut total_boxes = 0u64;
    for path in &labels {
        let Ok(text) = fs::read_to_string(path) else {
            tracing::warn!("Failed to read label file {}", path.display());
            continue;
        };
        for line in text.lines() {
            if let Some(first) = line.split_whitespace().next() {
                if let Ok(id) = first.parse::<usize>() {
                    *class_counts.entry(id).or_default() += 1;
                    total_boxes += 1;
                }
            }
        }
    }

    let class_table = read_class_table(dataset_dir);
    let class_distribution = class_counts
        .into_iter()
        .map(|(id, count)| ClassCount {
            id,
            name: class_table
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("class{}", id)),
            count,
        })
        .collect();

    let annotated = image_stems
        .iter()
        .filter(|stem| label_stems.contains(*stem))
        .count();
    let total = image_stems.len();
    let progress = if total > 0 {
        annotated as f32 / total as f32 * 100.0
    } else {
        0.0
    };

    Ok(DatasetStats {
        total_images: total,
        annotated_images: annotated,
        unannotated_images: total - annotated,
        progress,
        total_boxes,
        label_files: labels.len(),
        class_distribution,
    })
}

/// 读取预定义类别表，没有则用缺省表
fn read_class_table(dataset_dir: &Path) -> Vec<String> {
    let predefined = dataset_dir.join("predefined_classes.txt");
    match fs::read_to_string(&predefined) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => DEFAULT_CLASSES.iter().map(|s| s.to_string()).collect(),
    }
}
