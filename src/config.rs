use anyhow::Result;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// 服务器绑定地址
    pub bind_addr: String,

    /// 预训练权重目录
    pub models_dir: PathBuf,

    /// 数据集目录（images/ labels/ data.yaml）
    pub dataset_dir: PathBuf,

    /// 训练输出目录（runs/detect/<run>/weights/best.*）
    pub runs_dir: PathBuf,

    /// 标注文字字体（缺省时只画框不写字）
    pub font_path: Option<PathBuf>,

    /// 工作线程数量
    pub workers: usize,

    /// 开发模式
    pub dev_mode: bool,

    /// 训练配置
    pub training_config: TrainingConfig,

    /// 服务器配置
    pub server_config: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// 外部训练器命令（黑盒训练过程）
    pub trainer_cmd: String,

    /// 训练输入尺寸
    pub image_size: u32,

    /// 训练批大小
    pub batch: u32,

    /// 标签文件抽样校验数量
    pub label_sample: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 请求超时时间（秒）
    pub request_timeout: u64,

    /// 最大请求体大小（字节）
    pub max_request_size: usize,
}

/// 摄像头探测的索引上界（探测 0..N）
pub const CAMERA_PROBE_RANGE: u32 = 5;

/// 缺省预训练权重文件名
pub const DEFAULT_WEIGHTS: &str = "yolov8s.onnx";

impl Config {
    pub fn new(
        bind_addr: String,
        models_dir: String,
        dataset_dir: String,
        runs_dir: String,
        font_path: Option<String>,
        workers: Option<usize>,
        dev_mode: bool,
    ) -> Result<Self> {
        let cpu_cores = num_cpus::get();
        let workers = workers.unwrap_or(cpu_cores);

        let training_config = TrainingConfig {
            trainer_cmd: "yolo".to_string(),
            image_size: 640,
            batch: 16,
            label_sample: 10,
        };

        let server_config = ServerConfig {
            request_timeout: if dev_mode { 300 } else { 60 }, // 开发模式更长超时
            max_request_size: 200 * 1024 * 1024,              // 200MB，需容纳视频上传
        };

        Ok(Self {
            bind_addr,
            models_dir: PathBuf::from(models_dir),
            dataset_dir: PathBuf::from(dataset_dir),
            runs_dir: PathBuf::from(runs_dir),
            font_path: font_path.map(PathBuf::from),
            workers,
            dev_mode,
            training_config,
            server_config,
        })
    }

    /// 数据集描述文件路径
    pub fn data_yaml_path(&self) -> PathBuf {
        self.dataset_dir.join("data.yaml")
    }

    /// 标签目录
    pub fn labels_dir(&self) -> PathBuf {
        self.dataset_dir.join("labels")
    }

    /// 图片目录
    pub fn images_dir(&self) -> PathBuf {
        self.dataset_dir.join("images")
    }

    /// 预定义类别列表
    pub fn predefined_classes_path(&self) -> PathBuf {
        self.dataset_dir.join("predefined_classes.txt")
    }

    /// 训练运行目录（每次训练产出一个子目录）
    pub fn detect_runs_dir(&self) -> PathBuf {
        self.runs_dir.join("detect")
    }

    /// 缺省预训练权重路径
    pub fn default_weights_path(&self) -> PathBuf {
        self.models_dir.join(DEFAULT_WEIGHTS)
    }

    /// 训练用的归一化数据集描述文件（绝对路径、列表形式的names）
    pub fn training_yaml_path(&self) -> PathBuf {
        self.dataset_dir.join("train_data.yaml")
    }
}
