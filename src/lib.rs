pub mod backend;
pub mod camera;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod models;
pub mod training;
pub mod utils;
pub mod video;
pub mod web;

// 重新导出主要类型
pub use config::Config;
pub use inference::Detection;
pub use utils::error::DetectError;

pub type Result<T> = std::result::Result<T, DetectError>;
