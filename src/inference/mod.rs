pub mod annotate;
pub mod gateway;

pub use annotate::Annotator;
pub use gateway::{Detection, InferenceGateway};
