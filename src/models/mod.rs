pub mod handle;
pub mod registry;

pub use handle::ModelHandle;
pub use registry::{
    custom_weights_newest_first, latest_custom_weights, ActiveModel, ModelEntry, ModelRegistry,
};
