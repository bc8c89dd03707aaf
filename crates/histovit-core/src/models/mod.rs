//! Model architectures and shared runtime helpers.

pub mod shared;
pub mod vit;

pub use shared::{DeviceProfile, DeviceSelector};
pub use vit::{ModelOutput, VisionTransformer, VitConfig};
