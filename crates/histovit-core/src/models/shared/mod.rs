//! Model-agnostic runtime helpers.

pub mod device;

pub use device::{DeviceCapabilities, DeviceKind, DeviceProfile, DeviceSelector};
