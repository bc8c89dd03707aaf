//! Device selection for native inference.

use candle_core::{DType, Device};
use tracing::{debug, info};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }

    pub fn is_metal(&self) -> bool {
        matches!(self, DeviceKind::Metal)
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, DeviceKind::Cuda)
    }
}

/// Device capabilities and dtype hints
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Whether the device prefers float32 (Metal on Apple Silicon)
    pub prefers_f32: bool,
    /// Whether the device supports bfloat16
    pub supports_bf16: bool,
    /// Whether the device has unified memory (Apple Silicon)
    pub has_unified_memory: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
    pub capabilities: DeviceCapabilities,
}

impl DeviceProfile {
    /// Select dtype based on device kind and requested preference.
    ///
    /// Metal on Apple Silicon runs F32 faster than the half formats, so
    /// half-precision requests are widened there; CPUs always get F32.
    pub fn select_dtype(&self, requested: Option<&str>) -> DType {
        let dtype = match requested.unwrap_or("") {
            "bfloat16" | "bf16" => match self.kind {
                DeviceKind::Cpu | DeviceKind::Metal => DType::F32,
                DeviceKind::Cuda => {
                    if self.capabilities.supports_bf16 {
                        DType::BF16
                    } else {
                        DType::F32
                    }
                }
            },
            "float16" | "f16" => match self.kind {
                DeviceKind::Cpu | DeviceKind::Metal => DType::F32,
                DeviceKind::Cuda => DType::F16,
            },
            "float32" | "f32" => DType::F32,
            _ => match self.kind {
                DeviceKind::Cpu | DeviceKind::Metal => DType::F32,
                DeviceKind::Cuda => {
                    if self.capabilities.supports_bf16 {
                        DType::BF16
                    } else {
                        DType::F32
                    }
                }
            },
        };

        debug!(
            "Selected dtype {:?} for device {:?} (requested: {:?})",
            dtype, self.kind, requested
        );

        dtype
    }

    pub fn optimal_dtype(&self) -> DType {
        self.select_dtype(None)
    }

    fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            capabilities: DeviceCapabilities::default(),
        }
    }
}

pub struct DeviceSelector;

impl DeviceSelector {
    fn try_metal() -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::metal_if_available(0))
            .ok()?
            .ok()?;
        if device.is_metal() {
            Some(DeviceProfile {
                device,
                kind: DeviceKind::Metal,
                capabilities: DeviceCapabilities {
                    prefers_f32: true,
                    supports_bf16: false,
                    has_unified_memory: true,
                },
            })
        } else {
            None
        }
    }

    fn try_cuda() -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::cuda_if_available(0))
            .ok()?
            .ok()?;
        if device.is_cuda() {
            Some(DeviceProfile {
                device,
                kind: DeviceKind::Cuda,
                capabilities: DeviceCapabilities {
                    prefers_f32: false,
                    supports_bf16: true,
                    has_unified_memory: false,
                },
            })
        } else {
            None
        }
    }

    pub fn detect() -> Result<DeviceProfile> {
        if cfg!(target_os = "macos") {
            if let Some(profile) = Self::try_metal() {
                info!("Using Metal device for inference");
                return Ok(profile);
            }
        } else if let Some(profile) = Self::try_cuda() {
            info!("Using CUDA device for inference");
            return Ok(profile);
        }

        info!("Falling back to CPU for inference");
        Ok(DeviceProfile::cpu())
    }

    pub fn detect_with_preference(preference: Option<&str>) -> Result<DeviceProfile> {
        match preference.unwrap_or("") {
            "cuda" => {
                if let Some(profile) = Self::try_cuda() {
                    Ok(profile)
                } else {
                    Self::detect()
                }
            }
            "metal" | "mps" => {
                if let Some(profile) = Self::try_metal() {
                    Ok(profile)
                } else {
                    Self::detect()
                }
            }
            "cpu" => Ok(DeviceProfile::cpu()),
            _ => Self::detect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_preference_returns_cpu() {
        let profile = DeviceSelector::detect_with_preference(Some("cpu")).unwrap();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert!(profile.device.is_cpu());
    }

    #[test]
    fn detect_kind_matches_device() {
        let profile = DeviceSelector::detect().unwrap();
        match profile.kind {
            DeviceKind::Cpu => assert!(profile.device.is_cpu()),
            DeviceKind::Metal => assert!(profile.device.is_metal()),
            DeviceKind::Cuda => assert!(profile.device.is_cuda()),
        }
    }

    #[test]
    fn cpu_always_f32() {
        let profile = DeviceProfile::cpu();
        assert_eq!(profile.select_dtype(None), DType::F32);
        assert_eq!(profile.select_dtype(Some("bf16")), DType::F32);
        assert_eq!(profile.select_dtype(Some("f16")), DType::F32);
        assert_eq!(profile.select_dtype(Some("f32")), DType::F32);
    }

    #[test]
    fn cuda_dtype_selection() {
        let profile = DeviceProfile {
            device: Device::Cpu,
            kind: DeviceKind::Cuda,
            capabilities: DeviceCapabilities {
                supports_bf16: true,
                ..Default::default()
            },
        };
        assert_eq!(profile.select_dtype(None), DType::BF16);
        assert_eq!(profile.select_dtype(Some("f16")), DType::F16);
        assert_eq!(profile.select_dtype(Some("f32")), DType::F32);
    }
}
