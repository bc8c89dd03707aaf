//! Factory entry points for the published pathology foundation models.
//!
//! Each factory call is stateless and blocking: construct the architecture,
//! fetch the checkpoint if requested (cache permitting), convert when the
//! variant's release needs it, verify strictly, load. The caller owns the
//! returned model; the hub keeps nothing.

use candle_nn::VarBuilder;
use tracing::info;

use crate::catalog::{parse_model_variant, ModelVariant};
use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::models::shared::{DeviceProfile, DeviceSelector};
use crate::models::vit::VisionTransformer;
use crate::weights::{convert_dinov2, StateDict, WeightDownloader};

/// Per-call options, shared by every variant factory.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Populate the model from the published checkpoint. When false the
    /// model comes back freshly initialized and nothing touches the network.
    pub pretrained: bool,
    /// Tolerate input grids other than the trained one by resampling the
    /// positional embedding at forward time.
    pub dynamic_img_size: bool,
    /// Block indices to expose as intermediate feature maps; switches the
    /// model into feature-extraction mode.
    pub out_indices: Option<Vec<usize>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            pretrained: true,
            dynamic_img_size: true,
            out_indices: None,
        }
    }
}

impl LoadOptions {
    pub fn pretrained(mut self, pretrained: bool) -> Self {
        self.pretrained = pretrained;
        self
    }

    pub fn dynamic_img_size(mut self, dynamic_img_size: bool) -> Self {
        self.dynamic_img_size = dynamic_img_size;
        self
    }

    pub fn out_indices(mut self, indices: impl Into<Vec<usize>>) -> Self {
        self.out_indices = Some(indices.into());
        self
    }
}

/// Read-only facade over the variant registry, a device profile and the
/// weight cache.
pub struct ModelHub {
    config: HubConfig,
    device: DeviceProfile,
    downloader: WeightDownloader,
}

impl ModelHub {
    pub fn new() -> Result<Self> {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Result<Self> {
        let device = DeviceSelector::detect_with_preference(config.device.as_deref())?;
        let downloader = WeightDownloader::new(config.weights_dir.clone())?;
        Ok(Self {
            config,
            device,
            downloader,
        })
    }

    pub fn device(&self) -> &DeviceProfile {
        &self.device
    }

    pub fn downloader(&self) -> &WeightDownloader {
        &self.downloader
    }

    /// Instantiate a variant.
    pub fn create(&self, variant: ModelVariant, options: &LoadOptions) -> Result<VisionTransformer> {
        let config = variant.vit_config(options.dynamic_img_size);

        if let Some(indices) = &options.out_indices {
            if indices.is_empty() {
                return Err(Error::InvalidInput(
                    "out_indices must select at least one block".to_string(),
                ));
            }
            if let Some(&bad) = indices.iter().find(|&&idx| idx >= config.depth) {
                return Err(Error::InvalidInput(format!(
                    "out_index {bad} out of range for depth {}",
                    config.depth
                )));
            }
        }

        let dtype = self.device.select_dtype(self.config.dtype.as_deref());

        let vb = if options.pretrained {
            let path = self.downloader.fetch(variant)?;
            let mut state_dict = StateDict::from_pth(&path)?;
            if variant.needs_dinov2_conversion() {
                state_dict = convert_dinov2(state_dict)?;
            }
            state_dict.verify_strict(&config.parameter_spec())?;
            state_dict.into_var_builder(dtype, &self.device.device)?
        } else {
            VarBuilder::zeros(dtype, &self.device.device)
        };

        let model = VisionTransformer::load(config, vb)?;
        info!(
            "Initialized {} (pretrained: {})",
            variant.display_name(),
            options.pretrained
        );

        match &options.out_indices {
            Some(indices) => model.with_out_indices(indices.clone()),
            None => Ok(model),
        }
    }

    /// Instantiate by identifier; unknown names are a configuration error.
    pub fn create_by_name(&self, name: &str, options: &LoadOptions) -> Result<VisionTransformer> {
        let variant = parse_model_variant(name)?;
        self.create(variant, options)
    }

    /// ViT-S/16 pathology FM.
    pub fn vits16(&self, options: &LoadOptions) -> Result<VisionTransformer> {
        self.create(ModelVariant::VitS16, options)
    }

    /// ViT-S/8 pathology FM.
    pub fn vits8(&self, options: &LoadOptions) -> Result<VisionTransformer> {
        self.create(ModelVariant::VitS8, options)
    }

    /// ViT-B/16 pathology FM.
    pub fn vitb16(&self, options: &LoadOptions) -> Result<VisionTransformer> {
        self.create(ModelVariant::VitB16, options)
    }

    /// ViT-B/8 pathology FM.
    pub fn vitb8(&self, options: &LoadOptions) -> Result<VisionTransformer> {
        self.create(ModelVariant::VitB8, options)
    }

    /// ViT-L/14 pathology FM. Its release is DINOv2-native and is converted
    /// before strict loading.
    pub fn vitl14(&self, options: &LoadOptions) -> Result<VisionTransformer> {
        self.create(ModelVariant::VitL14, options)
    }
}

/// Initializes the ViT-S/16 pathology FM with a default hub.
pub fn vits16(options: &LoadOptions) -> Result<VisionTransformer> {
    ModelHub::new()?.vits16(options)
}

/// Initializes the ViT-S/8 pathology FM with a default hub.
pub fn vits8(options: &LoadOptions) -> Result<VisionTransformer> {
    ModelHub::new()?.vits8(options)
}

/// Initializes the ViT-B/16 pathology FM with a default hub.
pub fn vitb16(options: &LoadOptions) -> Result<VisionTransformer> {
    ModelHub::new()?.vitb16(options)
}

/// Initializes the ViT-B/8 pathology FM with a default hub.
pub fn vitb8(options: &LoadOptions) -> Result<VisionTransformer> {
    ModelHub::new()?.vitb8(options)
}

/// Initializes the ViT-L/14 pathology FM with a default hub.
pub fn vitl14(options: &LoadOptions) -> Result<VisionTransformer> {
    ModelHub::new()?.vitl14(options)
}

/// Instantiate any catalog variant by identifier with a default hub.
pub fn create_model(name: &str, options: &LoadOptions) -> Result<VisionTransformer> {
    ModelHub::new()?.create_by_name(name, options)
}
