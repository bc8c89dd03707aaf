//! Histovit Core - Pathology foundation models for candle
//!
//! Factory entry points for the published pathology vision-transformer
//! foundation models. Each variant pairs an architecture configuration
//! with a released checkpoint; loading is strict and per-call stateless.
//!
//! # Example
//!
//! ```ignore
//! use histovit_core::{vits16, LoadOptions};
//!
//! let model = vits16(&LoadOptions::default())?;
//! let embedding = model.forward_pooled(&patch_batch)?;
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod factory;
pub mod models;
pub mod weights;

pub use error::{Error, Result};

// Catalog/model metadata re-exports
pub use catalog::{parse_model_variant, ModelVariant};
pub use config::{HubConfig, RELEASE_TAG};

// Factory surface re-exports
pub use factory::{
    create_model, vitb16, vitb8, vitl14, vits16, vits8, LoadOptions, ModelHub,
};

// Model/runtime re-exports
pub use models::{DeviceProfile, DeviceSelector, ModelOutput, VisionTransformer, VitConfig};
pub use weights::{StateDict, WeightDownloader};
