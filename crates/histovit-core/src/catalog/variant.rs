//! Pathology foundation model variants and parser utilities.

use serde::{Deserialize, Serialize};

use crate::config::{RELEASE_TAG, WEIGHTS_BASE_URL};
use crate::error::{Error, Result};
use crate::models::vit::VitConfig;

/// Published pathology FM variants.
///
/// Each variant pins one architecture configuration to one released
/// checkpoint. Descriptors are immutable compile-time data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    /// ViT-Small, 16x16 patches, 224px training resolution
    #[serde(rename = "ViT-S/16")]
    VitS16,
    /// ViT-Small, 8x8 patches, 224px training resolution
    #[serde(rename = "ViT-S/8")]
    VitS8,
    /// ViT-Base, 16x16 patches, 224px training resolution
    #[serde(rename = "ViT-B/16")]
    VitB16,
    /// ViT-Base, 8x8 patches, 224px training resolution
    #[serde(rename = "ViT-B/8")]
    VitB8,
    /// ViT-Large, 14x14 patches, DINOv2 flavor with 4 register tokens,
    /// 518px training resolution
    #[serde(rename = "ViT-L/14")]
    VitL14,
}

impl ModelVariant {
    /// Architecture name the construction facility resolves.
    pub fn arch_name(&self) -> &'static str {
        match self {
            Self::VitS16 => "vit_small_patch16_224",
            Self::VitS8 => "vit_small_patch8_224",
            Self::VitB16 => "vit_base_patch16_224",
            Self::VitB8 => "vit_base_patch8_224",
            Self::VitL14 => "vit_large_patch14_reg4_dinov2",
        }
    }

    /// Get human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::VitS16 => "ViT-S/16",
            Self::VitS8 => "ViT-S/8",
            Self::VitB16 => "ViT-B/16",
            Self::VitB8 => "ViT-B/8",
            Self::VitL14 => "ViT-L/14",
        }
    }

    /// File name of the released checkpoint.
    pub fn weight_filename(&self) -> &'static str {
        match self {
            Self::VitS16 => "vits16.pth",
            Self::VitS8 => "vits8.pth",
            Self::VitB16 => "vitb16.pth",
            Self::VitB8 => "vitb8.pth",
            Self::VitL14 => "vitl14.pth",
        }
    }

    /// Full download URL for the released checkpoint.
    pub fn weight_url(&self) -> String {
        format!(
            "{}/{}/{}",
            WEIGHTS_BASE_URL,
            RELEASE_TAG,
            self.weight_filename()
        )
    }

    /// Whether the released checkpoint is stored in DINOv2-native layout
    /// and must be converted before strict loading.
    ///
    /// This holds for ViT-L/14 and only ViT-L/14; converting any other
    /// checkpoint (or skipping it for this one) breaks strict loading.
    pub fn needs_dinov2_conversion(&self) -> bool {
        matches!(self, Self::VitL14)
    }

    /// Output embedding width.
    pub fn embed_dim(&self) -> usize {
        self.vit_config(true).embed_dim
    }

    /// Estimated checkpoint size in bytes.
    pub fn estimated_size(&self) -> u64 {
        match self {
            Self::VitS16 => 87_000_000,  // ~83 MB
            Self::VitS8 => 87_000_000,   // ~83 MB
            Self::VitB16 => 344_000_000, // ~328 MB
            Self::VitB8 => 344_000_000,  // ~328 MB
            Self::VitL14 => 1_217_000_000, // ~1.13 GB
        }
    }

    /// Architecture construction parameters for this variant.
    pub fn vit_config(&self, dynamic_img_size: bool) -> VitConfig {
        let mut config = match self {
            Self::VitS16 => VitConfig::vit_small_patch16_224(),
            Self::VitS8 => VitConfig::vit_small_patch8_224(),
            Self::VitB16 => VitConfig::vit_base_patch16_224(),
            Self::VitB8 => VitConfig::vit_base_patch8_224(),
            Self::VitL14 => VitConfig::vit_large_patch14_reg4_dinov2(),
        };
        config.dynamic_img_size = dynamic_img_size;
        config
    }

    /// Get all available variants
    pub fn all() -> &'static [ModelVariant] {
        &[
            Self::VitS16,
            Self::VitS8,
            Self::VitB16,
            Self::VitB8,
            Self::VitL14,
        ]
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Resolve a user-supplied model identifier to a catalog variant.
///
/// Accepts the canonical display name ("ViT-S/16"), the checkpoint stem
/// ("vits16") and the architecture name ("vit_small_patch16_224"), with
/// case, separators and whitespace ignored.
pub fn parse_model_variant(input: &str) -> Result<ModelVariant> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::UnknownArchitecture("<empty>".to_string()));
    }

    let normalized = normalize_identifier(trimmed);

    if let Some(found) = ModelVariant::all()
        .iter()
        .copied()
        .find(|variant| matches_variant_alias(*variant, &normalized))
    {
        return Ok(found);
    }

    resolve_by_heuristic(&normalized)
        .ok_or_else(|| Error::UnknownArchitecture(trimmed.to_string()))
}

fn matches_variant_alias(variant: ModelVariant, normalized: &str) -> bool {
    let stem = variant
        .weight_filename()
        .trim_end_matches(".pth")
        .to_string();

    let aliases = [
        stem,
        variant.display_name().to_string(),
        variant.arch_name().to_string(),
    ];

    aliases
        .iter()
        .any(|alias| normalize_identifier(alias) == normalized)
}

fn resolve_by_heuristic(normalized: &str) -> Option<ModelVariant> {
    use ModelVariant::*;

    let small = normalized.contains("small") || normalized.contains("vits");
    let base = normalized.contains("base") || normalized.contains("vitb");
    let large = normalized.contains("large") || normalized.contains("vitl");

    if large || normalized.contains("dinov2") || normalized.ends_with("14") {
        return Some(VitL14);
    }

    if small && normalized.contains("16") {
        return Some(VitS16);
    }
    if small && normalized.contains('8') {
        return Some(VitS8);
    }
    if base && normalized.contains("16") {
        return Some(VitB16);
    }
    if base && normalized.contains('8') {
        return Some(VitB8);
    }

    None
}

fn normalize_identifier(input: &str) -> String {
    input
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_by_display_name() {
        let parsed = parse_model_variant("ViT-S/16").unwrap();
        assert_eq!(parsed, ModelVariant::VitS16);
    }

    #[test]
    fn parse_by_weight_stem() {
        let parsed = parse_model_variant("vitb8").unwrap();
        assert_eq!(parsed, ModelVariant::VitB8);
    }

    #[test]
    fn parse_by_arch_name() {
        let parsed = parse_model_variant("vit_large_patch14_reg4_dinov2").unwrap();
        assert_eq!(parsed, ModelVariant::VitL14);
    }

    #[test]
    fn parse_is_separator_insensitive() {
        let parsed = parse_model_variant(" vit-b / 16 ").unwrap();
        assert_eq!(parsed, ModelVariant::VitB16);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(matches!(
            parse_model_variant("resnet50"),
            Err(Error::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(parse_model_variant("   ").is_err());
    }

    #[test]
    fn weight_urls_follow_release_pattern() {
        for variant in ModelVariant::all() {
            let url = variant.weight_url();
            assert!(url.starts_with(WEIGHTS_BASE_URL));
            assert!(url.contains(RELEASE_TAG));
            assert!(url.ends_with(variant.weight_filename()));
        }
    }

    #[test]
    fn only_vitl14_requires_conversion() {
        for variant in ModelVariant::all() {
            assert_eq!(
                variant.needs_dinov2_conversion(),
                *variant == ModelVariant::VitL14
            );
        }
    }

    #[test]
    fn embed_dims_match_backbone_family() {
        assert_eq!(ModelVariant::VitS16.embed_dim(), 384);
        assert_eq!(ModelVariant::VitS8.embed_dim(), 384);
        assert_eq!(ModelVariant::VitB16.embed_dim(), 768);
        assert_eq!(ModelVariant::VitB8.embed_dim(), 768);
        assert_eq!(ModelVariant::VitL14.embed_dim(), 1024);
    }

    #[test]
    fn serde_roundtrip_uses_display_names() {
        let json = serde_json::to_string(&ModelVariant::VitL14).unwrap();
        assert_eq!(json, "\"ViT-L/14\"");
        let back: ModelVariant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ModelVariant::VitL14);
    }
}
