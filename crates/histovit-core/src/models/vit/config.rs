//! Vision transformer construction parameters.

use serde::{Deserialize, Serialize};

/// Construction parameters for a [`super::VisionTransformer`].
///
/// The per-architecture constructors mirror the published configurations;
/// everything else in the crate treats this struct as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitConfig {
    /// Nominal training resolution (square).
    pub img_size: usize,
    /// Patch edge length.
    pub patch_size: usize,
    /// Input channels.
    pub in_chans: usize,
    /// Token width.
    pub embed_dim: usize,
    /// Number of transformer blocks.
    pub depth: usize,
    /// Attention heads per block.
    pub num_heads: usize,
    /// Hidden expansion of the MLP, as a multiple of `embed_dim`.
    pub mlp_ratio: usize,
    /// Number of register tokens prepended after the class token.
    pub reg_tokens: usize,
    /// LayerScale initial value. `None` disables LayerScale entirely,
    /// which also removes its parameters from the manifest.
    pub init_values: Option<f64>,
    /// Whether the positional embedding covers the class token. The
    /// DINOv2 flavor positions only the patch grid.
    pub embed_class_token: bool,
    /// Resample the positional embedding at forward time when the input
    /// grid differs from the trained grid.
    pub dynamic_img_size: bool,
    /// LayerNorm epsilon.
    pub layer_norm_eps: f64,
}

impl VitConfig {
    pub fn vit_small_patch16_224() -> Self {
        Self::classic(224, 16, 384, 12, 6)
    }

    pub fn vit_small_patch8_224() -> Self {
        Self::classic(224, 8, 384, 12, 6)
    }

    pub fn vit_base_patch16_224() -> Self {
        Self::classic(224, 16, 768, 12, 12)
    }

    pub fn vit_base_patch8_224() -> Self {
        Self::classic(224, 8, 768, 12, 12)
    }

    pub fn vit_large_patch14_reg4_dinov2() -> Self {
        Self {
            img_size: 518,
            patch_size: 14,
            in_chans: 3,
            embed_dim: 1024,
            depth: 24,
            num_heads: 16,
            mlp_ratio: 4,
            reg_tokens: 4,
            init_values: Some(1e-5),
            embed_class_token: false,
            dynamic_img_size: true,
            layer_norm_eps: 1e-6,
        }
    }

    fn classic(
        img_size: usize,
        patch_size: usize,
        embed_dim: usize,
        depth: usize,
        num_heads: usize,
    ) -> Self {
        Self {
            img_size,
            patch_size,
            in_chans: 3,
            embed_dim,
            depth,
            num_heads,
            mlp_ratio: 4,
            reg_tokens: 0,
            init_values: None,
            embed_class_token: true,
            dynamic_img_size: true,
            layer_norm_eps: 1e-6,
        }
    }

    /// Patch grid edge length at the nominal resolution.
    pub fn grid_size(&self) -> usize {
        self.img_size / self.patch_size
    }

    /// Number of patch tokens at the nominal resolution.
    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Positional-embedding length: the patch grid, plus the class slot
    /// for architectures that embed it.
    pub fn pos_embed_len(&self) -> usize {
        self.num_patches() + usize::from(self.embed_class_token)
    }

    /// Prefix tokens ahead of the patch tokens in the sequence.
    pub fn num_prefix_tokens(&self) -> usize {
        1 + self.reg_tokens
    }

    /// MLP hidden width.
    pub fn mlp_hidden_dim(&self) -> usize {
        self.embed_dim * self.mlp_ratio
    }

    /// The full parameter manifest: every parameter name and shape of the
    /// constructed model, in checkpoint naming.
    ///
    /// Strict loading diffs a state dict against this list; the manifest and
    /// the construction code must agree exactly.
    pub fn parameter_spec(&self) -> Vec<(String, Vec<usize>)> {
        let d = self.embed_dim;
        let hidden = self.mlp_hidden_dim();
        let mut spec = Vec::new();

        spec.push(("cls_token".to_string(), vec![1, 1, d]));
        if self.reg_tokens > 0 {
            spec.push(("reg_token".to_string(), vec![1, self.reg_tokens, d]));
        }
        spec.push(("pos_embed".to_string(), vec![1, self.pos_embed_len(), d]));
        spec.push((
            "patch_embed.proj.weight".to_string(),
            vec![d, self.in_chans, self.patch_size, self.patch_size],
        ));
        spec.push(("patch_embed.proj.bias".to_string(), vec![d]));

        for idx in 0..self.depth {
            let p = |name: &str| format!("blocks.{idx}.{name}");
            spec.push((p("norm1.weight"), vec![d]));
            spec.push((p("norm1.bias"), vec![d]));
            spec.push((p("attn.qkv.weight"), vec![3 * d, d]));
            spec.push((p("attn.qkv.bias"), vec![3 * d]));
            spec.push((p("attn.proj.weight"), vec![d, d]));
            spec.push((p("attn.proj.bias"), vec![d]));
            if self.init_values.is_some() {
                spec.push((p("ls1.gamma"), vec![d]));
            }
            spec.push((p("norm2.weight"), vec![d]));
            spec.push((p("norm2.bias"), vec![d]));
            spec.push((p("mlp.fc1.weight"), vec![hidden, d]));
            spec.push((p("mlp.fc1.bias"), vec![hidden]));
            spec.push((p("mlp.fc2.weight"), vec![d, hidden]));
            spec.push((p("mlp.fc2.bias"), vec![d]));
            if self.init_values.is_some() {
                spec.push((p("ls2.gamma"), vec![d]));
            }
        }

        spec.push(("norm.weight".to_string(), vec![d]));
        spec.push(("norm.bias".to_string(), vec![d]));
        spec
    }
}
