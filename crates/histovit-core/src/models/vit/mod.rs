//! Vision transformer backbone assembled from candle-nn layers.
//!
//! Supports the classic timm layout (class token covered by the positional
//! embedding) and the DINOv2 flavor (register tokens, LayerScale, patch-only
//! positional embedding). The positional embedding is resampled at forward
//! time when dynamic image sizing is enabled and the input grid differs
//! from the trained grid.

mod config;

pub use config::VitConfig;

use std::collections::{HashMap, HashSet};

use candle_core::{IndexOp, Tensor, D};
use candle_nn::ops;
use candle_nn::{
    conv2d, layer_norm, linear, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder,
};

use crate::error::{Error, Result};

/// Output of a forward pass.
///
/// A plain embedder produces one pooled embedding; a model constructed with
/// `out_indices` produces the ordered intermediate feature maps instead.
#[derive(Debug)]
pub enum ModelOutput {
    /// Class-token embedding, `[batch, embed_dim]`.
    Embedding(Tensor),
    /// One `[batch, embed_dim, grid_h, grid_w]` map per requested index,
    /// in the requested order.
    FeatureMaps(Vec<Tensor>),
}

impl ModelOutput {
    pub fn into_embedding(self) -> Result<Tensor> {
        match self {
            Self::Embedding(t) => Ok(t),
            Self::FeatureMaps(_) => Err(Error::InvalidInput(
                "model is in feature-extraction mode".to_string(),
            )),
        }
    }

    pub fn into_feature_maps(self) -> Result<Vec<Tensor>> {
        match self {
            Self::FeatureMaps(maps) => Ok(maps),
            Self::Embedding(_) => Err(Error::InvalidInput(
                "model is not in feature-extraction mode".to_string(),
            )),
        }
    }
}

struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    fn load(config: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let proj = conv2d(
            config.in_chans,
            config.embed_dim,
            config.patch_size,
            conv_cfg,
            vb.pp("proj"),
        )?;
        Ok(Self { proj })
    }

    /// `[B, C, H, W]` -> `[B, N, D]` with N in row-major grid order.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x = self.proj.forward(xs)?;
        x.flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()
            .map_err(Error::from)
    }
}

struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn load(config: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.embed_dim;
        let head_dim = d / config.num_heads;
        let qkv = linear(d, 3 * d, vb.pp("qkv"))?;
        let proj = linear(d, d, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            num_heads: config.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, d) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = q
            .matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?
            .affine(self.scale, 0.0)?;
        let attn = ops::softmax_last_dim(&attn)?;

        let x = attn.matmul(&v)?;
        let x = x.transpose(1, 2)?.contiguous()?.reshape((b, n, d))?;
        self.proj.forward(&x).map_err(Error::from)
    }
}

struct LayerScale {
    gamma: Tensor,
}

impl LayerScale {
    fn load(dim: usize, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get(dim, "gamma")?;
        Ok(Self { gamma })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&self.gamma).map_err(Error::from)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn load(config: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(config.embed_dim, config.mlp_hidden_dim(), vb.pp("fc1"))?;
        let fc2 = linear(config.mlp_hidden_dim(), config.embed_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(xs)?;
        let x = x.gelu()?;
        self.fc2.forward(&x).map_err(Error::from)
    }
}

struct Block {
    norm1: LayerNorm,
    attn: Attention,
    ls1: Option<LayerScale>,
    norm2: LayerNorm,
    mlp: Mlp,
    ls2: Option<LayerScale>,
}

impl Block {
    fn load(config: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.embed_dim;
        let eps = config.layer_norm_eps;

        let norm1 = layer_norm(d, eps, vb.pp("norm1"))?;
        let attn = Attention::load(config, vb.pp("attn"))?;
        let norm2 = layer_norm(d, eps, vb.pp("norm2"))?;
        let mlp = Mlp::load(config, vb.pp("mlp"))?;

        let (ls1, ls2) = if config.init_values.is_some() {
            (
                Some(LayerScale::load(d, vb.pp("ls1"))?),
                Some(LayerScale::load(d, vb.pp("ls2"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            norm1,
            attn,
            ls1,
            norm2,
            mlp,
            ls2,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut attn = self.attn.forward(&self.norm1.forward(xs)?)?;
        if let Some(ls) = &self.ls1 {
            attn = ls.forward(&attn)?;
        }
        let x = (xs + attn)?;

        let mut mlp = self.mlp.forward(&self.norm2.forward(&x)?)?;
        if let Some(ls) = &self.ls2 {
            mlp = ls.forward(&mlp)?;
        }
        (&x + mlp).map_err(Error::from)
    }
}

/// Headless vision transformer embedder.
pub struct VisionTransformer {
    config: VitConfig,
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    reg_token: Option<Tensor>,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    out_indices: Option<Vec<usize>>,
}

impl VisionTransformer {
    pub fn load(config: VitConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.embed_dim;

        let patch_embed = PatchEmbed::load(&config, vb.pp("patch_embed"))?;
        let cls_token = vb.get((1, 1, d), "cls_token")?;
        let reg_token = if config.reg_tokens > 0 {
            Some(vb.get((1, config.reg_tokens, d), "reg_token")?)
        } else {
            None
        };
        let pos_embed = vb.get((1, config.pos_embed_len(), d), "pos_embed")?;

        let mut blocks = Vec::with_capacity(config.depth);
        for idx in 0..config.depth {
            blocks.push(Block::load(&config, vb.pp(format!("blocks.{idx}")))?);
        }

        let norm = layer_norm(d, config.layer_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            config,
            patch_embed,
            cls_token,
            reg_token,
            pos_embed,
            blocks,
            norm,
            out_indices: None,
        })
    }

    /// Switch the model into feature-extraction mode: forward passes return
    /// the intermediate maps for `indices`, in the given order.
    pub fn with_out_indices(mut self, indices: Vec<usize>) -> Result<Self> {
        if indices.is_empty() {
            return Err(Error::InvalidInput(
                "out_indices must select at least one block".to_string(),
            ));
        }
        if let Some(&bad) = indices.iter().find(|&&idx| idx >= self.config.depth) {
            return Err(Error::InvalidInput(format!(
                "out_index {bad} out of range for depth {}",
                self.config.depth
            )));
        }
        self.out_indices = Some(indices);
        Ok(self)
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    pub fn is_feature_extractor(&self) -> bool {
        self.out_indices.is_some()
    }

    /// Forward computation. Produces a pooled embedding, or the configured
    /// intermediate feature maps in feature-extraction mode.
    pub fn forward(&self, xs: &Tensor) -> Result<ModelOutput> {
        match &self.out_indices {
            Some(indices) => {
                let maps = self.forward_intermediates(xs, indices)?;
                Ok(ModelOutput::FeatureMaps(maps))
            }
            None => Ok(ModelOutput::Embedding(self.forward_pooled(xs)?)),
        }
    }

    /// Final class-token embedding, `[B, embed_dim]`.
    pub fn forward_pooled(&self, xs: &Tensor) -> Result<Tensor> {
        let features = self.forward_features(xs)?;
        features
            .narrow(1, 0, 1)?
            .squeeze(1)
            .map_err(Error::from)
    }

    /// Final normalized token sequence, `[B, prefix + N, embed_dim]`.
    pub fn forward_features(&self, xs: &Tensor) -> Result<Tensor> {
        let (mut x, _, _) = self.embed_tokens(xs)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.norm.forward(&x).map_err(Error::from)
    }

    /// Intermediate spatial maps for `indices`, each `[B, embed_dim, gh, gw]`,
    /// returned in the requested order.
    pub fn forward_intermediates(&self, xs: &Tensor, indices: &[usize]) -> Result<Vec<Tensor>> {
        if let Some(&bad) = indices.iter().find(|&&idx| idx >= self.config.depth) {
            return Err(Error::InvalidInput(format!(
                "out_index {bad} out of range for depth {}",
                self.config.depth
            )));
        }

        let (mut x, gh, gw) = self.embed_tokens(xs)?;
        let wanted: HashSet<usize> = indices.iter().copied().collect();
        let mut captured: HashMap<usize, Tensor> = HashMap::new();

        let last = indices.iter().copied().max().unwrap_or(0);
        for (idx, block) in self.blocks.iter().enumerate() {
            x = block.forward(&x)?;
            if wanted.contains(&idx) {
                captured.insert(idx, x.clone());
            }
            if idx == last && captured.len() == wanted.len() {
                break;
            }
        }

        let prefix = self.config.num_prefix_tokens();
        indices
            .iter()
            .map(|idx| {
                let tokens = &captured[idx];
                let (b, _, d) = tokens.dims3()?;
                let spatial = tokens.narrow(1, prefix, gh * gw)?.contiguous()?;
                spatial
                    .reshape((b, gh, gw, d))?
                    .permute((0, 3, 1, 2))?
                    .contiguous()
                    .map_err(Error::from)
            })
            .collect()
    }

    /// Patchify, position and prepend prefix tokens.
    fn embed_tokens(&self, xs: &Tensor) -> Result<(Tensor, usize, usize)> {
        let (b, c, h, w) = xs.dims4()?;
        let p = self.config.patch_size;

        if c != self.config.in_chans {
            return Err(Error::InvalidInput(format!(
                "expected {} input channels, got {c}",
                self.config.in_chans
            )));
        }
        if h % p != 0 || w % p != 0 {
            return Err(Error::InvalidInput(format!(
                "input {h}x{w} is not a multiple of the patch size {p}"
            )));
        }

        let (gh, gw) = (h / p, w / p);
        let nominal = self.config.grid_size();
        if !self.config.dynamic_img_size && (gh != nominal || gw != nominal) {
            return Err(Error::InvalidInput(format!(
                "input {h}x{w} does not match the trained resolution {0}x{0} \
                 and dynamic image sizing is disabled",
                self.config.img_size
            )));
        }

        let patches = self.patch_embed.forward(xs)?;
        let cls = self.cls_token.expand((b, 1, self.config.embed_dim))?;

        let x = if self.config.embed_class_token {
            // Classic layout: the class slot is part of the positional
            // embedding, so concatenate first and position the whole row.
            let cls_pos = self.pos_embed.narrow(1, 0, 1)?;
            let spatial = self.pos_embed.narrow(1, 1, nominal * nominal)?;
            let spatial = self.positioned_grid(&spatial, gh, gw)?;
            let pos = Tensor::cat(&[&cls_pos, &spatial], 1)?;
            Tensor::cat(&[&cls, &patches], 1)?.broadcast_add(&pos)?
        } else {
            // DINOv2 layout: only patch tokens are positioned; the class and
            // register tokens join afterwards.
            let spatial = self.positioned_grid(&self.pos_embed, gh, gw)?;
            let patches = patches.broadcast_add(&spatial)?;
            match &self.reg_token {
                Some(reg) => {
                    let reg = reg.expand((b, self.config.reg_tokens, self.config.embed_dim))?;
                    Tensor::cat(&[&cls, &reg, &patches], 1)?
                }
                None => Tensor::cat(&[&cls, &patches], 1)?,
            }
        };

        Ok((x, gh, gw))
    }

    /// Spatial positional embedding for a `gh`x`gw` grid, resampled from the
    /// trained grid when they differ.
    fn positioned_grid(&self, spatial: &Tensor, gh: usize, gw: usize) -> Result<Tensor> {
        let g = self.config.grid_size();
        if gh == g && gw == g {
            return Ok(spatial.clone());
        }
        resample_pos_embed(spatial, g, gh, gw)
    }
}

/// Bilinearly resample a `[1, g*g, D]` positional grid to `[1, gh*gw, D]`.
///
/// Separable interpolation expressed as two matmuls against host-built
/// weight matrices, so it runs on whatever device holds the embedding.
fn resample_pos_embed(spatial: &Tensor, g: usize, gh: usize, gw: usize) -> Result<Tensor> {
    let d = spatial.dim(2)?;
    let grid = spatial.contiguous()?.reshape((g, g, d))?;

    let wh = interp_matrix(gh, g, spatial)?;
    let ww = interp_matrix(gw, g, spatial)?;

    // Rows: [g, g*D] -> [gh, g, D]
    let x = grid.reshape((g, g * d))?;
    let x = wh.matmul(&x)?.reshape((gh, g, d))?;

    // Columns: [g, gh*D] -> [gw, gh, D] -> [gh, gw, D]
    let x = x.transpose(0, 1)?.contiguous()?.reshape((g, gh * d))?;
    let x = ww.matmul(&x)?.reshape((gw, gh, d))?;
    let x = x.transpose(0, 1)?.contiguous()?;

    x.reshape((1, gh * gw, d)).map_err(Error::from)
}

/// `[dst, src]` linear-interpolation weights with endpoint alignment.
fn interp_matrix(dst: usize, src: usize, like: &Tensor) -> Result<Tensor> {
    let mut weights = vec![0f32; dst * src];
    for row in 0..dst {
        let pos = if dst > 1 {
            row as f32 * (src - 1) as f32 / (dst - 1) as f32
        } else {
            0.0
        };
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(src - 1);
        let frac = pos - lo as f32;
        weights[row * src + lo] += 1.0 - frac;
        weights[row * src + hi] += frac;
    }

    let w = Tensor::from_vec(weights, (dst, src), like.device())?;
    w.to_dtype(like.dtype()).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tiny_classic() -> VitConfig {
        VitConfig {
            img_size: 16,
            patch_size: 4,
            in_chans: 3,
            embed_dim: 16,
            depth: 2,
            num_heads: 2,
            mlp_ratio: 2,
            reg_tokens: 0,
            init_values: None,
            embed_class_token: true,
            dynamic_img_size: true,
            layer_norm_eps: 1e-6,
        }
    }

    fn tiny_dinov2() -> VitConfig {
        VitConfig {
            reg_tokens: 2,
            init_values: Some(1e-5),
            embed_class_token: false,
            ..tiny_classic()
        }
    }

    fn build(config: VitConfig) -> VisionTransformer {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        VisionTransformer::load(config, vb).unwrap()
    }

    fn image(size: usize) -> Tensor {
        Tensor::zeros((1, 3, size, size), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn pooled_embedding_shape() {
        let model = build(tiny_classic());
        let out = model.forward(&image(16)).unwrap();
        let emb = out.into_embedding().unwrap();
        assert_eq!(emb.dims(), &[1, 16]);
    }

    #[test]
    fn dinov2_layout_forward_works() {
        let model = build(tiny_dinov2());
        let features = model.forward_features(&image(16)).unwrap();
        // 1 cls + 2 reg + 16 patches
        assert_eq!(features.dims(), &[1, 19, 16]);
    }

    #[test]
    fn dynamic_size_accepts_other_resolutions() {
        let model = build(tiny_classic());
        let emb = model.forward_pooled(&image(24)).unwrap();
        assert_eq!(emb.dims(), &[1, 16]);
    }

    #[test]
    fn static_size_rejects_other_resolutions() {
        let mut config = tiny_classic();
        config.dynamic_img_size = false;
        let model = build(config);

        assert!(matches!(
            model.forward_pooled(&image(24)),
            Err(Error::InvalidInput(_))
        ));
        // The nominal resolution still passes.
        assert!(model.forward_pooled(&image(16)).is_ok());
    }

    #[test]
    fn non_multiple_of_patch_is_rejected() {
        let model = build(tiny_classic());
        let xs = Tensor::zeros((1, 3, 18, 18), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward_pooled(&xs),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn intermediates_follow_requested_order() {
        let model = build(tiny_classic()).with_out_indices(vec![1, 0]).unwrap();
        let maps = model.forward(&image(16)).unwrap().into_feature_maps().unwrap();
        assert_eq!(maps.len(), 2);
        for map in &maps {
            assert_eq!(map.dims(), &[1, 16, 4, 4]);
        }
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let err = build(tiny_classic()).with_out_indices(vec![5]);
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn empty_out_indices_is_rejected() {
        let err = build(tiny_classic()).with_out_indices(vec![]);
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn feature_mode_switches_forward_output() {
        let plain = build(tiny_classic());
        assert!(!plain.is_feature_extractor());
        assert!(matches!(
            plain.forward(&image(16)).unwrap(),
            ModelOutput::Embedding(_)
        ));

        let extractor = build(tiny_classic()).with_out_indices(vec![0]).unwrap();
        assert!(extractor.is_feature_extractor());
        assert!(matches!(
            extractor.forward(&image(16)).unwrap(),
            ModelOutput::FeatureMaps(_)
        ));
    }

    #[test]
    fn interp_matrix_rows_sum_to_one() {
        let like = Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap();
        let w = interp_matrix(7, 4, &like).unwrap();
        let sums = w.sum(1).unwrap().to_vec1::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn resample_is_identity_on_same_grid() {
        let spatial = Tensor::rand(0f32, 1f32, (1, 16, 8), &Device::Cpu).unwrap();
        let out = resample_pos_embed(&spatial, 4, 4, 4).unwrap();
        let a = spatial.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
