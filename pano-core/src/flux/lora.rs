//! Low-rank adapter fusion into FLUX transformer weights.
//!
//! Adapters are merged into the base weights before the transformer is
//! built: `W' = W + strength * (alpha / rank) * (up @ down)`. Diffusers,
//! PEFT and Kohya key layouts are mapped onto the native parameter names,
//! including the row ranges of the fused `qkv` and `linear1` projections.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use super::model::Config;
use crate::PanoramaError;

#[derive(Debug)]
pub struct LoraPair {
    /// `(rank, in_features)`
    pub down: Tensor,
    /// `(out_features, rank)`
    pub up: Tensor,
    pub alpha: Option<f32>,
}

impl LoraPair {
    pub fn rank(&self) -> Result<usize> {
        Ok(self.down.dim(0)?)
    }

    fn scale(&self, strength: f32) -> Result<f64> {
        let rank = self.rank()? as f64;
        let alpha = self.alpha.map_or(rank, f64::from);
        Ok(f64::from(strength) * alpha / rank)
    }
}

/// Adapter weights keyed by the module path they modify.
#[derive(Debug)]
pub struct LoraAdapter {
    pub name: String,
    pub pairs: HashMap<String, LoraPair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

fn split_key(key: &str) -> Option<(&str, Part)> {
    if let Some(base) = key.strip_suffix(".alpha") {
        return Some((base, Part::Alpha));
    }
    let (base, rest) = key.split_once(".lora_")?;
    let part = if rest.starts_with('A') || rest.starts_with("down") {
        Part::Down
    } else if rest.starts_with('B') || rest.starts_with("up") {
        Part::Up
    } else {
        return None;
    };
    Some((base, part))
}

const KOHYA_TOP_LEVEL: &[(&str, &str)] = &[
    ("img_in", "img_in"),
    ("txt_in", "txt_in"),
    ("time_in_in_layer", "time_in.in_layer"),
    ("time_in_out_layer", "time_in.out_layer"),
    ("vector_in_in_layer", "vector_in.in_layer"),
    ("vector_in_out_layer", "vector_in.out_layer"),
    ("guidance_in_in_layer", "guidance_in.in_layer"),
    ("guidance_in_out_layer", "guidance_in.out_layer"),
    ("final_layer_linear", "final_layer.linear"),
    ("final_layer_adaLN_modulation_1", "final_layer.adaLN_modulation.1"),
];

/// Strips wrapper prefixes and rewrites Kohya's underscore paths as dotted ones.
pub fn module_path(base: &str) -> String {
    let mut base = base;
    for prefix in ["base_model.model.", "transformer.", "diffusion_model.", "model."] {
        base = base.strip_prefix(prefix).unwrap_or(base);
    }
    let Some(kohya) = base.strip_prefix("lora_unet_") else {
        return base.to_string();
    };
    for block in ["double_blocks_", "single_blocks_"] {
        if let Some(rest) = kohya.strip_prefix(block) {
            if let Some((idx, layer)) = rest.split_once('_') {
                let layer = match layer.rsplit_once('_') {
                    Some((head, tail)) => format!("{head}.{tail}"),
                    None => layer.to_string(),
                };
                return format!("{}.{idx}.{layer}", block.trim_end_matches('_'));
            }
        }
    }
    KOHYA_TOP_LEVEL
        .iter()
        .find(|(from, _)| *from == kohya)
        .map_or_else(|| kohya.to_string(), |(_, to)| to.to_string())
}

impl LoraAdapter {
    pub fn load(path: &Path, name: &str) -> Result<Self> {
        info!(path = %path.display(), "loading adapter");
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("failed to read adapter {}", path.display()))?;
        Self::from_tensors(name, tensors)
    }

    pub fn from_tensors(name: &str, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut downs = HashMap::new();
        let mut ups = HashMap::new();
        let mut alphas = HashMap::new();
        for (key, tensor) in tensors {
            let Some((base, part)) = split_key(&key) else {
                debug!(key, "skipping non-adapter tensor");
                continue;
            };
            let module = module_path(base);
            match part {
                Part::Down => {
                    downs.insert(module, tensor);
                }
                Part::Up => {
                    ups.insert(module, tensor);
                }
                Part::Alpha => {
                    let alpha = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                    if let Some(&alpha) = alpha.first() {
                        alphas.insert(module, alpha);
                    }
                }
            }
        }

        let mut pairs = HashMap::new();
        for (module, down) in downs {
            let Some(up) = ups.remove(&module) else {
                warn!(module, "adapter down projection without up projection");
                continue;
            };
            let alpha = alphas.get(&module).copied();
            pairs.insert(module, LoraPair { down, up, alpha });
        }
        for module in ups.keys() {
            warn!(module, "adapter up projection without down projection");
        }
        info!(adapter = name, pairs = pairs.len(), "adapter loaded");
        Ok(Self {
            name: name.to_string(),
            pairs,
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// The base parameter an adapter module updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseTarget {
    pub weight: String,
    /// `(offset, len)` of the output rows covered, for fused projections.
    pub rows: Option<(usize, usize)>,
    /// Diffusers orders the final modulation as `(scale, shift)`, the
    /// native layout is `(shift, scale)`.
    pub swap_halves: bool,
}

impl FuseTarget {
    fn whole(module: impl Into<String>) -> Self {
        Self {
            weight: format!("{}.weight", module.into()),
            rows: None,
            swap_halves: false,
        }
    }

    fn rows(module: impl Into<String>, offset: usize, len: usize) -> Self {
        Self {
            rows: Some((offset, len)),
            ..Self::whole(module)
        }
    }
}

pub fn fuse_target(module: &str, cfg: &Config) -> Option<FuseTarget> {
    let h = cfg.hidden_size;
    if let Some(rest) = module.strip_prefix("transformer_blocks.") {
        let (idx, layer) = rest.split_once('.')?;
        let idx: usize = idx.parse().ok()?;
        let p = format!("double_blocks.{idx}");
        let target = match layer {
            "attn.to_q" => FuseTarget::rows(format!("{p}.img_attn.qkv"), 0, h),
            "attn.to_k" => FuseTarget::rows(format!("{p}.img_attn.qkv"), h, h),
            "attn.to_v" => FuseTarget::rows(format!("{p}.img_attn.qkv"), 2 * h, h),
            "attn.add_q_proj" => FuseTarget::rows(format!("{p}.txt_attn.qkv"), 0, h),
            "attn.add_k_proj" => FuseTarget::rows(format!("{p}.txt_attn.qkv"), h, h),
            "attn.add_v_proj" => FuseTarget::rows(format!("{p}.txt_attn.qkv"), 2 * h, h),
            "attn.to_out.0" => FuseTarget::whole(format!("{p}.img_attn.proj")),
            "attn.to_add_out" => FuseTarget::whole(format!("{p}.txt_attn.proj")),
            "ff.net.0.proj" => FuseTarget::whole(format!("{p}.img_mlp.0")),
            "ff.net.2" => FuseTarget::whole(format!("{p}.img_mlp.2")),
            "ff_context.net.0.proj" => FuseTarget::whole(format!("{p}.txt_mlp.0")),
            "ff_context.net.2" => FuseTarget::whole(format!("{p}.txt_mlp.2")),
            "norm1.linear" => FuseTarget::whole(format!("{p}.img_mod.lin")),
            "norm1_context.linear" => FuseTarget::whole(format!("{p}.txt_mod.lin")),
            _ => return None,
        };
        return Some(target);
    }
    if let Some(rest) = module.strip_prefix("single_transformer_blocks.") {
        let (idx, layer) = rest.split_once('.')?;
        let idx: usize = idx.parse().ok()?;
        let p = format!("single_blocks.{idx}");
        let target = match layer {
            "attn.to_q" => FuseTarget::rows(format!("{p}.linear1"), 0, h),
            "attn.to_k" => FuseTarget::rows(format!("{p}.linear1"), h, h),
            "attn.to_v" => FuseTarget::rows(format!("{p}.linear1"), 2 * h, h),
            "proj_mlp" => FuseTarget::rows(format!("{p}.linear1"), 3 * h, cfg.mlp_size()),
            "proj_out" => FuseTarget::whole(format!("{p}.linear2")),
            "norm.linear" => FuseTarget::whole(format!("{p}.modulation.lin")),
            _ => return None,
        };
        return Some(target);
    }
    let target = match module {
        "x_embedder" => FuseTarget::whole("img_in"),
        "context_embedder" => FuseTarget::whole("txt_in"),
        "time_text_embed.timestep_embedder.linear_1" => FuseTarget::whole("time_in.in_layer"),
        "time_text_embed.timestep_embedder.linear_2" => FuseTarget::whole("time_in.out_layer"),
        "time_text_embed.guidance_embedder.linear_1" => FuseTarget::whole("guidance_in.in_layer"),
        "time_text_embed.guidance_embedder.linear_2" => FuseTarget::whole("guidance_in.out_layer"),
        "time_text_embed.text_embedder.linear_1" => FuseTarget::whole("vector_in.in_layer"),
        "time_text_embed.text_embedder.linear_2" => FuseTarget::whole("vector_in.out_layer"),
        "proj_out" => FuseTarget::whole("final_layer.linear"),
        "norm_out.linear" => FuseTarget {
            swap_halves: true,
            ..FuseTarget::whole("final_layer.adaLN_modulation.1")
        },
        // Already in native layout.
        other => FuseTarget::whole(other),
    };
    Some(target)
}

fn swap_halves(xs: &Tensor) -> Result<Tensor> {
    let n = xs.dim(0)? / 2;
    Ok(Tensor::cat(&[xs.narrow(0, n, n)?, xs.narrow(0, 0, n)?], 0)?)
}

/// Merges `adapter` into `weights` and drops it. Returns the number of
/// parameters updated.
pub fn fuse_into(
    weights: &mut HashMap<String, Tensor>,
    adapter: LoraAdapter,
    cfg: &Config,
    strength: f32,
) -> Result<usize> {
    let LoraAdapter { name, pairs } = adapter;
    let mut fused = 0;
    for (module, pair) in pairs {
        let Some(target) = fuse_target(&module, cfg) else {
            warn!(module, "adapter module has no transformer counterpart");
            continue;
        };
        let Some(weight) = weights.get(&target.weight) else {
            warn!(module, weight = target.weight, "adapter targets a missing parameter");
            continue;
        };
        let delta = (pair.up.to_dtype(DType::F32)?.matmul(&pair.down.to_dtype(DType::F32)?)?
            * pair.scale(strength)?)?;
        let delta = if target.swap_halves {
            swap_halves(&delta)?
        } else {
            delta
        };

        let dtype = weight.dtype();
        let w = weight.to_dtype(DType::F32)?;
        let updated = match target.rows {
            None => (w + delta).with_context(|| format!("adapter shape mismatch for {module}"))?,
            Some((offset, len)) => {
                if delta.dim(0)? != len {
                    bail!(
                        "adapter {module} produces {} rows, expected {len}",
                        delta.dim(0)?
                    );
                }
                let cols = w.dim(1)?;
                let rows = (w.narrow(0, offset, len)? + delta)
                    .with_context(|| format!("adapter shape mismatch for {module}"))?;
                w.slice_assign(&[offset..offset + len, 0..cols], &rows)?
            }
        };
        weights.insert(target.weight, updated.to_dtype(dtype)?);
        fused += 1;
    }
    if fused == 0 {
        return Err(PanoramaError::AdapterMismatch(name).into());
    }
    info!(adapter = name, fused, "adapter fused into transformer weights");
    Ok(fused)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Config {
        Config {
            hidden_size: 4,
            mlp_ratio: 2.0,
            ..Config::dev()
        }
    }

    fn pair_tensors(base: &str, down: &[f32], up: &[f32]) -> Vec<(String, Tensor)> {
        let dev = Device::Cpu;
        vec![
            (
                format!("{base}.lora_A.weight"),
                Tensor::from_slice(down, (1, down.len()), &dev).unwrap(),
            ),
            (
                format!("{base}.lora_B.weight"),
                Tensor::from_slice(up, (up.len(), 1), &dev).unwrap(),
            ),
        ]
    }

    #[test]
    fn maps_kohya_and_prefixed_keys() {
        assert_eq!(
            module_path("lora_unet_double_blocks_0_img_attn_qkv"),
            "double_blocks.0.img_attn.qkv"
        );
        assert_eq!(module_path("lora_unet_single_blocks_12_linear1"), "single_blocks.12.linear1");
        assert_eq!(
            module_path("lora_unet_single_blocks_3_modulation_lin"),
            "single_blocks.3.modulation.lin"
        );
        assert_eq!(module_path("lora_unet_final_layer_linear"), "final_layer.linear");
        assert_eq!(
            module_path("transformer.single_transformer_blocks.2.proj_out"),
            "single_transformer_blocks.2.proj_out"
        );
        assert_eq!(module_path("diffusion_model.img_in"), "img_in");
        assert_eq!(
            split_key("x.lora_A.default.weight"),
            Some(("x", Part::Down))
        );
        assert_eq!(split_key("x.lora_up.weight"), Some(("x", Part::Up)));
        assert_eq!(split_key("x.alpha"), Some(("x", Part::Alpha)));
        assert_eq!(split_key("x.weight"), None);
    }

    #[test]
    fn maps_diffusers_modules_to_fused_rows() {
        let cfg = tiny();
        let t = fuse_target("single_transformer_blocks.1.proj_mlp", &cfg).unwrap();
        assert_eq!(t.weight, "single_blocks.1.linear1.weight");
        assert_eq!(t.rows, Some((12, 8)));
        let t = fuse_target("transformer_blocks.0.attn.add_v_proj", &cfg).unwrap();
        assert_eq!(t.weight, "double_blocks.0.txt_attn.qkv.weight");
        assert_eq!(t.rows, Some((8, 4)));
        assert!(fuse_target("transformer_blocks.x.attn.to_q", &cfg).is_none());
        assert!(fuse_target("norm_out.linear", &cfg).unwrap().swap_halves);
    }

    #[test]
    fn fuses_row_slices_and_scales_by_alpha() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny();
        let mut weights = HashMap::new();
        weights.insert(
            "double_blocks.0.img_attn.qkv.weight".to_string(),
            Tensor::zeros((12, 4), DType::F32, &dev)?,
        );
        weights.insert(
            "single_blocks.0.linear2.weight".to_string(),
            Tensor::zeros((4, 12), DType::F32, &dev)?,
        );

        let mut tensors: HashMap<String, Tensor> =
            pair_tensors("transformer.transformer_blocks.0.attn.to_k", &[1.; 4], &[2.; 4])
                .into_iter()
                .collect();
        tensors.insert(
            "lora_unet_single_blocks_0_linear2.lora_down.weight".to_string(),
            Tensor::ones((1, 12), DType::F32, &dev)?,
        );
        tensors.insert(
            "lora_unet_single_blocks_0_linear2.lora_up.weight".to_string(),
            Tensor::ones((4, 1), DType::F32, &dev)?,
        );
        tensors.insert(
            "lora_unet_single_blocks_0_linear2.alpha".to_string(),
            Tensor::new(0.5f32, &dev)?,
        );
        let adapter = LoraAdapter::from_tensors("test", tensors)?;
        assert_eq!(adapter.len(), 2);

        let fused = fuse_into(&mut weights, adapter, &cfg, 1.0)?;
        assert_eq!(fused, 2);

        let qkv = weights["double_blocks.0.img_attn.qkv.weight"].to_vec2::<f32>()?;
        assert!(qkv[..4].iter().flatten().all(|&v| v == 0.0));
        assert!(qkv[4..8].iter().flatten().all(|&v| v == 2.0));
        assert!(qkv[8..].iter().flatten().all(|&v| v == 0.0));

        let linear2 = weights["single_blocks.0.linear2.weight"].to_vec2::<f32>()?;
        assert!(linear2.iter().flatten().all(|&v| v == 0.5));
        Ok(())
    }

    #[test]
    fn final_modulation_halves_are_swapped() -> Result<()> {
        let dev = Device::Cpu;
        let mut weights = HashMap::new();
        weights.insert(
            "final_layer.adaLN_modulation.1.weight".to_string(),
            Tensor::zeros((4, 2), DType::F32, &dev)?,
        );
        let tensors = pair_tensors("norm_out.linear", &[1., 1.], &[1., 1., 3., 3.])
            .into_iter()
            .collect();
        let adapter = LoraAdapter::from_tensors("test", tensors)?;
        fuse_into(&mut weights, adapter, &tiny(), 1.0)?;
        let w = weights["final_layer.adaLN_modulation.1.weight"].to_vec2::<f32>()?;
        assert_eq!(w[0], vec![3., 3.]);
        assert_eq!(w[3], vec![1., 1.]);
        Ok(())
    }

    #[test]
    fn unmatched_adapter_is_rejected() -> Result<()> {
        let mut weights = HashMap::new();
        let tensors = pair_tensors("transformer_blocks.0.attn.to_q", &[1.; 4], &[1.; 4])
            .into_iter()
            .collect();
        let adapter = LoraAdapter::from_tensors("stray", tensors)?;
        let err = fuse_into(&mut weights, adapter, &tiny(), 1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PanoramaError>(),
            Some(PanoramaError::AdapterMismatch(name)) if name == "stray"
        ));
        Ok(())
    }
}
