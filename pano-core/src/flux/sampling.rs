use candle_core::{DType, Device, Result, Tensor, D};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use super::model::{Flux, FluxInput};
use crate::cache::{BlockCache, CacheSchedule};
use crate::PanoramaConfig;

/// Text conditioning for one guidance branch.
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub txt: Tensor,
    pub txt_ids: Tensor,
    pub vec: Tensor,
}

impl Conditioning {
    pub fn new(t5_emb: Tensor, clip_emb: Tensor) -> Result<Self> {
        let (b, seq, _) = t5_emb.dims3()?;
        let txt_ids = Tensor::zeros((b, seq, 3), t5_emb.dtype(), t5_emb.device())?;
        Ok(Self {
            txt: t5_emb,
            txt_ids,
            vec: clip_emb,
        })
    }
}

/// Standard normal latents drawn from a CPU generator, so the same seed
/// gives the same starting point on every backend.
pub fn seeded_noise(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let numel = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_device(device)?
        .to_dtype(dtype)
}

/// `(b, c, h, w)` latents to `(b, h/2 * w/2, c * 4)` patch tokens.
pub fn pack(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    xs.reshape((b, c, h / 2, 2, w / 2, 2))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b, (h / 2) * (w / 2), c * 4))
}

pub fn unpack(xs: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (b, _hw, c_ph_pw) = xs.dims3()?;
    xs.reshape((b, height / 2, width / 2, c_ph_pw / 4, 2, 2))?
        .permute((0, 3, 1, 4, 2, 5))?
        .reshape((b, c_ph_pw / 4, height, width))
}

/// Positional ids `[0, row, col]` for every packed token.
pub fn image_ids(b: usize, height: usize, width: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let (h, w) = (height / 2, width / 2);
    let ids: Vec<f32> = (0..h * w)
        .flat_map(|i| [0., (i / w) as f32, (i % w) as f32])
        .collect();
    Tensor::from_vec(ids, (1, h * w, 3), device)?
        .repeat((b, 1, 1))?
        .to_dtype(dtype)
}

fn time_shift(mu: f64, sigma: f64, t: f64) -> f64 {
    let e = mu.exp();
    e / (e + (1. / t - 1.).powf(sigma))
}

/// `shift` is a triple `(image_seq_len, base_shift, max_shift)`.
pub fn get_schedule(num_steps: usize, shift: Option<(usize, f64, f64)>) -> Vec<f64> {
    let timesteps: Vec<f64> = (0..=num_steps)
        .map(|v| v as f64 / num_steps as f64)
        .rev()
        .collect();
    match shift {
        None => timesteps,
        Some((image_seq_len, y1, y2)) => {
            let (x1, x2) = (256., 4096.);
            let m = (y2 - y1) / (x2 - x1);
            let b = y1 - m * x1;
            let mu = m * image_seq_len as f64 + b;
            timesteps
                .into_iter()
                .map(|v| time_shift(mu, 1., v))
                .collect()
        }
    }
}

/// Linear cross-fade of `a`'s trailing `extent` entries into `b`'s
/// leading ones along `dim`.
fn blend(a: &Tensor, b: &Tensor, extent: usize, dim: D) -> Result<Tensor> {
    let a_len = a.dim(dim)?;
    let b_len = b.dim(dim)?;
    let extent = extent.min(a_len).min(b_len);
    if extent == 0 {
        return Ok(b.clone());
    }
    let ramp: Vec<f32> = (0..extent).map(|x| x as f32 / extent as f32).collect();
    let ramp_shape = match dim {
        D::Minus1 => vec![extent],
        _ => vec![extent, 1],
    };
    let w = Tensor::from_vec(ramp, ramp_shape, b.device())?.to_dtype(b.dtype())?;
    let one_minus_w = w.affine(-1., 1.)?;
    let head = (a.narrow(dim, a_len - extent, extent)?.broadcast_mul(&one_minus_w)?
        + b.narrow(dim, 0, extent)?.broadcast_mul(&w)?)?;
    if extent == b_len {
        return Ok(head);
    }
    Tensor::cat(&[&head, &b.narrow(dim, extent, b_len - extent)?], dim)
}

/// Horizontal blend (last dim).
pub fn blend_h(a: &Tensor, b: &Tensor, extent: usize) -> Result<Tensor> {
    blend(a, b, extent, D::Minus1)
}

/// Vertical blend (second to last dim).
pub fn blend_v(a: &Tensor, b: &Tensor, extent: usize) -> Result<Tensor> {
    blend(a, b, extent, D::Minus2)
}

/// Closes the 360° seam of a canvas whose last dim is `width + extension`.
///
/// The extension continues the picture past its right edge, so it depicts
/// the same place as the leftmost columns. Those columns are faded from the
/// extension into the picture, then the extension is rewritten from them.
pub fn circular_blend(xs: &Tensor, width: usize, extent: usize) -> Result<Tensor> {
    let total = xs.dim(D::Minus1)?;
    let extension = total.saturating_sub(width);
    let extent = extent.min(extension).min(width);
    if extent == 0 {
        return Ok(xs.clone());
    }
    let core = xs.narrow(D::Minus1, 0, width)?;
    let tail = xs.narrow(D::Minus1, width, extent)?;
    let core = blend_h(&tail, &core, extent)?;
    Tensor::cat(&[&core, &core.narrow(D::Minus1, 0, extension)?], D::Minus1)
}

/// Closes the seam of a decoded `(b, c, h, width + extension)` image and
/// crops it to `width` columns.
pub fn close_pixel_seam(decoded: &Tensor, width: usize, extent: usize) -> Result<Tensor> {
    circular_blend(decoded, width, extent)?.narrow(D::Minus1, 0, width)
}

/// Latent geometry of the panorama being denoised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    pub height: usize,
    pub width: usize,
    pub blend: usize,
    pub extension: usize,
    pub shift: usize,
}

impl Canvas {
    pub fn new(config: &PanoramaConfig) -> Self {
        Self::from_latent(
            config.latent_height(),
            config.latent_width(),
            config.blend_extend,
            config.shifting_extend,
        )
    }

    pub fn from_latent(height: usize, width: usize, blend: usize, shift: usize) -> Self {
        Self {
            height,
            width,
            blend,
            // Packing works on 2x2 patches.
            extension: blend.next_multiple_of(2),
            shift,
        }
    }

    pub fn total_width(&self) -> usize {
        self.width + self.extension
    }

    pub fn image_seq_len(&self) -> usize {
        (self.height / 2) * (self.total_width() / 2)
    }

    pub fn wrap_seam(&self, xs: &Tensor) -> Result<Tensor> {
        circular_blend(xs, self.width, self.blend)
    }

    /// Rolls the picture columns by `shift` and re-derives the extension.
    pub fn roll(&self, xs: &Tensor, shift: usize) -> Result<Tensor> {
        let core = xs
            .narrow(D::Minus1, 0, self.width)?
            .roll((shift % self.width) as i32, D::Minus1)?;
        if self.extension == 0 {
            return Ok(core);
        }
        Tensor::cat(&[&core, &core.narrow(D::Minus1, 0, self.extension)?], D::Minus1)
    }
}

/// Guidance settings for one denoising run.
pub struct Guidance<'a> {
    pub cond: &'a Conditioning,
    pub uncond: Option<&'a Conditioning>,
    pub true_cfg_scale: f64,
    pub guidance: f64,
}

impl Guidance<'_> {
    fn uses_true_cfg(&self) -> bool {
        self.uncond.is_some() && self.true_cfg_scale > 1.0
    }
}

/// Euler integration of the flow from noise to image latents on a
/// panorama canvas. Returns unpacked latents of the full canvas.
pub fn denoise(
    model: &Flux,
    canvas: &Canvas,
    latents: &Tensor,
    guidance: &Guidance,
    timesteps: &[f64],
    cache_schedule: Option<&CacheSchedule>,
) -> Result<Tensor> {
    let dev = latents.device().clone();
    let b_sz = latents.dim(0)?;
    let img_ids = image_ids(b_sz, canvas.height, canvas.total_width(), &dev, latents.dtype())?;
    let guidance_vec = Tensor::full(guidance.guidance as f32, b_sz, &dev)?;
    let mut caches = cache_schedule.map(|schedule| {
        let (depth, single_depth) = model.depth();
        (
            BlockCache::new(schedule.clone(), depth, single_depth),
            BlockCache::new(schedule.clone(), depth, single_depth),
        )
    });

    let mut latents = canvas.wrap_seam(latents)?;
    let mut shifted = 0;
    for (step, window) in timesteps.windows(2).enumerate() {
        let (t_curr, t_prev) = (window[0], window[1]);
        if canvas.shift > 0 && step > 0 {
            latents = canvas.roll(&latents, canvas.shift)?;
            shifted = (shifted + canvas.shift) % canvas.width;
        }
        let img = pack(&latents)?;
        let t_vec = Tensor::full(t_curr as f32, b_sz, &dev)?;
        let (cond_cache, uncond_cache) = match caches.as_mut() {
            Some((cond, uncond)) => {
                cond.begin_step(step);
                uncond.begin_step(step);
                (Some(cond), Some(uncond))
            }
            None => (None, None),
        };

        let branch = |cond: &Conditioning, cache: Option<&mut BlockCache>| {
            let input = FluxInput {
                img: &img,
                img_ids: &img_ids,
                txt: &cond.txt,
                txt_ids: &cond.txt_ids,
                timesteps: &t_vec,
                y: &cond.vec,
                guidance: Some(&guidance_vec),
            };
            model.forward(&input, cache)
        };
        let pred = branch(guidance.cond, cond_cache)?;
        let pred = match guidance.uncond {
            Some(uncond) if guidance.uses_true_cfg() => {
                let neg = branch(uncond, uncond_cache)?;
                (&neg + ((pred - &neg)? * guidance.true_cfg_scale)?)?
            }
            _ => pred,
        };

        let img = (img + (pred * (t_prev - t_curr))?)?;
        latents = canvas.wrap_seam(&unpack(&img, canvas.height, canvas.total_width())?)?;
        debug!(step, t = t_curr, "denoising step done");
    }
    if shifted > 0 {
        latents = canvas.roll(&latents, canvas.width - shifted)?;
    }
    Ok(latents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn pack_then_unpack_is_identity() -> Result<()> {
        let xs = Tensor::arange(0f32, 2. * 3. * 4. * 6., &Device::Cpu)?.reshape((1, 2 * 3, 4, 6))?;
        let packed = pack(&xs)?;
        assert_eq!(packed.dims(), &[1, 6, 24]);
        let back = unpack(&packed, 4, 6)?;
        assert_eq!(to_vec(&back), to_vec(&xs));
        Ok(())
    }

    #[test]
    fn image_ids_enumerate_patches() -> Result<()> {
        let ids = image_ids(2, 4, 6, &Device::Cpu, DType::F32)?;
        assert_eq!(ids.dims(), &[2, 6, 3]);
        let first = ids.get(0)?.to_vec2::<f32>()?;
        assert_eq!(first[4], vec![0., 1., 1.]);
        Ok(())
    }

    #[test]
    fn schedule_runs_from_noise_to_image() {
        let plain = get_schedule(4, None);
        assert_eq!(plain, vec![1.0, 0.75, 0.5, 0.25, 0.0]);

        let shifted = get_schedule(50, Some((7380, 0.5, 1.15)));
        assert_eq!(shifted.len(), 51);
        assert_eq!(shifted[0], 1.0);
        assert_eq!(shifted[50], 0.0);
        assert!(shifted.windows(2).all(|w| w[0] > w[1]));
        assert!(shifted[25] > 0.5);
    }

    #[test]
    fn noise_depends_only_on_seed() -> Result<()> {
        let shape = (1, 2, 4, 4);
        let a = seeded_noise(42, shape, &Device::Cpu, DType::F32)?;
        let b = seeded_noise(42, shape, &Device::Cpu, DType::F32)?;
        let c = seeded_noise(7, shape, &Device::Cpu, DType::F32)?;
        assert_eq!(to_vec(&a), to_vec(&b));
        assert_ne!(to_vec(&a), to_vec(&c));
        Ok(())
    }

    #[test]
    fn blend_h_fades_linearly() -> Result<()> {
        let a = Tensor::new(&[[10f32, 10., 10., 10.]], &Device::Cpu)?;
        let b = Tensor::new(&[[0f32, 0., 0., 0., 5.]], &Device::Cpu)?;
        let out = blend_h(&a, &b, 4)?;
        assert_eq!(to_vec(&out), vec![10., 7.5, 5., 2.5, 5.]);

        let out = blend_v(&a.t()?, &b.narrow(1, 0, 4)?.t()?, 2)?;
        assert_eq!(to_vec(&out), vec![10., 5., 0., 0.]);
        Ok(())
    }

    #[test]
    fn circular_blend_closes_the_seam() -> Result<()> {
        // width 4, extension 2: [a b c d | e f]
        let xs = Tensor::new(&[[1f32, 2., 3., 4., 9., 9.]], &Device::Cpu)?;
        let out = circular_blend(&xs, 4, 2)?;
        let v = to_vec(&out);
        assert_eq!(v[0], 9.0);
        assert_eq!(v[1], 0.5 * 9. + 0.5 * 2.);
        assert_eq!(&v[2..4], &[3., 4.]);
        assert_eq!(&v[4..6], &v[0..2]);
        Ok(())
    }

    #[test]
    fn canvas_geometry() {
        let canvas = Canvas::new(&PanoramaConfig::default());
        assert_eq!((canvas.height, canvas.width), (120, 240));
        assert_eq!(canvas.extension, 6);
        assert_eq!(canvas.image_seq_len(), 60 * 123);

        let odd = Canvas::from_latent(8, 16, 3, 0);
        assert_eq!(odd.extension, 4);
    }

    #[test]
    fn roll_keeps_extension_in_sync() -> Result<()> {
        let canvas = Canvas::from_latent(2, 4, 2, 1);
        let xs = Tensor::new(&[[1f32, 2., 3., 4., 1., 2.]], &Device::Cpu)?;
        let rolled = canvas.roll(&xs, 1)?;
        assert_eq!(to_vec(&rolled), vec![4., 1., 2., 3., 4., 1.]);
        let back = canvas.roll(&rolled, canvas.width - 1)?;
        assert_eq!(to_vec(&back), to_vec(&xs));
        Ok(())
    }

    #[test]
    fn pixel_seam_is_closed_and_cropped() -> Result<()> {
        let (h, w, ext) = (16, 8, 2);
        let decoded = Tensor::randn(0f32, 1., (1, 3, h, (w + ext) * 8), &Device::Cpu)?;
        let out = close_pixel_seam(&decoded, w * 8, ext * 8)?;
        assert_eq!(out.dims(), &[1, 3, h, w * 8]);
        // The first column is taken entirely from the extension.
        let first = out.narrow(3, 0, 1)?;
        let wrapped = decoded.narrow(3, w * 8, 1)?;
        assert_eq!(to_vec(&first), to_vec(&wrapped));
        assert_eq!(
            to_vec(&out.narrow(3, ext * 8, w * 8 - ext * 8)?),
            to_vec(&decoded.narrow(3, ext * 8, w * 8 - ext * 8)?)
        );
        Ok(())
    }

    mod denoising {
        use super::*;
        use crate::flux::attention::StandardAttention;
        use crate::flux::linear::GemmPrecision;
        use crate::flux::model::testing::tiny_model;
        use crate::flux::model::Execution;
        use std::collections::BTreeSet;
        use std::sync::Arc;

        fn model() -> Result<Flux> {
            tiny_model(&Execution {
                attention: Arc::new(StandardAttention),
                gemm: GemmPrecision::Full,
            })
        }

        fn conditioning(seed: u64) -> Result<Conditioning> {
            let txt = seeded_noise(seed, (1, 1, 4, 8), &Device::Cpu, DType::F32)?.squeeze(0)?;
            let vec = seeded_noise(seed + 1, (1, 1, 1, 8), &Device::Cpu, DType::F32)?
                .squeeze(0)?
                .squeeze(0)?;
            Conditioning::new(txt, vec)
        }

        fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
            (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
        }

        fn schedule() -> CacheSchedule {
            CacheSchedule {
                no_cache_steps: BTreeSet::from([0, 3]),
                exempt_double: BTreeSet::new(),
                exempt_single: BTreeSet::from([1]),
                start_step: 0,
            }
        }

        fn run(
            model: &Flux,
            canvas: &Canvas,
            seed: u64,
            guidance: &Guidance,
            cache: Option<&CacheSchedule>,
        ) -> Result<Tensor> {
            let noise = seeded_noise(
                seed,
                (1, 2, canvas.height, canvas.total_width()),
                &Device::Cpu,
                DType::F32,
            )?;
            denoise(model, canvas, &noise, guidance, &get_schedule(4, None), cache)
        }

        fn extension_matches_core(canvas: &Canvas, latents: &Tensor) -> Result<()> {
            let core = latents.narrow(D::Minus1, 0, canvas.extension)?;
            let ext = latents.narrow(D::Minus1, canvas.width, canvas.extension)?;
            assert_eq!(to_vec(&core), to_vec(&ext));
            Ok(())
        }

        #[test]
        fn same_seed_gives_same_latents() -> Result<()> {
            let model = model()?;
            let cond = conditioning(3)?;
            let guidance = Guidance {
                cond: &cond,
                uncond: None,
                true_cfg_scale: 0.0,
                guidance: 3.5,
            };
            let canvas = Canvas::from_latent(4, 8, 2, 0);
            let a = run(&model, &canvas, 42, &guidance, None)?;
            let b = run(&model, &canvas, 42, &guidance, None)?;
            let c = run(&model, &canvas, 7, &guidance, None)?;
            assert_eq!(a.dims(), &[1, 2, 4, 10]);
            assert!(max_diff(&a, &b)? < 1e-6);
            assert!(max_diff(&a, &c)? > 1e-3);
            extension_matches_core(&canvas, &a)
        }

        #[test]
        fn cache_keeps_the_canvas_shape() -> Result<()> {
            let model = model()?;
            let cond = conditioning(3)?;
            let uncond = conditioning(11)?;
            let guidance = Guidance {
                cond: &cond,
                uncond: Some(&uncond),
                true_cfg_scale: 2.0,
                guidance: 3.5,
            };
            let canvas = Canvas::from_latent(4, 8, 2, 0);
            let schedule = schedule();
            let plain = run(&model, &canvas, 42, &guidance, None)?;
            let cached = run(&model, &canvas, 42, &guidance, Some(&schedule))?;
            assert_eq!(plain.dims(), cached.dims());
            assert!(to_vec(&cached).iter().all(|v| v.is_finite()));
            extension_matches_core(&canvas, &cached)
        }

        #[test]
        fn true_cfg_uses_the_negative_branch() -> Result<()> {
            let model = model()?;
            let cond = conditioning(3)?;
            let uncond = conditioning(11)?;
            let canvas = Canvas::from_latent(4, 8, 2, 0);
            let guided = |true_cfg_scale| Guidance {
                cond: &cond,
                uncond: Some(&uncond),
                true_cfg_scale,
                guidance: 3.5,
            };
            let off = run(&model, &canvas, 42, &guided(1.0), None)?;
            let without = run(
                &model,
                &canvas,
                42,
                &Guidance {
                    uncond: None,
                    ..guided(1.0)
                },
                None,
            )?;
            let on = run(&model, &canvas, 42, &guided(4.0), None)?;
            assert!(max_diff(&off, &without)? < 1e-6);
            assert!(max_diff(&off, &on)? > 1e-4);
            Ok(())
        }

        #[test]
        fn shifted_canvas_is_rolled_back() -> Result<()> {
            let model = model()?;
            let cond = conditioning(3)?;
            let guidance = Guidance {
                cond: &cond,
                uncond: None,
                true_cfg_scale: 0.0,
                guidance: 3.5,
            };
            let canvas = Canvas::from_latent(4, 8, 2, 3);
            let noise = seeded_noise(42, (1, 2, 4, 10), &Device::Cpu, DType::F32)?;

            // Equal timesteps make every Euler update zero, leaving only the
            // seam blending and the rolls.
            let latents = denoise(&model, &canvas, &noise, &guidance, &[1.0; 4], None)?;
            assert_eq!(latents.dims(), &[1, 2, 4, 10]);
            assert!(max_diff(&latents, &canvas.wrap_seam(&noise)?)? < 1e-5);
            extension_matches_core(&canvas, &latents)?;

            let latents = run(&model, &canvas, 42, &guidance, None)?;
            extension_matches_core(&canvas, &latents)
        }
    }
}
