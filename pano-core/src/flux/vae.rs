use candle_core::{Result, Tensor};
use candle_transformers::models::flux::autoencoder::AutoEncoder;
use tracing::debug;

use super::sampling::{blend_h, blend_v};
use crate::TiledDecode;

pub fn decode(autoencoder: &AutoEncoder, latents: &Tensor, tiling: Option<TiledDecode>) -> Result<Tensor> {
    match tiling {
        Some(tiling) => tiled_decode(|z| autoencoder.decode(z), latents, tiling),
        None => autoencoder.decode(latents),
    }
}

/// Decodes `(b, c, h, w)` latents in overlapping tiles and cross-fades the
/// seams, bounding peak memory to one tile.
pub fn tiled_decode<F>(decode: F, latents: &Tensor, tiling: TiledDecode) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let (_, _, h, w) = latents.dims4()?;
    let TiledDecode { tile_size, overlap } = tiling;
    if h <= tile_size && w <= tile_size {
        return decode(latents);
    }
    let stride = tile_size.saturating_sub(overlap).max(1);

    let mut rows = Vec::new();
    for i in (0..h).step_by(stride) {
        let mut row = Vec::new();
        for j in (0..w).step_by(stride) {
            let tile = latents
                .narrow(2, i, tile_size.min(h - i))?
                .narrow(3, j, tile_size.min(w - j))?;
            row.push(decode(&tile)?);
        }
        rows.push(row);
    }
    let upscale = rows[0][0].dim(2)? / tile_size.min(h);
    let blend_extent = overlap * upscale;
    let row_limit = stride * upscale;
    debug!(
        rows = rows.len(),
        cols = rows[0].len(),
        upscale,
        "decoded latent tiles"
    );

    let mut out_rows = Vec::with_capacity(rows.len());
    for i in 0..rows.len() {
        let mut out_row = Vec::with_capacity(rows[i].len());
        for j in 0..rows[i].len() {
            let mut tile = rows[i][j].clone();
            if i > 0 {
                tile = blend_v(&rows[i - 1][j], &tile, blend_extent)?;
            }
            if j > 0 {
                tile = blend_h(&rows[i][j - 1], &tile, blend_extent)?;
            }
            rows[i][j] = tile.clone();
            let th = tile.dim(2)?.min(row_limit);
            let tw = tile.dim(3)?.min(row_limit);
            out_row.push(tile.narrow(2, 0, th)?.narrow(3, 0, tw)?);
        }
        out_rows.push(Tensor::cat(&out_row, 3)?);
    }
    Tensor::cat(&out_rows, 2)
}
