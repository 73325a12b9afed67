//! Per-tile build pipeline: source triangles in, compressed layer blobs out.

use std::sync::Arc;

use glam::Vec3;

use crate::arena::BuildArena;
use crate::compressor::TileCompressor;
use crate::geometry::WorldGeometry;
use crate::grid::TileGridConfig;
use crate::heightfield::{mark_walkable_triangle, Heightfield};
use crate::layer::{self, TileLayerHeader, LAYER_MAGIC, LAYER_VERSION};
use crate::{Error, Result};

/// Extra arena headroom for triangle area scratch beyond the staged payload.
const TRI_SCRATCH_BYTES: usize = 256 * 1024;

/// One built tile layer, ready for the cache.
#[derive(Debug, Clone)]
pub struct TileBlob {
    pub tx: i32,
    pub ty: i32,
    pub tlayer: i32,
    /// Serialized blob: layer header plus compressed grids
    pub data: Vec<u8>,
    /// Uncompressed grid size in bytes
    pub raw_size: usize,
}

/// Rasterizes tiles of a world into compressed layer blobs.
///
/// The builder owns its scratch arena; build calls reuse it and track the
/// peak memory across the whole build.
pub struct TileBuilder {
    config: TileGridConfig,
    compressor: Arc<dyn TileCompressor>,
    arena: BuildArena,
}

impl TileBuilder {
    pub fn new(config: TileGridConfig, compressor: Arc<dyn TileCompressor>) -> Self {
        let cells = (config.tile_px * config.tile_px) as usize;
        let arena = BuildArena::with_capacity(cells * 3 + TRI_SCRATCH_BYTES);
        Self {
            config,
            compressor,
            arena,
        }
    }

    pub fn config(&self) -> &TileGridConfig {
        &self.config
    }

    /// Peak scratch memory used across all builds, in bytes.
    pub fn high_water(&self) -> usize {
        self.arena.high_water()
    }

    /// Builds every layer of the tile at `(tx, ty)`.
    ///
    /// A tile with no overlapping geometry, or no walkable surface left
    /// after filtering, yields an empty vector. Scratch exhaustion also
    /// degrades to an empty result rather than failing the build.
    pub fn build_tile(
        &mut self,
        geom: &WorldGeometry,
        tx: i32,
        ty: i32,
    ) -> Result<Vec<TileBlob>> {
        if tx < 0 || ty < 0 || tx >= self.config.tile_count_x || ty >= self.config.tile_count_y {
            return Err(Error::Config(format!(
                "tile ({tx},{ty}) lies outside the {}x{} grid",
                self.config.tile_count_x, self.config.tile_count_y
            )));
        }
        let result = self.build_tile_inner(geom, tx, ty);
        self.arena.reset();
        result
    }

    fn build_tile_inner(
        &mut self,
        geom: &WorldGeometry,
        tx: i32,
        ty: i32,
    ) -> Result<Vec<TileBlob>> {
        let cfg = &self.config;
        let (tbmin, tbmax) = cfg.tile_bounds(tx, ty);
        let pad = cfg.border_size as f32 * cfg.cs;
        let bmin = Vec3::new(tbmin.x - pad, cfg.bmin.y, tbmin.z - pad);
        let bmax = Vec3::new(tbmax.x + pad, cfg.bmax.y, tbmax.z + pad);

        let tris = geom.triangles_overlapping_rect([bmin.x, bmin.z], [bmax.x, bmax.z]);
        if tris.is_empty() {
            return Ok(Vec::new());
        }

        let tri_areas = match self.arena.alloc(tris.len()) {
            Some(r) => r,
            None => {
                log::warn!(
                    "tile ({tx},{ty}): scratch arena exhausted on {} triangles, skipping",
                    tris.len()
                );
                return Ok(Vec::new());
            }
        };
        for (i, &t) in tris.iter().enumerate() {
            let [a, b, c] = geom.triangle_verts(t);
            self.arena.slice_mut(tri_areas.clone())[i] =
                mark_walkable_triangle(a, b, c, cfg.walkable_slope_deg);
        }

        let mut hf = Heightfield::new(cfg.tile_px, cfg.tile_px, bmin, bmax, cfg.cs, cfg.ch);
        for (i, &t) in tris.iter().enumerate() {
            let area = self.arena.slice(tri_areas.clone())[i];
            let [a, b, c] = geom.triangle_verts(t);
            hf.rasterize_triangle(a, b, c, area, cfg.walkable_climb);
        }
        if hf.span_count() == 0 {
            return Ok(Vec::new());
        }

        hf.filter_low_hanging_walkable_obstacles(cfg.walkable_climb);
        hf.filter_ledge_spans(cfg.walkable_height, cfg.walkable_climb);
        hf.filter_walkable_low_height_spans(cfg.walkable_height);

        let layers = hf.build_layers(cfg.walkable_climb, cfg.max_layers_per_tile as usize);

        let border = cfg.border_size;
        let interior_max = cfg.tile_px - 1 - border;
        let mut blobs = Vec::with_capacity(layers.len());
        for (layer_idx, mut hl) in layers.into_iter().enumerate() {
            hl.erode_walkable_area(cfg.walkable_radius);
            for volume in geom.volumes() {
                hl.mark_volume(bmin, cfg.cs, cfg.ch, volume);
            }

            let Some((dminx, dmaxx, dminz, dmaxz)) = hl.data_bounds() else {
                continue;
            };
            // Usable data is the border-trimmed interior.
            let minx = dminx.max(border);
            let maxx = dmaxx.min(interior_max);
            let miny = dminz.max(border);
            let maxy = dmaxz.min(interior_max);
            if minx > maxx || miny > maxy {
                continue;
            }

            let header = TileLayerHeader {
                magic: LAYER_MAGIC,
                version: LAYER_VERSION,
                tx,
                ty,
                tlayer: layer_idx as i32,
                bmin: [bmin.x, bmin.y + hl.hmin as f32 * cfg.ch, bmin.z],
                bmax: [bmax.x, bmin.y + hl.hmax as f32 * cfg.ch, bmax.z],
                hmin: hl.hmin,
                hmax: hl.hmax,
                width: cfg.tile_px as u8,
                height: cfg.tile_px as u8,
                minx: minx as u8,
                maxx: maxx as u8,
                miny: miny as u8,
                maxy: maxy as u8,
            };

            let n = header.cell_count();
            let staged = match self.arena.alloc(n * 3) {
                Some(r) => r,
                None => {
                    log::warn!("tile ({tx},{ty}): scratch arena exhausted staging layer {layer_idx}, skipping");
                    return Ok(Vec::new());
                }
            };
            {
                let dst = self.arena.slice_mut(staged.clone());
                dst[0..n].copy_from_slice(&hl.heights);
                dst[n..n * 2].copy_from_slice(&hl.areas);
                dst[n * 2..n * 3].copy_from_slice(&hl.cons);
            }
            let data = layer::encode_layer(&header, self.arena.slice(staged), &*self.compressor)?;

            log::debug!(
                "tile ({tx},{ty}) layer {layer_idx}: {} -> {} bytes",
                n * 3,
                data.len()
            );
            blobs.push(TileBlob {
                tx,
                ty,
                tlayer: layer_idx as i32,
                data,
                raw_size: n * 3,
            });
        }

        Ok(blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Lz4Compressor;
    use crate::grid::TileGridParams;

    fn flat_world(extent: f32) -> WorldGeometry {
        let verts = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(extent, 0.0, 0.0),
            Vec3::new(extent, 0.0, extent),
            Vec3::new(0.0, 0.0, extent),
        ];
        WorldGeometry::new(verts, vec![[0, 2, 1], [0, 3, 2]]).unwrap()
    }

    fn builder_for(bmax_xz: f32) -> TileBuilder {
        let params = TileGridParams {
            bmin: Vec3::new(0.0, -1.0, 0.0),
            bmax: Vec3::new(bmax_xz, 2.0, bmax_xz),
            ..Default::default()
        };
        let config = TileGridConfig::configure(&params).unwrap();
        TileBuilder::new(config, Arc::new(Lz4Compressor))
    }

    #[test]
    fn test_build_flat_tile() {
        let geom = flat_world(30.0);
        let mut builder = builder_for(30.0);
        let blobs = builder.build_tile(&geom, 0, 0).unwrap();
        assert_eq!(blobs.len(), 1);

        let blob = &blobs[0];
        let layer = layer::decode_layer(&blob.data, &Lz4Compressor).unwrap();
        assert_eq!(layer.header.tx, 0);
        assert_eq!(layer.header.ty, 0);
        assert_eq!(layer.header.tlayer, 0);
        assert!(layer.areas.iter().any(|&a| a == crate::AREA_WALKABLE));
        assert!(blob.raw_size > blob.data.len());
    }

    #[test]
    fn test_empty_tile_yields_no_blobs() {
        // Geometry only covers the first tile; the far corner is empty.
        let geom = flat_world(10.0);
        let mut builder = builder_for(60.0);
        let last = builder.config().tile_count_x - 1;
        let blobs = builder.build_tile(&geom, last, last).unwrap();
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_out_of_grid_tile_is_an_error() {
        let geom = flat_world(30.0);
        let mut builder = builder_for(30.0);
        assert!(builder.build_tile(&geom, -1, 0).is_err());
        assert!(builder.build_tile(&geom, 99, 0).is_err());
    }

    #[test]
    fn test_high_water_accumulates() {
        let geom = flat_world(30.0);
        let mut builder = builder_for(30.0);
        assert_eq!(builder.high_water(), 0);
        builder.build_tile(&geom, 0, 0).unwrap();
        assert!(builder.high_water() > 0);
    }

    #[test]
    fn test_volume_reaches_blob() {
        let mut geom = flat_world(30.0);
        geom.add_area_volume(crate::geometry::AreaVolume::from_box(
            Vec3::new(2.0, -2.0, 2.0),
            Vec3::new(8.0, 2.0, 8.0),
            crate::AREA_WATER,
        ));
        let mut builder = builder_for(30.0);
        let blobs = builder.build_tile(&geom, 0, 0).unwrap();
        let layer = layer::decode_layer(&blobs[0].data, &Lz4Compressor).unwrap();
        assert!(layer.areas.iter().any(|&a| a == crate::AREA_WATER));
    }

    #[test]
    fn test_deterministic_blobs() {
        let geom = flat_world(30.0);
        let mut builder = builder_for(30.0);
        let a = builder.build_tile(&geom, 0, 0).unwrap();
        let b = builder.build_tile(&geom, 0, 0).unwrap();
        assert_eq!(a[0].data, b[0].data);
    }
}
