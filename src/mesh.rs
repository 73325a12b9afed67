//! Walkable navigation mesh tiles derived from cached layers.
//!
//! Polygonization here is intentionally simple: walkable cells of a layer
//! are merged into maximal axis-aligned rectangles of uniform area and
//! height. The resulting quads carry area ids and traversal flags assigned
//! by a pluggable [`MeshProcess`] before they are committed to the mesh.

use std::collections::HashMap;

use glam::Vec3;

use crate::grid::TileGridConfig;
use crate::heightfield::NO_HEIGHT;
use crate::layer::TileLayer;
use crate::{
    Error, Result, AREA_GATE, AREA_GRASS, AREA_NULL, AREA_ROAD, AREA_SAND, AREA_WALKABLE,
    AREA_WATER, FLAG_ALL_PLAYERS, FLAG_FLOAT, FLAG_WALK,
};

/// Post-processing hook applied to polygon areas and flags after
/// polygonization and before the tile enters the mesh.
pub trait MeshProcess: Send + Sync {
    fn process(&self, areas: &mut [u8], flags: &mut [u16]);
}

/// Standard area-to-flag mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMeshProcess;

impl MeshProcess for DefaultMeshProcess {
    fn process(&self, areas: &mut [u8], flags: &mut [u16]) {
        for (area, flag) in areas.iter_mut().zip(flags.iter_mut()) {
            if *area == AREA_WALKABLE {
                *area = AREA_GRASS;
            }
            *flag = match *area {
                AREA_GRASS | AREA_SAND | AREA_ROAD => FLAG_WALK,
                AREA_WATER => FLAG_FLOAT,
                AREA_GATE => FLAG_WALK | FLAG_ALL_PLAYERS,
                _ => 0,
            };
        }
    }
}

/// One walkable polygon, a horizontal quad in world space.
#[derive(Debug, Clone, PartialEq)]
pub struct NavPoly {
    pub verts: [Vec3; 4],
    pub area: u8,
    pub flags: u16,
}

/// Polygons of one tile layer position.
#[derive(Debug, Clone, PartialEq)]
pub struct NavMeshTile {
    pub tx: i32,
    pub ty: i32,
    pub tlayer: i32,
    pub polys: Vec<NavPoly>,
}

/// Parameters fixing the mesh's tile grid and reference capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct NavMeshParams {
    pub origin: Vec3,
    pub tile_width: f32,
    pub tile_height: f32,
    pub max_tiles: i32,
    pub max_polys_per_tile: i32,
}

/// Tile-addressed store of walkable polygons.
///
/// Polygon references pack a tile slot and a polygon index into 22 bits;
/// the split is fixed at construction and matches the owning tile cache.
pub struct NavMesh {
    params: NavMeshParams,
    tile_index_bits: u32,
    poly_index_bits: u32,
    tiles: Vec<Option<NavMeshTile>>,
    free: Vec<usize>,
    lookup: HashMap<(i32, i32, i32), usize>,
}

impl NavMesh {
    pub fn new(params: NavMeshParams, tile_index_bits: u32, poly_index_bits: u32) -> Result<Self> {
        if tile_index_bits + poly_index_bits != 22 {
            return Err(Error::Config(format!(
                "reference split {tile_index_bits}+{poly_index_bits} must total 22 bits"
            )));
        }
        if params.max_tiles <= 0 || params.max_tiles > (1 << tile_index_bits) {
            return Err(Error::Config(format!(
                "max tiles {} does not fit {} tile index bits",
                params.max_tiles, tile_index_bits
            )));
        }
        let max_tiles = params.max_tiles as usize;
        Ok(Self {
            params,
            tile_index_bits,
            poly_index_bits,
            tiles: vec![None; max_tiles],
            free: (0..max_tiles).rev().collect(),
            lookup: HashMap::new(),
        })
    }

    /// Builds an empty mesh sized for a tile grid, sharing its reference
    /// split.
    pub fn for_grid(config: &TileGridConfig) -> Result<Self> {
        Self::new(
            NavMeshParams {
                origin: config.bmin,
                tile_width: config.tile_world_size,
                tile_height: config.tile_world_size,
                max_tiles: config.max_tiles,
                max_polys_per_tile: config.max_polys_per_tile,
            },
            config.tile_index_bits,
            config.poly_index_bits,
        )
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    /// Inserts a tile, replacing any existing tile at the same position.
    pub fn add_tile(&mut self, tile: NavMeshTile) -> Result<()> {
        let key = (tile.tx, tile.ty, tile.tlayer);
        if let Some(&slot) = self.lookup.get(&key) {
            self.tiles[slot] = Some(tile);
            return Ok(());
        }
        let slot = self
            .free
            .pop()
            .ok_or_else(|| Error::Capacity("navigation mesh tile table is full".to_string()))?;
        self.tiles[slot] = Some(tile);
        self.lookup.insert(key, slot);
        Ok(())
    }

    /// Removes the tile at the position. Returns false when absent.
    pub fn remove_tile_at(&mut self, tx: i32, ty: i32, tlayer: i32) -> bool {
        match self.lookup.remove(&(tx, ty, tlayer)) {
            Some(slot) => {
                self.tiles[slot] = None;
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    pub fn tile_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<&NavMeshTile> {
        self.lookup
            .get(&(tx, ty, tlayer))
            .and_then(|&slot| self.tiles[slot].as_ref())
    }

    /// All layer tiles at a grid position, ordered by layer.
    pub fn tiles_at(&self, tx: i32, ty: i32) -> Vec<&NavMeshTile> {
        let mut slots: Vec<(i32, usize)> = self
            .lookup
            .iter()
            .filter(|((x, y, _), _)| *x == tx && *y == ty)
            .map(|((_, _, layer), &slot)| (*layer, slot))
            .collect();
        slots.sort_unstable_by_key(|&(layer, _)| layer);
        slots
            .into_iter()
            .filter_map(|(_, slot)| self.tiles[slot].as_ref())
            .collect()
    }

    pub fn tile_count(&self) -> usize {
        self.lookup.len()
    }

    pub fn poly_count(&self) -> usize {
        self.tiles
            .iter()
            .flatten()
            .map(|t| t.polys.len())
            .sum()
    }

    /// Packs a tile slot and polygon index into a 22-bit reference.
    pub fn encode_poly_ref(&self, tile_slot: u32, poly_index: u32) -> u32 {
        (tile_slot << self.poly_index_bits) | poly_index
    }

    /// Splits a 22-bit reference into tile slot and polygon index.
    pub fn decode_poly_ref(&self, poly_ref: u32) -> (u32, u32) {
        let poly_mask = (1u32 << self.poly_index_bits) - 1;
        let tile_mask = (1u32 << self.tile_index_bits) - 1;
        ((poly_ref >> self.poly_index_bits) & tile_mask, poly_ref & poly_mask)
    }

    /// References of every polygon in the tile at the position.
    pub fn poly_refs_at(&self, tx: i32, ty: i32, tlayer: i32) -> Vec<u32> {
        let Some(&slot) = self.lookup.get(&(tx, ty, tlayer)) else {
            return Vec::new();
        };
        let Some(tile) = self.tiles[slot].as_ref() else {
            return Vec::new();
        };
        (0..tile.polys.len() as u32)
            .map(|p| self.encode_poly_ref(slot as u32, p))
            .collect()
    }
}

/// Derives a tile's polygons from a decoded layer.
///
/// Walkable cells of uniform area and height merge greedily into
/// rectangles, capped at `max_polys`. `process` assigns the final areas
/// and flags.
pub fn build_tile_polys(
    layer: &TileLayer,
    cs: f32,
    ch: f32,
    max_polys: i32,
    process: &dyn MeshProcess,
) -> NavMeshTile {
    let header = &layer.header;
    let w = header.width as i32;
    let minx = header.minx as i32;
    let maxx = header.maxx as i32;
    let miny = header.miny as i32;
    let maxy = header.maxy as i32;

    let mut visited = vec![false; layer.heights.len()];
    let mut rects: Vec<(i32, i32, i32, i32, u8, u8)> = Vec::new();

    let cell = |x: i32, z: i32| (z * w + x) as usize;
    let usable = |layer: &TileLayer, x: i32, z: i32| {
        let i = cell(x, z);
        layer.heights[i] != NO_HEIGHT && layer.areas[i] != AREA_NULL
    };

    'scan: for z in miny..=maxy {
        for x in minx..=maxx {
            let i = cell(x, z);
            if visited[i] || !usable(layer, x, z) {
                continue;
            }
            let area = layer.areas[i];
            let height = layer.heights[i];

            // Extend along x while the cell matches.
            let mut x1 = x;
            while x1 + 1 <= maxx {
                let ni = cell(x1 + 1, z);
                if visited[ni]
                    || !usable(layer, x1 + 1, z)
                    || layer.areas[ni] != area
                    || layer.heights[ni] != height
                {
                    break;
                }
                x1 += 1;
            }
            // Extend along z while the whole row matches.
            let mut z1 = z;
            'grow: while z1 + 1 <= maxy {
                for cx in x..=x1 {
                    let ni = cell(cx, z1 + 1);
                    if visited[ni]
                        || !usable(layer, cx, z1 + 1)
                        || layer.areas[ni] != area
                        || layer.heights[ni] != height
                    {
                        break 'grow;
                    }
                }
                z1 += 1;
            }

            for cz in z..=z1 {
                for cx in x..=x1 {
                    visited[cell(cx, cz)] = true;
                }
            }
            rects.push((x, x1, z, z1, area, height));
            if rects.len() as i32 >= max_polys {
                log::debug!(
                    "tile ({},{}) layer {}: polygon budget {} reached",
                    header.tx,
                    header.ty,
                    header.tlayer,
                    max_polys
                );
                break 'scan;
            }
        }
    }

    let mut areas: Vec<u8> = rects.iter().map(|r| r.4).collect();
    let mut flags: Vec<u16> = vec![0; rects.len()];
    process.process(&mut areas, &mut flags);

    let polys = rects
        .iter()
        .zip(areas.iter().zip(flags.iter()))
        .map(|(&(x0, x1, z0, z1, _, height), (&area, &flags))| {
            let wx0 = header.bmin[0] + x0 as f32 * cs;
            let wx1 = header.bmin[0] + (x1 + 1) as f32 * cs;
            let wz0 = header.bmin[2] + z0 as f32 * cs;
            let wz1 = header.bmin[2] + (z1 + 1) as f32 * cs;
            let wy = header.bmin[1] + height as f32 * ch;
            NavPoly {
                verts: [
                    Vec3::new(wx0, wy, wz0),
                    Vec3::new(wx1, wy, wz0),
                    Vec3::new(wx1, wy, wz1),
                    Vec3::new(wx0, wy, wz1),
                ],
                area,
                flags,
            }
        })
        .collect();

    NavMeshTile {
        tx: header.tx,
        ty: header.ty,
        tlayer: header.tlayer,
        polys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{TileLayerHeader, LAYER_MAGIC, LAYER_VERSION};

    fn flat_layer(size: u8) -> TileLayer {
        let n = size as usize * size as usize;
        TileLayer {
            header: TileLayerHeader {
                magic: LAYER_MAGIC,
                version: LAYER_VERSION,
                tx: 0,
                ty: 0,
                tlayer: 0,
                bmin: [0.0, 0.0, 0.0],
                bmax: [size as f32 * 0.3, 1.0, size as f32 * 0.3],
                hmin: 5,
                hmax: 5,
                width: size,
                height: size,
                minx: 1,
                maxx: size - 2,
                miny: 1,
                maxy: size - 2,
            },
            heights: vec![0; n],
            areas: vec![AREA_WALKABLE; n],
            cons: vec![0; n],
        }
    }

    #[test]
    fn test_flat_layer_merges_to_one_poly() {
        let layer = flat_layer(8);
        let tile = build_tile_polys(&layer, 0.3, 0.2, 1024, &DefaultMeshProcess);
        assert_eq!(tile.polys.len(), 1);
        let poly = &tile.polys[0];
        assert_eq!(poly.area, AREA_GRASS);
        assert_eq!(poly.flags, FLAG_WALK);
        // Covers the usable interior 1..=6 in cells of 0.3.
        assert!((poly.verts[0].x - 0.3).abs() < 1e-5);
        assert!((poly.verts[2].x - 2.1).abs() < 1e-5);
    }

    #[test]
    fn test_distinct_areas_stay_separate() {
        let mut layer = flat_layer(8);
        // Carve a water strip across the middle.
        for x in 1..=6 {
            layer.areas[(3 * 8 + x) as usize] = AREA_WATER;
        }
        let tile = build_tile_polys(&layer, 0.3, 0.2, 1024, &DefaultMeshProcess);
        assert_eq!(tile.polys.len(), 3);
        assert!(tile.polys.iter().any(|p| p.flags == FLAG_FLOAT));
    }

    #[test]
    fn test_poly_budget_caps_output() {
        let mut layer = flat_layer(8);
        // Checkerboard heights force one poly per cell.
        for z in 1..=6 {
            for x in 1..=6i32 {
                layer.heights[(z * 8 + x) as usize] = ((x + z) % 2) as u8;
            }
        }
        let tile = build_tile_polys(&layer, 0.3, 0.2, 4, &DefaultMeshProcess);
        assert_eq!(tile.polys.len(), 4);
    }

    #[test]
    fn test_empty_cells_produce_no_polys() {
        let mut layer = flat_layer(8);
        layer.heights.fill(NO_HEIGHT);
        let tile = build_tile_polys(&layer, 0.3, 0.2, 1024, &DefaultMeshProcess);
        assert!(tile.polys.is_empty());
    }

    fn mesh() -> NavMesh {
        NavMesh::new(
            NavMeshParams {
                origin: Vec3::ZERO,
                tile_width: 14.4,
                tile_height: 14.4,
                max_tiles: 4,
                max_polys_per_tile: 1 << 16,
            },
            6,
            16,
        )
        .unwrap()
    }

    fn tile(tx: i32, ty: i32, polys: usize) -> NavMeshTile {
        NavMeshTile {
            tx,
            ty,
            tlayer: 0,
            polys: vec![
                NavPoly {
                    verts: [Vec3::ZERO; 4],
                    area: AREA_GRASS,
                    flags: FLAG_WALK,
                };
                polys
            ],
        }
    }

    #[test]
    fn test_add_replace_remove() {
        let mut mesh = mesh();
        mesh.add_tile(tile(0, 0, 2)).unwrap();
        mesh.add_tile(tile(0, 0, 5)).unwrap();
        assert_eq!(mesh.tile_count(), 1);
        assert_eq!(mesh.tile_at(0, 0, 0).unwrap().polys.len(), 5);

        assert!(mesh.remove_tile_at(0, 0, 0));
        assert!(!mesh.remove_tile_at(0, 0, 0));
        assert_eq!(mesh.tile_count(), 0);
    }

    #[test]
    fn test_capacity() {
        let mut mesh = mesh();
        for i in 0..4 {
            mesh.add_tile(tile(i, 0, 1)).unwrap();
        }
        assert!(matches!(
            mesh.add_tile(tile(9, 9, 1)),
            Err(Error::Capacity(_))
        ));
    }

    #[test]
    fn test_poly_ref_round_trip() {
        let mesh = mesh();
        let r = mesh.encode_poly_ref(3, 1234);
        assert_eq!(mesh.decode_poly_ref(r), (3, 1234));
        assert!(r < (1 << 22));
    }

    #[test]
    fn test_poly_refs_at() {
        let mut mesh = mesh();
        mesh.add_tile(tile(1, 2, 3)).unwrap();
        let refs = mesh.poly_refs_at(1, 2, 0);
        assert_eq!(refs.len(), 3);
        let (slot, poly) = mesh.decode_poly_ref(refs[2]);
        assert_eq!(poly, 2);
        assert_eq!(mesh.decode_poly_ref(refs[0]).0, slot);
        assert!(mesh.poly_refs_at(5, 5, 0).is_empty());
    }
}
