//! Compressed tile storage and deferred obstacle scheduling.
//!
//! The cache owns every built tile blob plus the dynamic obstacle table.
//! Obstacle changes are queued, not applied: each `update()` call drains
//! the request queue into a deduplicated rebuild list and then rebuilds a
//! bounded number of tile positions, so the per-tick cost stays flat no
//! matter how many obstacles moved.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use glam::Vec3;

use crate::compressor::TileCompressor;
use crate::grid::TileGridConfig;
use crate::heightfield::NO_HEIGHT;
use crate::layer::{self, TileLayerHeader};
use crate::mesh::{build_tile_polys, MeshProcess, NavMesh};
use crate::{Error, Result};

/// Reference to a stored tile; 0 is never a valid reference.
pub type CompressedTileRef = u32;
/// Reference to a dynamic obstacle; 0 is never a valid reference.
pub type ObstacleRef = u32;

/// Capacity of the obstacle request queue. Requests beyond this are
/// dropped until `update()` catches up.
pub const MAX_OBSTACLE_REQUESTS: usize = 64;
/// Maximum tile positions a single obstacle may touch.
pub const MAX_TOUCHED_TILES: usize = 8;
/// Tile positions rebuilt per `update()` call.
const MAX_REBUILDS_PER_UPDATE: usize = 1;

const OBSTACLE_INDEX_BITS: u32 = 16;

/// Geometric footprint of a dynamic obstacle.
#[derive(Debug, Clone)]
pub enum ObstacleShape {
    /// Axis-aligned box
    Box { bmin: Vec3, bmax: Vec3 },
    /// Box rotated around the y axis; `rot_aux` caches the half-angle
    /// rotation terms
    OrientedBox {
        center: Vec3,
        half_extents: Vec3,
        rot_aux: [f32; 2],
    },
    /// Convex XZ polygon extruded over a height range
    Convex {
        verts: Vec<Vec3>,
        hmin: f32,
        hmax: f32,
    },
}

impl ObstacleShape {
    /// Builds an oriented box from a y-axis rotation in radians.
    pub fn oriented_box(center: Vec3, half_extents: Vec3, y_radians: f32) -> Self {
        let cos_half = (0.5 * y_radians).cos();
        let sin_half = (0.5 * y_radians).sin();
        Self::OrientedBox {
            center,
            half_extents,
            rot_aux: [cos_half * -sin_half, cos_half * cos_half - 0.5],
        }
    }

    /// Conservative world-space bounds of the shape.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        match self {
            Self::Box { bmin, bmax } => (*bmin, *bmax),
            Self::OrientedBox {
                center,
                half_extents,
                ..
            } => {
                let maxr = 1.41 * half_extents.x.max(half_extents.z);
                (
                    Vec3::new(center.x - maxr, center.y - half_extents.y, center.z - maxr),
                    Vec3::new(center.x + maxr, center.y + half_extents.y, center.z + maxr),
                )
            }
            Self::Convex { verts, hmin, hmax } => {
                let mut bmin = verts[0];
                let mut bmax = verts[0];
                for v in &verts[1..] {
                    bmin = bmin.min(*v);
                    bmax = bmax.max(*v);
                }
                bmin.y = *hmin;
                bmax.y = *hmax;
                (bmin, bmax)
            }
        }
    }

    /// Tests a cell floor position against the shape, with `y_slack`
    /// vertical tolerance.
    fn contains(&self, p: Vec3, y_slack: f32) -> bool {
        match self {
            Self::Box { bmin, bmax } => {
                p.x >= bmin.x
                    && p.x <= bmax.x
                    && p.z >= bmin.z
                    && p.z <= bmax.z
                    && p.y >= bmin.y - y_slack
                    && p.y <= bmax.y + y_slack
            }
            Self::OrientedBox {
                center,
                half_extents,
                rot_aux,
            } => {
                if (p.y - center.y).abs() > half_extents.y + y_slack {
                    return false;
                }
                let cos_a = 2.0 * rot_aux[1];
                let sin_a = -2.0 * rot_aux[0];
                let dx = p.x - center.x;
                let dz = p.z - center.z;
                let lx = dx * cos_a + dz * sin_a;
                let lz = -dx * sin_a + dz * cos_a;
                lx.abs() <= half_extents.x && lz.abs() <= half_extents.z
            }
            Self::Convex { verts, hmin, hmax } => {
                p.y >= *hmin - y_slack
                    && p.y <= *hmax + y_slack
                    && crate::geometry::point_in_polygon_xz(p.x, p.z, verts)
            }
        }
    }
}

/// Lifecycle of a dynamic obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleState {
    /// Slot is free
    Empty,
    /// Queued or mid-rebuild after an add request
    Processing,
    /// Fully stamped into all touched tiles
    Processed,
    /// Mid-rebuild after a remove request
    Removing,
}

struct ObstacleSlot {
    salt: u32,
    state: ObstacleState,
    shape: Option<ObstacleShape>,
    area: u8,
    /// Tile positions the obstacle overlaps
    touched: Vec<(i32, i32)>,
    /// Touched positions not yet rebuilt for the current transition
    pending: Vec<(i32, i32)>,
}

enum ObstacleRequest {
    Add(ObstacleRef),
    Remove(ObstacleRef),
}

/// Stored compressed tile.
pub struct TileEntry {
    pub header: TileLayerHeader,
    pub data: Vec<u8>,
}

struct TileSlot {
    salt: u32,
    entry: Option<TileEntry>,
}

/// Cache of compressed tile layers with deferred obstacle rebuilds.
pub struct TileCache {
    config: TileGridConfig,
    compressor: Arc<dyn TileCompressor>,
    process: Arc<dyn MeshProcess>,
    tiles: Vec<TileSlot>,
    free_tiles: Vec<usize>,
    lookup: HashMap<(i32, i32, i32), usize>,
    obstacles: Vec<ObstacleSlot>,
    free_obstacles: Vec<usize>,
    requests: VecDeque<ObstacleRequest>,
    update_list: Vec<(i32, i32)>,
    rebuild_count: u64,
}

impl TileCache {
    pub fn new(
        config: TileGridConfig,
        compressor: Arc<dyn TileCompressor>,
        process: Arc<dyn MeshProcess>,
    ) -> Self {
        let max_tiles = config.max_tiles as usize;
        let max_obstacles = config.max_obstacles as usize;
        Self {
            config,
            compressor,
            process,
            tiles: (0..max_tiles)
                .map(|_| TileSlot {
                    salt: 1,
                    entry: None,
                })
                .collect(),
            free_tiles: (0..max_tiles).rev().collect(),
            lookup: HashMap::new(),
            obstacles: (0..max_obstacles)
                .map(|_| ObstacleSlot {
                    salt: 1,
                    state: ObstacleState::Empty,
                    shape: None,
                    area: crate::AREA_NULL,
                    touched: Vec::new(),
                    pending: Vec::new(),
                })
                .collect(),
            free_obstacles: (0..max_obstacles).rev().collect(),
            requests: VecDeque::new(),
            update_list: Vec::new(),
            rebuild_count: 0,
        }
    }

    pub fn config(&self) -> &TileGridConfig {
        &self.config
    }

    /// Tiles rebuilt since creation.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    /// Pending obstacle requests.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Stored tiles.
    pub fn tile_count(&self) -> usize {
        self.lookup.len()
    }

    /// Live obstacles, in any state but `Empty`.
    pub fn obstacle_count(&self) -> usize {
        self.obstacles
            .iter()
            .filter(|o| o.state != ObstacleState::Empty)
            .count()
    }

    fn encode_tile_ref(&self, index: usize, salt: u32) -> CompressedTileRef {
        (salt << self.config.tile_index_bits) | index as u32
    }

    /// Splits a tile reference into `(index, salt)`.
    pub fn decode_tile_ref(&self, r: CompressedTileRef) -> (u32, u32) {
        let index_mask = (1u32 << self.config.tile_index_bits) - 1;
        (r & index_mask, r >> self.config.tile_index_bits)
    }

    fn tile_salt_mask(&self) -> u32 {
        (1u32 << (32 - self.config.tile_index_bits)) - 1
    }

    /// Adds a serialized tile blob to the cache.
    ///
    /// The blob header must parse, the position must lie inside the grid
    /// and be unoccupied, and a slot must be free.
    pub fn add_tile(&mut self, data: Vec<u8>) -> Result<CompressedTileRef> {
        let header = layer::peek_header(&data)?;
        if header.tx < 0
            || header.ty < 0
            || header.tx >= self.config.tile_count_x
            || header.ty >= self.config.tile_count_y
            || header.tlayer < 0
            || header.tlayer >= self.config.max_layers_per_tile
        {
            return Err(Error::Config(format!(
                "tile ({},{}) layer {} lies outside the grid",
                header.tx, header.ty, header.tlayer
            )));
        }
        let key = (header.tx, header.ty, header.tlayer);
        if self.lookup.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "tile ({},{}) layer {}",
                header.tx, header.ty, header.tlayer
            )));
        }
        let index = self
            .free_tiles
            .pop()
            .ok_or_else(|| Error::Capacity("tile table is full".to_string()))?;
        let salt = self.tiles[index].salt;
        self.tiles[index].entry = Some(TileEntry { header, data });
        self.lookup.insert(key, index);
        Ok(self.encode_tile_ref(index, salt))
    }

    /// Removes a tile. The slot's salt is bumped so the reference and any
    /// copies of it become stale.
    pub fn remove_tile(&mut self, r: CompressedTileRef) -> Result<()> {
        let (index, salt) = self.decode_tile_ref(r);
        let index = index as usize;
        if r == 0 || index >= self.tiles.len() {
            return Err(Error::NotFound("invalid tile reference".to_string()));
        }
        let slot = &mut self.tiles[index];
        if slot.salt != salt || slot.entry.is_none() {
            return Err(Error::NotFound("stale tile reference".to_string()));
        }
        let entry = slot.entry.take();
        if let Some(entry) = entry {
            self.lookup
                .remove(&(entry.header.tx, entry.header.ty, entry.header.tlayer));
        }
        let mask = self.tile_salt_mask();
        let slot = &mut self.tiles[index];
        slot.salt = if slot.salt >= mask { 1 } else { slot.salt + 1 };
        self.free_tiles.push(index);
        Ok(())
    }

    /// Resolves a reference, failing on stale salts.
    pub fn get_tile(&self, r: CompressedTileRef) -> Option<&TileEntry> {
        let (index, salt) = self.decode_tile_ref(r);
        let slot = self.tiles.get(index as usize)?;
        if r == 0 || slot.salt != salt {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Reference of the tile stored at the position.
    pub fn tile_ref_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<CompressedTileRef> {
        let &index = self.lookup.get(&(tx, ty, tlayer))?;
        Some(self.encode_tile_ref(index, self.tiles[index].salt))
    }

    /// References of every layer stored at a grid position, ordered by
    /// layer index.
    pub fn tiles_at(&self, tx: i32, ty: i32) -> Vec<CompressedTileRef> {
        (0..self.config.max_layers_per_tile)
            .filter_map(|l| self.tile_ref_at(tx, ty, l))
            .collect()
    }

    /// Iterates stored tiles in slot order.
    pub fn iter_tiles(&self) -> impl Iterator<Item = (CompressedTileRef, &TileEntry)> {
        self.tiles.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry
                .as_ref()
                .map(|e| (self.encode_tile_ref(i, slot.salt), e))
        })
    }

    /// Actual data bounds of a stored layer, tighter than the padded tile
    /// bounds.
    pub fn calc_tight_tile_bounds(&self, header: &TileLayerHeader) -> (Vec3, Vec3) {
        let cs = self.config.cs;
        let bmin = Vec3::new(
            header.bmin[0] + header.minx as f32 * cs,
            header.bmin[1],
            header.bmin[2] + header.miny as f32 * cs,
        );
        let bmax = Vec3::new(
            header.bmin[0] + (header.maxx as f32 + 1.0) * cs,
            header.bmax[1],
            header.bmin[2] + (header.maxy as f32 + 1.0) * cs,
        );
        (bmin, bmax)
    }

    /// References of stored tiles whose data bounds overlap the box.
    pub fn query_tiles(&self, bmin: Vec3, bmax: Vec3) -> Vec<CompressedTileRef> {
        let tw = self.config.tile_world_size;
        let tx0 = ((bmin.x - self.config.bmin.x) / tw).floor() as i32;
        let tx1 = ((bmax.x - self.config.bmin.x) / tw).floor() as i32;
        let ty0 = ((bmin.z - self.config.bmin.z) / tw).floor() as i32;
        let ty1 = ((bmax.z - self.config.bmin.z) / tw).floor() as i32;
        if tx1 < 0 || ty1 < 0 || tx0 >= self.config.tile_count_x || ty0 >= self.config.tile_count_y
        {
            return Vec::new();
        }

        let mut out = Vec::new();
        for ty in ty0.max(0)..=ty1.min(self.config.tile_count_y - 1) {
            for tx in tx0.max(0)..=tx1.min(self.config.tile_count_x - 1) {
                for r in self.tiles_at(tx, ty) {
                    let entry = match self.get_tile(r) {
                        Some(e) => e,
                        None => continue,
                    };
                    let (tbmin, tbmax) = self.calc_tight_tile_bounds(&entry.header);
                    if overlap_bounds(bmin, bmax, tbmin, tbmax) {
                        out.push(r);
                    }
                }
            }
        }
        out
    }

    fn encode_obstacle_ref(index: usize, salt: u32) -> ObstacleRef {
        (salt << OBSTACLE_INDEX_BITS) | index as u32
    }

    fn decode_obstacle_ref(r: ObstacleRef) -> (u32, u32) {
        (r & ((1 << OBSTACLE_INDEX_BITS) - 1), r >> OBSTACLE_INDEX_BITS)
    }

    fn valid_obstacle(&self, r: ObstacleRef) -> Option<usize> {
        let (index, salt) = Self::decode_obstacle_ref(r);
        let index = index as usize;
        let slot = self.obstacles.get(index)?;
        if r == 0 || slot.salt != salt || slot.state == ObstacleState::Empty {
            return None;
        }
        Some(index)
    }

    /// Queues an obstacle for addition.
    ///
    /// Returns `None` when the obstacle table or the request queue is
    /// full; the caller may retry after `update()` has drained the queue.
    pub fn add_obstacle(&mut self, shape: ObstacleShape, area: u8) -> Option<ObstacleRef> {
        if matches!(&shape, ObstacleShape::Convex { verts, .. } if verts.len() < 3) {
            log::warn!("rejecting convex obstacle with fewer than 3 vertices");
            return None;
        }
        if self.requests.len() >= MAX_OBSTACLE_REQUESTS {
            log::warn!("obstacle request queue full, dropping add request");
            return None;
        }
        let index = match self.free_obstacles.pop() {
            Some(i) => i,
            None => {
                log::warn!("obstacle table full ({} slots)", self.obstacles.len());
                return None;
            }
        };
        let slot = &mut self.obstacles[index];
        slot.state = ObstacleState::Processing;
        slot.shape = Some(shape);
        slot.area = area;
        slot.touched.clear();
        slot.pending.clear();
        let r = Self::encode_obstacle_ref(index, slot.salt);
        self.requests.push_back(ObstacleRequest::Add(r));
        Some(r)
    }

    /// Queues an obstacle for removal. Returns false for stale references
    /// or when the request queue is full.
    pub fn remove_obstacle(&mut self, r: ObstacleRef) -> bool {
        if self.valid_obstacle(r).is_none() {
            return false;
        }
        if self.requests.len() >= MAX_OBSTACLE_REQUESTS {
            log::warn!("obstacle request queue full, dropping remove request");
            return false;
        }
        self.requests.push_back(ObstacleRequest::Remove(r));
        true
    }

    /// Current state of an obstacle, or `None` for stale references.
    pub fn obstacle_state(&self, r: ObstacleRef) -> Option<ObstacleState> {
        self.valid_obstacle(r).map(|i| self.obstacles[i].state)
    }

    fn free_obstacle_slot(&mut self, index: usize) {
        let slot = &mut self.obstacles[index];
        slot.state = ObstacleState::Empty;
        slot.shape = None;
        slot.touched.clear();
        slot.pending.clear();
        let salt_mask = (1u32 << (32 - OBSTACLE_INDEX_BITS)) - 1;
        slot.salt = if slot.salt >= salt_mask { 1 } else { slot.salt + 1 };
        self.free_obstacles.push(index);
    }

    /// Tile positions whose stored layers overlap the bounds.
    fn touched_positions(&self, bmin: Vec3, bmax: Vec3) -> Vec<(i32, i32)> {
        let mut positions: Vec<(i32, i32)> = self
            .query_tiles(bmin, bmax)
            .into_iter()
            .filter_map(|r| self.get_tile(r))
            .map(|e| (e.header.tx, e.header.ty))
            .collect();
        positions.sort_unstable();
        positions.dedup();
        if positions.len() > MAX_TOUCHED_TILES {
            log::warn!(
                "obstacle touches {} tiles, clamping to {MAX_TOUCHED_TILES}",
                positions.len()
            );
            positions.truncate(MAX_TOUCHED_TILES);
        }
        positions
    }

    fn drain_requests(&mut self) {
        while let Some(request) = self.requests.pop_front() {
            match request {
                ObstacleRequest::Add(r) => {
                    let Some(index) = self.valid_obstacle(r) else {
                        continue;
                    };
                    let Some(shape) = self.obstacles[index].shape.clone() else {
                        continue;
                    };
                    let (bmin, bmax) = shape.bounds();
                    let positions = self.touched_positions(bmin, bmax);
                    let slot = &mut self.obstacles[index];
                    slot.touched = positions.clone();
                    slot.pending = positions.clone();
                    if slot.pending.is_empty() {
                        slot.state = ObstacleState::Processed;
                    }
                    for p in positions {
                        if !self.update_list.contains(&p) {
                            self.update_list.push(p);
                        }
                    }
                }
                ObstacleRequest::Remove(r) => {
                    let Some(index) = self.valid_obstacle(r) else {
                        continue;
                    };
                    let slot = &mut self.obstacles[index];
                    slot.state = ObstacleState::Removing;
                    slot.pending = slot.touched.clone();
                    if slot.pending.is_empty() {
                        self.free_obstacle_slot(index);
                        continue;
                    }
                    let positions = self.obstacles[index].pending.clone();
                    for p in positions {
                        if !self.update_list.contains(&p) {
                            self.update_list.push(p);
                        }
                    }
                }
            }
        }
    }

    /// Advances deferred obstacle processing by one timeslice.
    ///
    /// Drains queued requests when no rebuilds are outstanding, then
    /// rebuilds a bounded number of tile positions into `nav`. Returns
    /// true when the cache is fully up to date.
    pub fn update(
        &mut self,
        _dt: f32,
        nav: &mut NavMesh,
        mut on_rebuilt: Option<&mut dyn FnMut(i32, i32)>,
    ) -> Result<bool> {
        if self.update_list.is_empty() {
            self.drain_requests();
        }

        for _ in 0..MAX_REBUILDS_PER_UPDATE {
            if self.update_list.is_empty() {
                break;
            }
            let (tx, ty) = self.update_list.remove(0);
            self.build_nav_mesh_tiles_at(tx, ty, nav)?;
            self.rebuild_count += 1;
            log::debug!("rebuilt tile position ({tx},{ty})");
            if let Some(cb) = on_rebuilt.as_mut() {
                cb(tx, ty);
            }

            for index in 0..self.obstacles.len() {
                let slot = &mut self.obstacles[index];
                if !matches!(
                    slot.state,
                    ObstacleState::Processing | ObstacleState::Removing
                ) {
                    continue;
                }
                if slot.pending.is_empty() {
                    continue;
                }
                slot.pending.retain(|&p| p != (tx, ty));
                if slot.pending.is_empty() {
                    if slot.state == ObstacleState::Processing {
                        slot.state = ObstacleState::Processed;
                    } else {
                        self.free_obstacle_slot(index);
                    }
                }
            }
        }

        Ok(self.update_list.is_empty() && self.requests.is_empty())
    }

    /// Rebuilds the walkable mesh for every stored layer at the position.
    ///
    /// A layer that fails to decode is logged, cleared from the mesh and
    /// skipped; the remaining layers still rebuild.
    pub fn build_nav_mesh_tiles_at(&self, tx: i32, ty: i32, nav: &mut NavMesh) -> Result<()> {
        for tlayer in 0..self.config.max_layers_per_tile {
            if self.tile_ref_at(tx, ty, tlayer).is_none() {
                nav.remove_tile_at(tx, ty, tlayer);
            }
        }
        for r in self.tiles_at(tx, ty) {
            let Some(entry) = self.get_tile(r) else {
                continue;
            };
            let mut layer = match layer::decode_layer(&entry.data, &*self.compressor) {
                Ok(layer) => layer,
                Err(e @ (Error::CorruptTile(_) | Error::Format(_))) => {
                    log::error!(
                        "tile ({tx},{ty}) layer {}: {e}; clearing mesh tile",
                        entry.header.tlayer
                    );
                    nav.remove_tile_at(tx, ty, entry.header.tlayer);
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.stamp_obstacles(&mut layer);
            let tile = build_tile_polys(
                &layer,
                self.config.cs,
                self.config.ch,
                self.config.max_polys_per_tile,
                &*self.process,
            );
            nav.add_tile(tile)?;
        }
        Ok(())
    }

    /// Stamps every live obstacle overlapping the layer into its area grid.
    /// Obstacles mid-removal are skipped, which is what erases them.
    fn stamp_obstacles(&self, layer: &mut layer::TileLayer) {
        let header = layer.header;
        let cs = self.config.cs;
        let ch = self.config.ch;

        for slot in &self.obstacles {
            if !matches!(
                slot.state,
                ObstacleState::Processing | ObstacleState::Processed
            ) {
                continue;
            }
            let Some(shape) = &slot.shape else {
                continue;
            };
            let (obmin, obmax) = shape.bounds();
            let lbmin = Vec3::from(header.bmin);
            let lbmax = Vec3::from(header.bmax);
            if !overlap_bounds(obmin, obmax, lbmin, lbmax) {
                continue;
            }

            let w = header.width as i32;
            let h = header.height as i32;
            for z in 0..h {
                for x in 0..w {
                    let i = (z * w + x) as usize;
                    if layer.heights[i] == NO_HEIGHT {
                        continue;
                    }
                    let p = Vec3::new(
                        header.bmin[0] + (x as f32 + 0.5) * cs,
                        header.bmin[1] + layer.heights[i] as f32 * ch,
                        header.bmin[2] + (z as f32 + 0.5) * cs,
                    );
                    if shape.contains(p, ch) {
                        layer.areas[i] = slot.area;
                    }
                }
            }
        }
    }
}

fn overlap_bounds(amin: Vec3, amax: Vec3, bmin: Vec3, bmax: Vec3) -> bool {
    amin.x <= bmax.x
        && amax.x >= bmin.x
        && amin.y <= bmax.y
        && amax.y >= bmin.y
        && amin.z <= bmax.z
        && amax.z >= bmin.z
}
