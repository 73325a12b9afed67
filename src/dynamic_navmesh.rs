//! High-level facade tying the builder, cache and walkable mesh together.

use std::path::Path;
use std::sync::Arc;

use glam::Vec3;

use crate::builder::TileBuilder;
use crate::compressor::{Lz4Compressor, TileCompressor};
use crate::geometry::WorldGeometry;
use crate::grid::{TileGridConfig, TileGridParams};
use crate::mesh::{DefaultMeshProcess, MeshProcess, NavMesh};
use crate::persist;
use crate::tile_cache::{ObstacleRef, ObstacleShape, ObstacleState, TileCache};
use crate::{Result, AREA_NULL};

/// Aggregate figures from the initial world build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavMeshBuildStats {
    /// Tile positions that produced at least one layer
    pub tiles_built: usize,
    /// Layers stored in the cache
    pub layers_stored: usize,
    /// Uncompressed layer bytes
    pub raw_bytes: usize,
    /// Compressed layer bytes as stored
    pub compressed_bytes: usize,
    /// Peak build scratch memory in bytes
    pub peak_build_memory: usize,
}

/// A navigation mesh over a tiled world that stays current as obstacles
/// come and go.
///
/// Owns the source geometry, the compressed tile cache and the walkable
/// mesh. Obstacle changes are deferred; call [`update`](Self::update) each
/// tick (or with `until_settled` to flush everything at once).
pub struct DynamicNavMesh {
    geom: WorldGeometry,
    builder: TileBuilder,
    cache: TileCache,
    nav: NavMesh,
    stats: NavMeshBuildStats,
}

impl DynamicNavMesh {
    /// Builds the full tile set with the default LZ4 compression and area
    /// flag mapping.
    pub fn build(geom: WorldGeometry, params: &TileGridParams) -> Result<Self> {
        Self::with_strategies(
            geom,
            params,
            Arc::new(Lz4Compressor),
            Arc::new(DefaultMeshProcess),
        )
    }

    /// Builds the full tile set with caller-supplied strategies.
    pub fn with_strategies(
        geom: WorldGeometry,
        params: &TileGridParams,
        compressor: Arc<dyn TileCompressor>,
        process: Arc<dyn MeshProcess>,
    ) -> Result<Self> {
        let config = TileGridConfig::configure(params)?;
        let mut builder = TileBuilder::new(config.clone(), compressor.clone());
        let mut cache = TileCache::new(config.clone(), compressor, process);
        let mut nav = NavMesh::for_grid(&config)?;
        let mut stats = NavMeshBuildStats::default();

        for ty in 0..config.tile_count_y {
            for tx in 0..config.tile_count_x {
                let blobs = builder.build_tile(&geom, tx, ty)?;
                if blobs.is_empty() {
                    continue;
                }
                stats.tiles_built += 1;
                for blob in blobs {
                    stats.layers_stored += 1;
                    stats.raw_bytes += blob.raw_size;
                    stats.compressed_bytes += blob.data.len();
                    cache.add_tile(blob.data)?;
                }
                cache.build_nav_mesh_tiles_at(tx, ty, &mut nav)?;
            }
        }
        stats.peak_build_memory = builder.high_water();

        log::debug!(
            "built {} tile positions, {} layers, {} -> {} bytes, peak scratch {}",
            stats.tiles_built,
            stats.layers_stored,
            stats.raw_bytes,
            stats.compressed_bytes,
            stats.peak_build_memory
        );

        Ok(Self {
            geom,
            builder,
            cache,
            nav,
            stats,
        })
    }

    pub fn config(&self) -> &TileGridConfig {
        self.cache.config()
    }

    pub fn nav_mesh(&self) -> &NavMesh {
        &self.nav
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn geometry(&self) -> &WorldGeometry {
        &self.geom
    }

    pub fn stats(&self) -> &NavMeshBuildStats {
        &self.stats
    }

    /// Advances deferred obstacle processing. With `until_settled` the
    /// queue and rebuild backlog are drained completely before returning.
    pub fn update(&mut self, dt: f32, until_settled: bool) -> Result<bool> {
        let mut settled = self.cache.update(dt, &mut self.nav, None)?;
        if until_settled {
            while !settled {
                settled = self.cache.update(dt, &mut self.nav, None)?;
            }
        }
        Ok(settled)
    }

    /// Like [`update`](Self::update), invoking `on_rebuilt` for every tile
    /// position rebuilt.
    pub fn update_with_observer(
        &mut self,
        dt: f32,
        until_settled: bool,
        on_rebuilt: &mut dyn FnMut(i32, i32),
    ) -> Result<bool> {
        let mut settled = self.cache.update(dt, &mut self.nav, Some(on_rebuilt))?;
        if until_settled {
            while !settled {
                settled = self.cache.update(dt, &mut self.nav, Some(on_rebuilt))?;
            }
        }
        Ok(settled)
    }

    /// Rebuilds one tile position from the source geometry, replacing its
    /// cached layers and mesh tiles. Used after the geometry changes.
    pub fn rebuild_tile(&mut self, tx: i32, ty: i32) -> Result<()> {
        for tlayer in 0..self.cache.config().max_layers_per_tile {
            if let Some(r) = self.cache.tile_ref_at(tx, ty, tlayer) {
                self.cache.remove_tile(r)?;
            }
        }
        let blobs = self.builder.build_tile(&self.geom, tx, ty)?;
        for blob in blobs {
            self.cache.add_tile(blob.data)?;
        }
        self.cache.build_nav_mesh_tiles_at(tx, ty, &mut self.nav)
    }

    /// Rebuilds every tile position overlapping the world-space box.
    pub fn rebuild_tiles_in_box(&mut self, bmin: Vec3, bmax: Vec3) -> Result<()> {
        let (tx0, ty0) = self.cache.config().tile_at_pos(bmin);
        let (tx1, ty1) = self.cache.config().tile_at_pos(bmax);
        let (cx, cy) = (
            self.cache.config().tile_count_x,
            self.cache.config().tile_count_y,
        );
        for ty in ty0.max(0)..=ty1.min(cy - 1) {
            for tx in tx0.max(0)..=tx1.min(cx - 1) {
                self.rebuild_tile(tx, ty)?;
            }
        }
        Ok(())
    }

    /// Queues a blocking axis-aligned box obstacle.
    pub fn add_box_obstacle(&mut self, bmin: Vec3, bmax: Vec3) -> Option<ObstacleRef> {
        self.cache
            .add_obstacle(ObstacleShape::Box { bmin, bmax }, AREA_NULL)
    }

    /// Queues a blocking box obstacle rotated around the y axis.
    pub fn add_oriented_box_obstacle(
        &mut self,
        center: Vec3,
        half_extents: Vec3,
        y_radians: f32,
    ) -> Option<ObstacleRef> {
        self.cache.add_obstacle(
            ObstacleShape::oriented_box(center, half_extents, y_radians),
            AREA_NULL,
        )
    }

    /// Queues a convex polygon obstacle stamping `area` onto covered
    /// cells; `AREA_NULL` blocks them entirely.
    pub fn add_convex_obstacle(
        &mut self,
        verts: Vec<Vec3>,
        hmin: f32,
        hmax: f32,
        area: u8,
    ) -> Option<ObstacleRef> {
        if verts.len() < 3 || hmin > hmax {
            log::warn!("rejecting degenerate convex obstacle");
            return None;
        }
        self.cache
            .add_obstacle(ObstacleShape::Convex { verts, hmin, hmax }, area)
    }

    /// Queues an obstacle for removal.
    pub fn remove_obstacle(&mut self, r: ObstacleRef) -> bool {
        self.cache.remove_obstacle(r)
    }

    pub fn obstacle_state(&self, r: ObstacleRef) -> Option<ObstacleState> {
        self.cache.obstacle_state(r)
    }

    /// Saves the tile set to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        persist::save_to_path(path, &self.cache)
    }

    /// Loads a tile set with the default strategies. The geometry must be
    /// the one the set was built from; it is only consulted for future
    /// tile rebuilds.
    pub fn load<P: AsRef<Path>>(path: P, geom: WorldGeometry) -> Result<Self> {
        Self::load_with_strategies(
            path,
            geom,
            Arc::new(Lz4Compressor),
            Arc::new(DefaultMeshProcess),
        )
    }

    /// Loads a tile set with caller-supplied strategies, which must match
    /// the ones the set was built with.
    pub fn load_with_strategies<P: AsRef<Path>>(
        path: P,
        geom: WorldGeometry,
        compressor: Arc<dyn TileCompressor>,
        process: Arc<dyn MeshProcess>,
    ) -> Result<Self> {
        let (cache, nav) = persist::load_from_path(path, compressor.clone(), process)?;
        let builder = TileBuilder::new(cache.config().clone(), compressor);

        let mut stats = NavMeshBuildStats::default();
        let mut positions: Vec<(i32, i32)> = Vec::new();
        for (_, entry) in cache.iter_tiles() {
            stats.layers_stored += 1;
            stats.raw_bytes += entry.header.cell_count() * 3;
            stats.compressed_bytes += entry.data.len();
            positions.push((entry.header.tx, entry.header.ty));
        }
        positions.sort_unstable();
        positions.dedup();
        stats.tiles_built = positions.len();

        Ok(Self {
            geom,
            builder,
            cache,
            nav,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_world(extent: f32) -> WorldGeometry {
        let verts = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(extent, 0.0, 0.0),
            Vec3::new(extent, 0.0, extent),
            Vec3::new(0.0, 0.0, extent),
        ];
        WorldGeometry::new(verts, vec![[0, 2, 1], [0, 3, 2]]).unwrap()
    }

    fn params(extent: f32) -> TileGridParams {
        TileGridParams {
            bmin: Vec3::new(0.0, -1.0, 0.0),
            bmax: Vec3::new(extent, 2.0, extent),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_small_world() {
        let nav = DynamicNavMesh::build(flat_world(30.0), &params(30.0)).unwrap();
        assert_eq!(nav.config().tile_count_x, 3);
        assert!(nav.stats().tiles_built > 0);
        assert!(nav.stats().layers_stored >= nav.stats().tiles_built);
        assert!(nav.stats().raw_bytes > nav.stats().compressed_bytes);
        assert!(nav.stats().peak_build_memory > 0);
        assert!(nav.nav_mesh().poly_count() > 0);
    }

    #[test]
    fn test_geometry_coverage_partial() {
        // Geometry covers one corner; distant tiles stay empty but the
        // grid itself spans the full bounds.
        let nav = DynamicNavMesh::build(flat_world(10.0), &params(60.0)).unwrap();
        assert_eq!(nav.config().tile_count_x, 5);
        assert!(nav.stats().tiles_built < 25);
        assert!(nav.tile_cache().tile_count() > 0);
    }

    #[test]
    fn test_obstacle_round_trip_restores_mesh() {
        let mut nav = DynamicNavMesh::build(flat_world(30.0), &params(30.0)).unwrap();
        nav.update(0.016, true).unwrap();
        let baseline = nav.nav_mesh().poly_count();

        let r = nav
            .add_box_obstacle(Vec3::new(5.0, -1.0, 5.0), Vec3::new(7.0, 1.0, 7.0))
            .unwrap();
        nav.update(0.016, true).unwrap();
        assert_eq!(nav.obstacle_state(r), Some(ObstacleState::Processed));
        assert_ne!(nav.nav_mesh().poly_count(), baseline);

        assert!(nav.remove_obstacle(r));
        nav.update(0.016, true).unwrap();
        assert_eq!(nav.obstacle_state(r), None);
        assert_eq!(nav.nav_mesh().poly_count(), baseline);
    }

    #[test]
    fn test_rebuild_tile_refreshes_refs() {
        let mut nav = DynamicNavMesh::build(flat_world(30.0), &params(30.0)).unwrap();
        let old_ref = nav.tile_cache().tile_ref_at(0, 0, 0).unwrap();
        let polys = nav.nav_mesh().poly_count();

        nav.rebuild_tile(0, 0).unwrap();
        let new_ref = nav.tile_cache().tile_ref_at(0, 0, 0).unwrap();
        assert_ne!(old_ref, new_ref);
        // Unchanged geometry rebuilds to the same mesh.
        assert_eq!(nav.nav_mesh().poly_count(), polys);
    }

    #[test]
    fn test_save_load() {
        let mut nav = DynamicNavMesh::build(flat_world(30.0), &params(30.0)).unwrap();
        nav.update(0.016, true).unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        nav.save(file.path()).unwrap();

        let loaded = DynamicNavMesh::load(file.path(), flat_world(30.0)).unwrap();
        assert_eq!(loaded.config(), nav.config());
        assert_eq!(
            loaded.tile_cache().tile_count(),
            nav.tile_cache().tile_count()
        );
        assert_eq!(loaded.nav_mesh().poly_count(), nav.nav_mesh().poly_count());
    }
}
