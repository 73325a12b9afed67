//! Tile grid derivation from world bounds and agent parameters.

use glam::Vec3;

use crate::{Error, Result};

/// Agent dimensions in world units, used to derive voxel-space build
/// parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct AgentParams {
    /// Minimum clearance above the floor
    pub height: f32,
    /// Agent radius, erodes the walkable area away from walls
    pub radius: f32,
    /// Maximum step height the agent can climb
    pub max_climb: f32,
    /// Maximum walkable slope in degrees
    pub max_slope_deg: f32,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            height: 2.0,
            radius: 0.6,
            max_climb: 0.9,
            max_slope_deg: 45.0,
        }
    }
}

/// Input parameters for [`TileGridConfig::configure`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileGridParams {
    /// Minimum world bounds
    pub bmin: Vec3,
    /// Maximum world bounds
    pub bmax: Vec3,
    /// Voxel size along x and z
    pub cell_size: f32,
    /// Voxel size along y
    pub cell_height: f32,
    /// Requested tile edge length in cells, snapped down to a multiple of 8
    pub tile_size: i32,
    /// Agent dimensions
    pub agent: AgentParams,
    /// Capacity of the dynamic obstacle table
    pub max_obstacles: i32,
    /// Maximum stored layers per tile position
    pub max_layers_per_tile: i32,
}

impl Default for TileGridParams {
    fn default() -> Self {
        Self {
            bmin: Vec3::ZERO,
            bmax: Vec3::ZERO,
            cell_size: 0.3,
            cell_height: 0.2,
            tile_size: 48,
            agent: AgentParams::default(),
            max_obstacles: 128,
            max_layers_per_tile: 1,
        }
    }
}

/// Fallback tile size when the requested size snaps outside the valid range.
const DEFAULT_TILE_SIZE: i32 = 48;
/// Fixed padding added to the agent radius to form the tile border.
const BORDER_PADDING: i32 = 3;
/// Total bits available for the tile/polygon reference split.
const REF_BITS: u32 = 22;
/// Upper bound on bits spent on the tile index.
const MAX_TILE_INDEX_BITS: u32 = 14;

/// Derived tile grid configuration.
///
/// `configure` is a pure function of its inputs: the same parameters always
/// produce the same grid, which keeps tile refs and persisted data stable
/// across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGridConfig {
    /// Minimum world bounds
    pub bmin: Vec3,
    /// Maximum world bounds
    pub bmax: Vec3,
    /// Voxel size along x and z
    pub cs: f32,
    /// Voxel size along y
    pub ch: f32,
    /// Voxel grid width over the full bounds
    pub grid_width: i32,
    /// Voxel grid height (along z) over the full bounds
    pub grid_height: i32,
    /// Tile edge length in cells, snapped
    pub tile_size: i32,
    /// Border cells around each tile
    pub border_size: i32,
    /// Padded tile edge length in cells
    pub tile_px: i32,
    /// Number of tile columns
    pub tile_count_x: i32,
    /// Number of tile rows
    pub tile_count_y: i32,
    /// Tile edge length in world units
    pub tile_world_size: f32,
    /// Minimum floor clearance in cells
    pub walkable_height: i32,
    /// Maximum step height in cells
    pub walkable_climb: i32,
    /// Agent radius in cells
    pub walkable_radius: i32,
    /// Maximum walkable slope in degrees
    pub walkable_slope_deg: f32,
    /// Capacity of the obstacle table
    pub max_obstacles: i32,
    /// Maximum stored layers per tile position
    pub max_layers_per_tile: i32,
    /// Bits of a reference spent on the tile index
    pub tile_index_bits: u32,
    /// Bits of a reference spent on the polygon index
    pub poly_index_bits: u32,
    /// Tile table capacity, `1 << tile_index_bits`
    pub max_tiles: i32,
    /// Polygon capacity per tile, `1 << poly_index_bits`
    pub max_polys_per_tile: i32,
}

impl TileGridConfig {
    /// Derives the full grid configuration from build parameters.
    pub fn configure(params: &TileGridParams) -> Result<Self> {
        let bmin = params.bmin;
        let bmax = params.bmax;
        if !bmin.is_finite() || !bmax.is_finite() {
            return Err(Error::Config("world bounds must be finite".to_string()));
        }
        if bmin.x >= bmax.x || bmin.z >= bmax.z {
            return Err(Error::Config(
                "world bounds must have positive extent on x and z".to_string(),
            ));
        }
        if params.cell_size <= 0.0 || params.cell_height <= 0.0 {
            return Err(Error::Config(
                "cell size and cell height must be positive".to_string(),
            ));
        }
        if params.agent.height <= 0.0 || params.agent.radius < 0.0 || params.agent.max_climb < 0.0 {
            return Err(Error::Config("invalid agent dimensions".to_string()));
        }
        if params.agent.max_slope_deg < 0.0 || params.agent.max_slope_deg >= 90.0 {
            return Err(Error::Config(
                "walkable slope must be in [0, 90) degrees".to_string(),
            ));
        }
        if params.max_obstacles <= 0 {
            return Err(Error::Config(
                "obstacle table capacity must be positive".to_string(),
            ));
        }
        if params.max_layers_per_tile <= 0 {
            return Err(Error::Config(
                "at least one layer per tile is required".to_string(),
            ));
        }

        // Snap the tile size down to a multiple of 8; fall back to the
        // default when the result leaves the supported range.
        let mut tile_size = params.tile_size - params.tile_size.rem_euclid(8);
        if !(16..=128).contains(&tile_size) {
            tile_size = DEFAULT_TILE_SIZE;
        }

        let cs = params.cell_size;
        let ch = params.cell_height;
        // Wide arithmetic: huge extents over a small cell size must come
        // back as a configuration error, not wrap.
        let grid_width = ((bmax.x - bmin.x) as f64 / cs as f64).ceil() as i64;
        let grid_height = ((bmax.z - bmin.z) as f64 / cs as f64).ceil() as i64;
        let tile_count_x = (grid_width + tile_size as i64 - 1) / tile_size as i64;
        let tile_count_y = (grid_height + tile_size as i64 - 1) / tile_size as i64;
        let tile_slots = tile_count_x
            .checked_mul(tile_count_y)
            .and_then(|t| t.checked_mul(params.max_layers_per_tile as i64))
            .filter(|&s| s > 0 && s <= u32::MAX as i64);
        let Some(tile_slots) = tile_slots else {
            return Err(Error::Config(format!(
                "world bounds yield an unaddressable {grid_width}x{grid_height} cell grid"
            )));
        };
        if grid_width > i32::MAX as i64 || grid_height > i32::MAX as i64 {
            return Err(Error::Config(format!(
                "world bounds yield an unaddressable {grid_width}x{grid_height} cell grid"
            )));
        }
        let tile_slots = tile_slots as u64;
        let grid_width = grid_width as i32;
        let grid_height = grid_height as i32;
        let tile_count_x = tile_count_x as i32;
        let tile_count_y = tile_count_y as i32;

        let walkable_height = (params.agent.height / ch).ceil() as i32;
        let walkable_climb = (params.agent.max_climb / ch).floor() as i32;
        let walkable_radius = (params.agent.radius as f64 / cs as f64)
            .ceil()
            .min(u8::MAX as f64) as i64;
        let border_size = walkable_radius + BORDER_PADDING as i64;
        let tile_px = tile_size as i64 + border_size * 2;
        if tile_px > u8::MAX as i64 {
            return Err(Error::Config(format!(
                "padded tile size {tile_px} exceeds the storable maximum of 255 cells"
            )));
        }
        let walkable_radius = walkable_radius as i32;
        let border_size = border_size as i32;
        let tile_px = tile_px as i32;

        let tile_index_bits = tile_slots.next_power_of_two().ilog2().min(MAX_TILE_INDEX_BITS);
        let poly_index_bits = REF_BITS - tile_index_bits;
        let max_tiles = 1i32 << tile_index_bits;
        let max_polys_per_tile = 1i32 << poly_index_bits;
        if max_tiles <= 0 || max_polys_per_tile <= 0 {
            return Err(Error::Config(
                "tile reference split yields no addressable tiles or polygons".to_string(),
            ));
        }

        Ok(Self {
            bmin,
            bmax,
            cs,
            ch,
            grid_width,
            grid_height,
            tile_size,
            border_size,
            tile_px,
            tile_count_x,
            tile_count_y,
            tile_world_size: tile_size as f32 * cs,
            walkable_height,
            walkable_climb,
            walkable_radius,
            walkable_slope_deg: params.agent.max_slope_deg,
            max_obstacles: params.max_obstacles,
            max_layers_per_tile: params.max_layers_per_tile,
            tile_index_bits,
            poly_index_bits,
            max_tiles,
            max_polys_per_tile,
        })
    }

    /// World-space bounds of the tile at `(tx, ty)`, without border padding.
    pub fn tile_bounds(&self, tx: i32, ty: i32) -> (Vec3, Vec3) {
        let ts = self.tile_world_size;
        let bmin = Vec3::new(
            self.bmin.x + tx as f32 * ts,
            self.bmin.y,
            self.bmin.z + ty as f32 * ts,
        );
        let bmax = Vec3::new(bmin.x + ts, self.bmax.y, bmin.z + ts);
        (bmin, bmax)
    }

    /// Tile coordinates containing the world-space position.
    pub fn tile_at_pos(&self, pos: Vec3) -> (i32, i32) {
        let ts = self.tile_world_size;
        (
            ((pos.x - self.bmin.x) / ts).floor() as i32,
            ((pos.z - self.bmin.z) / ts).floor() as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> TileGridParams {
        TileGridParams {
            bmin: Vec3::new(0.0, 0.0, 0.0),
            bmax: Vec3::new(100.0, 10.0, 100.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_reference_grid() {
        // 100x100 world at cs 0.3 and tile size 48 yields a 7x7 tile grid.
        let config = TileGridConfig::configure(&base_params()).unwrap();
        assert_eq!(config.grid_width, 334);
        assert_eq!(config.grid_height, 334);
        assert_eq!(config.tile_count_x, 7);
        assert_eq!(config.tile_count_y, 7);
        // 49 tile slots round up to 64, so 6 bits of tile index.
        assert_eq!(config.tile_index_bits, 6);
        assert_eq!(config.poly_index_bits, 16);
        assert_eq!(config.max_tiles, 64);
        assert_eq!(config.max_polys_per_tile, 65536);
    }

    #[test]
    fn test_bit_split_invariant() {
        for (extent, layers) in [(10.0, 1), (100.0, 1), (500.0, 4), (2000.0, 1)] {
            let mut params = base_params();
            params.bmax = Vec3::new(extent, 10.0, extent);
            params.max_layers_per_tile = layers;
            let config = TileGridConfig::configure(&params).unwrap();
            assert_eq!(config.tile_index_bits + config.poly_index_bits, 22);
            assert!(config.tile_index_bits <= 14);
            assert!(config.max_tiles > 0);
            assert!(config.max_polys_per_tile > 0);
        }
    }

    #[test]
    fn test_tile_size_snapping() {
        let mut params = base_params();
        params.tile_size = 50;
        let config = TileGridConfig::configure(&params).unwrap();
        assert_eq!(config.tile_size, 48);

        params.tile_size = 8;
        let config = TileGridConfig::configure(&params).unwrap();
        assert_eq!(config.tile_size, 48);

        params.tile_size = 300;
        let config = TileGridConfig::configure(&params).unwrap();
        assert_eq!(config.tile_size, 48);

        params.tile_size = 71;
        let config = TileGridConfig::configure(&params).unwrap();
        assert_eq!(config.tile_size, 64);
    }

    #[test]
    fn test_deterministic() {
        let params = base_params();
        let a = TileGridConfig::configure(&params).unwrap();
        let b = TileGridConfig::configure(&params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_bounds() {
        let mut params = base_params();
        params.bmax = params.bmin;
        assert!(matches!(
            TileGridConfig::configure(&params),
            Err(Error::Config(_))
        ));

        let mut params = base_params();
        params.bmax.x = f32::NAN;
        assert!(TileGridConfig::configure(&params).is_err());
    }

    #[test]
    fn test_oversized_world_is_an_error() {
        // Finite bounds whose voxel grid cannot be addressed.
        let mut params = base_params();
        params.bmax = Vec3::new(1e12, 1.0, 1e12);
        assert!(matches!(
            TileGridConfig::configure(&params),
            Err(Error::Config(_))
        ));

        // Just as unaddressable via a tiny cell size.
        let mut params = base_params();
        params.cell_size = 1e-9;
        assert!(matches!(
            TileGridConfig::configure(&params),
            Err(Error::Config(_))
        ));

        // An agent radius that pads tiles beyond the storable size.
        let mut params = base_params();
        params.agent.radius = 1e9;
        assert!(matches!(
            TileGridConfig::configure(&params),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_border_from_radius() {
        let config = TileGridConfig::configure(&base_params()).unwrap();
        // radius 0.6 at cs 0.3 is 2 cells, plus fixed padding of 3.
        assert_eq!(config.walkable_radius, 2);
        assert_eq!(config.border_size, 5);
        assert_eq!(config.tile_px, 58);
    }

    #[test]
    fn test_tile_bounds_and_lookup() {
        let config = TileGridConfig::configure(&base_params()).unwrap();
        let (bmin, bmax) = config.tile_bounds(1, 2);
        assert!((bmin.x - 14.4).abs() < 1e-5);
        assert!((bmin.z - 28.8).abs() < 1e-5);
        assert!((bmax.x - bmin.x - config.tile_world_size).abs() < 1e-5);

        let (tx, ty) = config.tile_at_pos(Vec3::new(15.0, 0.0, 29.0));
        assert_eq!((tx, ty), (1, 2));
    }
}
