//! Tile-cached dynamic navigation mesh.
//!
//! This crate maintains a walkable navigation mesh over a tiled world and
//! keeps it up to date as obstacles appear and disappear at runtime. Source
//! geometry is rasterized once per tile into compressed layer blobs; when an
//! obstacle changes, only the touched tiles are decompressed, re-stamped and
//! re-polygonized, a little per tick.
//!
//! # Features
//!
//! - Tile grid derivation from world bounds with a 22-bit tile/polygon
//!   reference split
//! - Per-tile layered heightfield rasterization into LZ4-compressed blobs
//! - Deferred obstacle add/remove through a bounded request queue
//! - Timesliced `update()` that rebuilds a bounded amount of work per call
//! - Binary save/load of the whole tile set
//! - Pluggable compression and mesh post-processing strategies
//!
//! # Example
//!
//! ```no_run
//! use glam::Vec3;
//! use tilenav::{DynamicNavMesh, TileGridParams, WorldGeometry};
//!
//! # fn main() -> tilenav::Result<()> {
//! let verts = vec![
//!     Vec3::new(0.0, 0.0, 0.0),
//!     Vec3::new(20.0, 0.0, 0.0),
//!     Vec3::new(20.0, 0.0, 20.0),
//!     Vec3::new(0.0, 0.0, 20.0),
//! ];
//! let tris = vec![[0, 2, 1], [0, 3, 2]];
//! let geom = WorldGeometry::new(verts, tris)?;
//!
//! let params = TileGridParams {
//!     bmin: Vec3::new(0.0, -1.0, 0.0),
//!     bmax: Vec3::new(20.0, 1.0, 20.0),
//!     ..Default::default()
//! };
//! let mut nav = DynamicNavMesh::build(geom, &params)?;
//!
//! let obstacle = nav.add_box_obstacle(Vec3::new(5.0, -1.0, 5.0), Vec3::new(7.0, 1.0, 7.0));
//! nav.update(0.016, true)?;
//! if let Some(r) = obstacle {
//!     nav.remove_obstacle(r);
//! }
//! nav.update(0.016, true)?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod builder;
pub mod compressor;
pub mod dynamic_navmesh;
pub mod geometry;
pub mod grid;
pub mod heightfield;
pub mod layer;
pub mod mesh;
pub mod persist;
pub mod tile_cache;

pub use arena::BuildArena;
pub use builder::{TileBlob, TileBuilder};
pub use compressor::{Lz4Compressor, TileCompressor};
pub use dynamic_navmesh::{DynamicNavMesh, NavMeshBuildStats};
pub use geometry::{AreaVolume, WorldGeometry};
pub use grid::{AgentParams, TileGridConfig, TileGridParams};
pub use layer::{TileLayer, TileLayerHeader};
pub use mesh::{DefaultMeshProcess, MeshProcess, NavMesh, NavMeshParams, NavMeshTile, NavPoly};
pub use tile_cache::{
    CompressedTileRef, ObstacleRef, ObstacleShape, ObstacleState, TileCache,
    MAX_OBSTACLE_REQUESTS,
};

use thiserror::Error;

/// Errors produced by navigation mesh construction and maintenance.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid build or grid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid input geometry
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Unrecognized or incompatible serialized data
    #[error("unrecognized format: {0}")]
    Format(String),

    /// Stored tile data failed to decompress or decode
    #[error("corrupt tile data: {0}")]
    CorruptTile(String),

    /// A fixed-capacity table or queue is full
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// A resource already occupies the requested slot
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Referenced resource does not exist or the reference is stale
    #[error("not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Area id for unwalkable cells.
pub const AREA_NULL: u8 = 0;
/// Area id assigned to walkable cells during rasterization.
pub const AREA_WALKABLE: u8 = 63;

/// Ground area ids assigned by post-processing or area volumes.
pub const AREA_GRASS: u8 = 1;
pub const AREA_WATER: u8 = 2;
pub const AREA_ROAD: u8 = 3;
pub const AREA_SAND: u8 = 4;
pub const AREA_GATE: u8 = 5;

/// Polygon flag for ground traversal.
pub const FLAG_WALK: u16 = 0x01;
/// Polygon flag for swimming traversal.
pub const FLAG_FLOAT: u16 = 0x02;
/// Polygon flag granting passage to every agent class.
pub const FLAG_ALL_PLAYERS: u16 = 0x8000;
