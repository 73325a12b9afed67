//! Binary snapshot of a whole tile set.
//!
//! Layout, all little-endian: set header (magic, version, tile count),
//! the mesh parameters, the full grid configuration, then one record per
//! stored tile (reference, blob length, blob bytes). Loading re-adds every
//! blob under fresh references and rebuilds the walkable mesh before
//! returning, so a loaded set is immediately usable.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use glam::Vec3;

use crate::compressor::TileCompressor;
use crate::grid::TileGridConfig;
use crate::mesh::{MeshProcess, NavMesh};
use crate::tile_cache::TileCache;
use crate::{Error, Result};

/// Identifies a serialized tile set ('TSET' stored little-endian).
pub const TILE_SET_MAGIC: i32 = 0x54534554;
/// Current tile set format version.
pub const TILE_SET_VERSION: i32 = 1;

fn write_i32<W: Write>(w: &mut W, v: i32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f32<W: Write>(w: &mut W, v: f32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_vec3<W: Write>(w: &mut W, v: Vec3) -> Result<()> {
    write_f32(w, v.x)?;
    write_f32(w, v.y)?;
    write_f32(w, v.z)
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_vec3<R: Read>(r: &mut R) -> Result<Vec3> {
    Ok(Vec3::new(read_f32(r)?, read_f32(r)?, read_f32(r)?))
}

fn write_config<W: Write>(w: &mut W, c: &TileGridConfig) -> Result<()> {
    write_vec3(w, c.bmin)?;
    write_vec3(w, c.bmax)?;
    write_f32(w, c.cs)?;
    write_f32(w, c.ch)?;
    write_i32(w, c.grid_width)?;
    write_i32(w, c.grid_height)?;
    write_i32(w, c.tile_size)?;
    write_i32(w, c.border_size)?;
    write_i32(w, c.tile_px)?;
    write_i32(w, c.tile_count_x)?;
    write_i32(w, c.tile_count_y)?;
    write_f32(w, c.tile_world_size)?;
    write_i32(w, c.walkable_height)?;
    write_i32(w, c.walkable_climb)?;
    write_i32(w, c.walkable_radius)?;
    write_f32(w, c.walkable_slope_deg)?;
    write_i32(w, c.max_obstacles)?;
    write_i32(w, c.max_layers_per_tile)?;
    write_u32(w, c.tile_index_bits)?;
    write_u32(w, c.poly_index_bits)?;
    write_i32(w, c.max_tiles)?;
    write_i32(w, c.max_polys_per_tile)
}

fn read_config<R: Read>(r: &mut R) -> Result<TileGridConfig> {
    let config = TileGridConfig {
        bmin: read_vec3(r)?,
        bmax: read_vec3(r)?,
        cs: read_f32(r)?,
        ch: read_f32(r)?,
        grid_width: read_i32(r)?,
        grid_height: read_i32(r)?,
        tile_size: read_i32(r)?,
        border_size: read_i32(r)?,
        tile_px: read_i32(r)?,
        tile_count_x: read_i32(r)?,
        tile_count_y: read_i32(r)?,
        tile_world_size: read_f32(r)?,
        walkable_height: read_i32(r)?,
        walkable_climb: read_i32(r)?,
        walkable_radius: read_i32(r)?,
        walkable_slope_deg: read_f32(r)?,
        max_obstacles: read_i32(r)?,
        max_layers_per_tile: read_i32(r)?,
        tile_index_bits: read_u32(r)?,
        poly_index_bits: read_u32(r)?,
        max_tiles: read_i32(r)?,
        max_polys_per_tile: read_i32(r)?,
    };
    if config.tile_index_bits + config.poly_index_bits != 22
        || config.tile_index_bits > 14
        || config.max_tiles != 1 << config.tile_index_bits
    {
        return Err(Error::Format(
            "stored grid configuration is inconsistent".to_string(),
        ));
    }
    if config.cs <= 0.0 || config.ch <= 0.0 || config.tile_count_x <= 0 || config.tile_count_y <= 0
    {
        return Err(Error::Format(
            "stored grid configuration is invalid".to_string(),
        ));
    }
    Ok(config)
}

/// Serializes the cache's configuration and every stored tile.
pub fn save_tile_set<W: Write>(writer: &mut W, cache: &TileCache) -> Result<()> {
    let config = cache.config();
    write_i32(writer, TILE_SET_MAGIC)?;
    write_i32(writer, TILE_SET_VERSION)?;
    write_i32(writer, cache.tile_count() as i32)?;

    // Mesh parameters, derivable from the grid but part of the set format.
    write_vec3(writer, config.bmin)?;
    write_f32(writer, config.tile_world_size)?;
    write_f32(writer, config.tile_world_size)?;
    write_i32(writer, config.max_tiles)?;
    write_i32(writer, config.max_polys_per_tile)?;

    write_config(writer, config)?;

    for (r, entry) in cache.iter_tiles() {
        write_u32(writer, r)?;
        write_i32(writer, entry.data.len() as i32)?;
        writer.write_all(&entry.data)?;
    }
    Ok(())
}

/// Restores a tile set saved by [`save_tile_set`].
///
/// The magic and version must match exactly; nothing is constructed
/// otherwise. Tiles come back under fresh references and every position is
/// rebuilt into the returned mesh.
pub fn load_tile_set<R: Read>(
    reader: &mut R,
    compressor: Arc<dyn TileCompressor>,
    process: Arc<dyn MeshProcess>,
) -> Result<(TileCache, NavMesh)> {
    let magic = read_i32(reader)?;
    if magic != TILE_SET_MAGIC {
        return Err(Error::Format(format!("bad tile set magic 0x{magic:08X}")));
    }
    let version = read_i32(reader)?;
    if version != TILE_SET_VERSION {
        return Err(Error::Format(format!(
            "unsupported tile set version {version}"
        )));
    }
    let tile_count = read_i32(reader)?;
    if tile_count < 0 {
        return Err(Error::Format(format!("negative tile count {tile_count}")));
    }

    let mesh_origin = read_vec3(reader)?;
    let _tile_width = read_f32(reader)?;
    let _tile_height = read_f32(reader)?;
    let mesh_max_tiles = read_i32(reader)?;
    let mesh_max_polys = read_i32(reader)?;

    let config = read_config(reader)?;
    if mesh_origin != config.bmin
        || mesh_max_tiles != config.max_tiles
        || mesh_max_polys != config.max_polys_per_tile
    {
        return Err(Error::Format(
            "mesh parameters disagree with the stored grid".to_string(),
        ));
    }

    let mut cache = TileCache::new(config, compressor, process);
    let mut nav = NavMesh::for_grid(cache.config())?;

    for _ in 0..tile_count {
        let _stored_ref = read_u32(reader)?;
        let size = read_i32(reader)?;
        if size <= 0 {
            return Err(Error::Format(format!("invalid tile record size {size}")));
        }
        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data)?;
        cache.add_tile(data)?;
    }

    let mut positions: Vec<(i32, i32)> = cache
        .iter_tiles()
        .map(|(_, e)| (e.header.tx, e.header.ty))
        .collect();
    positions.sort_unstable();
    positions.dedup();
    for (tx, ty) in positions {
        cache.build_nav_mesh_tiles_at(tx, ty, &mut nav)?;
    }

    log::debug!("loaded tile set: {} tiles", cache.tile_count());
    Ok((cache, nav))
}

/// Saves a tile set to a file.
pub fn save_to_path<P: AsRef<Path>>(path: P, cache: &TileCache) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    save_tile_set(&mut writer, cache)?;
    writer.flush()?;
    Ok(())
}

/// Loads a tile set from a file.
pub fn load_from_path<P: AsRef<Path>>(
    path: P,
    compressor: Arc<dyn TileCompressor>,
    process: Arc<dyn MeshProcess>,
) -> Result<(TileCache, NavMesh)> {
    let mut reader = BufReader::new(File::open(path)?);
    load_tile_set(&mut reader, compressor, process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Lz4Compressor;
    use crate::grid::TileGridParams;
    use crate::layer::{self, encode_layer, TileLayerHeader, LAYER_MAGIC, LAYER_VERSION};
    use crate::mesh::DefaultMeshProcess;
    use crate::AREA_WALKABLE;

    fn test_cache() -> TileCache {
        let config = TileGridConfig::configure(&TileGridParams {
            bmin: Vec3::new(0.0, -2.0, 0.0),
            bmax: Vec3::new(40.0, 2.0, 40.0),
            ..Default::default()
        })
        .unwrap();
        TileCache::new(
            config,
            Arc::new(Lz4Compressor),
            Arc::new(DefaultMeshProcess),
        )
    }

    fn flat_blob(config: &TileGridConfig, tx: i32, ty: i32) -> Vec<u8> {
        let size = config.tile_size as u8;
        let n = size as usize * size as usize;
        let (bmin, bmax) = config.tile_bounds(tx, ty);
        let header = TileLayerHeader {
            magic: LAYER_MAGIC,
            version: LAYER_VERSION,
            tx,
            ty,
            tlayer: 0,
            bmin: [bmin.x, 0.0, bmin.z],
            bmax: [bmax.x, 0.5, bmax.z],
            hmin: 5,
            hmax: 5,
            width: size,
            height: size,
            minx: 0,
            maxx: size - 1,
            miny: 0,
            maxy: size - 1,
        };
        let mut payload = vec![0u8; n * 3];
        payload[n..n * 2].fill(AREA_WALKABLE);
        encode_layer(&header, &payload, &Lz4Compressor).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let mut cache = test_cache();
        let config = cache.config().clone();
        cache.add_tile(flat_blob(&config, 0, 0)).unwrap();
        cache.add_tile(flat_blob(&config, 2, 1)).unwrap();

        let mut buf = Vec::new();
        save_tile_set(&mut buf, &cache).unwrap();

        let (loaded, nav) = load_tile_set(
            &mut buf.as_slice(),
            Arc::new(Lz4Compressor),
            Arc::new(DefaultMeshProcess),
        )
        .unwrap();

        assert_eq!(loaded.config(), cache.config());
        assert_eq!(loaded.tile_count(), 2);
        for (tx, ty) in [(0, 0), (2, 1)] {
            let a = cache.get_tile(cache.tile_ref_at(tx, ty, 0).unwrap()).unwrap();
            let b = loaded
                .get_tile(loaded.tile_ref_at(tx, ty, 0).unwrap())
                .unwrap();
            assert_eq!(a.header, b.header);
            let da = layer::decode_layer(&a.data, &Lz4Compressor).unwrap();
            let db = layer::decode_layer(&b.data, &Lz4Compressor).unwrap();
            assert_eq!(da, db);
            // Mesh is rebuilt for every loaded position.
            assert!(nav.tile_at(tx, ty, 0).is_some());
        }
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut cache = test_cache();
        let config = cache.config().clone();
        cache.add_tile(flat_blob(&config, 0, 0)).unwrap();

        let mut buf = Vec::new();
        save_tile_set(&mut buf, &cache).unwrap();

        let mut bad = buf.clone();
        bad[0] ^= 0xff;
        assert!(matches!(
            load_tile_set(
                &mut bad.as_slice(),
                Arc::new(Lz4Compressor),
                Arc::new(DefaultMeshProcess)
            ),
            Err(Error::Format(_))
        ));

        let mut bad = buf.clone();
        bad[4] = 42;
        assert!(matches!(
            load_tile_set(
                &mut bad.as_slice(),
                Arc::new(Lz4Compressor),
                Arc::new(DefaultMeshProcess)
            ),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_truncated_stream() {
        let mut cache = test_cache();
        let config = cache.config().clone();
        cache.add_tile(flat_blob(&config, 0, 0)).unwrap();

        let mut buf = Vec::new();
        save_tile_set(&mut buf, &cache).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(matches!(
            load_tile_set(
                &mut buf.as_slice(),
                Arc::new(Lz4Compressor),
                Arc::new(DefaultMeshProcess)
            ),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_path_round_trip() {
        let mut cache = test_cache();
        let config = cache.config().clone();
        cache.add_tile(flat_blob(&config, 1, 1)).unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        save_to_path(file.path(), &cache).unwrap();
        let (loaded, _nav) = load_from_path(
            file.path(),
            Arc::new(Lz4Compressor),
            Arc::new(DefaultMeshProcess),
        )
        .unwrap();
        assert_eq!(loaded.tile_count(), 1);
        assert!(loaded.tile_ref_at(1, 1, 0).is_some());
    }
}
