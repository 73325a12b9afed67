//! Immutable source geometry with a chunked spatial index.
//!
//! Tile builds only ever ask one spatial question: which triangles overlap
//! this tile's XZ rectangle? A uniform chunk grid over the triangle soup
//! answers it without scanning the whole mesh.

use glam::Vec3;

use crate::{Error, Result};

/// Target number of triangles per chunk when sizing the index grid.
const TRIS_PER_CHUNK: usize = 256;

/// Convex XZ polygon volume that stamps an area id onto walkable cells
/// inside it during tile builds.
#[derive(Debug, Clone)]
pub struct AreaVolume {
    /// Polygon vertices; y is ignored, the vertical range comes from
    /// `hmin`/`hmax`
    pub verts: Vec<Vec3>,
    /// Bottom of the volume
    pub hmin: f32,
    /// Top of the volume
    pub hmax: f32,
    /// Area id stamped onto covered cells
    pub area: u8,
}

impl AreaVolume {
    /// Axis-aligned box volume.
    pub fn from_box(bmin: Vec3, bmax: Vec3, area: u8) -> Self {
        Self {
            verts: vec![
                Vec3::new(bmin.x, 0.0, bmin.z),
                Vec3::new(bmax.x, 0.0, bmin.z),
                Vec3::new(bmax.x, 0.0, bmax.z),
                Vec3::new(bmin.x, 0.0, bmax.z),
            ],
            hmin: bmin.y,
            hmax: bmax.y,
            area,
        }
    }

    /// Tests whether the XZ point lies inside the polygon.
    pub fn contains_xz(&self, x: f32, z: f32) -> bool {
        point_in_polygon_xz(x, z, &self.verts)
    }
}

/// Even-odd point-in-polygon test on the XZ plane.
pub fn point_in_polygon_xz(x: f32, z: f32, verts: &[Vec3]) -> bool {
    let mut inside = false;
    let n = verts.len();
    let mut j = n - 1;
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > z) != (vj.z > z))
            && (x < (vj.x - vi.x) * (z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

struct ChunkGrid {
    origin: [f32; 2],
    chunk_size: f32,
    cols: i32,
    rows: i32,
    // triangle indices per chunk, each list sorted ascending
    chunks: Vec<Vec<u32>>,
}

/// Triangle soup plus spatial index and attached area volumes.
pub struct WorldGeometry {
    verts: Vec<Vec3>,
    tris: Vec<[u32; 3]>,
    bmin: Vec3,
    bmax: Vec3,
    grid: ChunkGrid,
    volumes: Vec<AreaVolume>,
}

impl WorldGeometry {
    /// Builds the geometry and its spatial index.
    ///
    /// Fails on empty input, out-of-range indices or non-finite vertices.
    pub fn new(verts: Vec<Vec3>, tris: Vec<[u32; 3]>) -> Result<Self> {
        if verts.is_empty() {
            return Err(Error::InvalidGeometry("no vertices".to_string()));
        }
        if tris.is_empty() {
            return Err(Error::InvalidGeometry("no triangles".to_string()));
        }
        for v in &verts {
            if !v.is_finite() {
                return Err(Error::InvalidGeometry(
                    "non-finite vertex coordinate".to_string(),
                ));
            }
        }
        let vert_count = verts.len() as u32;
        for tri in &tris {
            if tri.iter().any(|&i| i >= vert_count) {
                return Err(Error::InvalidGeometry(format!(
                    "triangle index out of range (vertex count {vert_count})"
                )));
            }
        }

        let mut bmin = verts[0];
        let mut bmax = verts[0];
        for v in &verts[1..] {
            bmin = bmin.min(*v);
            bmax = bmax.max(*v);
        }

        let grid = ChunkGrid::build(&verts, &tris, bmin, bmax);

        Ok(Self {
            verts,
            tris,
            bmin,
            bmax,
            grid,
            volumes: Vec::new(),
        })
    }

    /// Attaches an area volume applied during subsequent tile builds.
    pub fn add_area_volume(&mut self, volume: AreaVolume) {
        self.volumes.push(volume);
    }

    /// World-space bounds of the geometry.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        (self.bmin, self.bmax)
    }

    pub fn verts(&self) -> &[Vec3] {
        &self.verts
    }

    pub fn triangles(&self) -> &[[u32; 3]] {
        &self.tris
    }

    pub fn volumes(&self) -> &[AreaVolume] {
        &self.volumes
    }

    /// Vertex positions of one triangle.
    pub fn triangle_verts(&self, tri: u32) -> [Vec3; 3] {
        let [a, b, c] = self.tris[tri as usize];
        [
            self.verts[a as usize],
            self.verts[b as usize],
            self.verts[c as usize],
        ]
    }

    /// Indices of triangles whose XZ bounds overlap the rectangle, in
    /// ascending order.
    pub fn triangles_overlapping_rect(&self, rmin: [f32; 2], rmax: [f32; 2]) -> Vec<u32> {
        self.grid.query(rmin, rmax)
    }
}

impl ChunkGrid {
    fn build(verts: &[Vec3], tris: &[[u32; 3]], bmin: Vec3, bmax: Vec3) -> Self {
        let extent_x = (bmax.x - bmin.x).max(f32::EPSILON);
        let extent_z = (bmax.z - bmin.z).max(f32::EPSILON);

        // Square-ish chunks sized so an average chunk holds a bounded
        // number of triangles.
        let target_chunks = (tris.len() / TRIS_PER_CHUNK).max(1);
        let side = (target_chunks as f32).sqrt().ceil() as i32;
        let cols = side.max(1);
        let rows = side.max(1);
        let chunk_size = (extent_x / cols as f32).max(extent_z / rows as f32);
        // Recompute counts so the grid covers the full extent with the
        // chosen square chunk size.
        let cols = (extent_x / chunk_size).ceil() as i32;
        let rows = (extent_z / chunk_size).ceil() as i32;

        let mut chunks = vec![Vec::new(); (cols * rows) as usize];
        for (idx, tri) in tris.iter().enumerate() {
            let a = verts[tri[0] as usize];
            let b = verts[tri[1] as usize];
            let c = verts[tri[2] as usize];
            let tmin = [a.x.min(b.x).min(c.x), a.z.min(b.z).min(c.z)];
            let tmax = [a.x.max(b.x).max(c.x), a.z.max(b.z).max(c.z)];

            let c0 = (((tmin[0] - bmin.x) / chunk_size) as i32).clamp(0, cols - 1);
            let c1 = (((tmax[0] - bmin.x) / chunk_size) as i32).clamp(0, cols - 1);
            let r0 = (((tmin[1] - bmin.z) / chunk_size) as i32).clamp(0, rows - 1);
            let r1 = (((tmax[1] - bmin.z) / chunk_size) as i32).clamp(0, rows - 1);
            for row in r0..=r1 {
                for col in c0..=c1 {
                    chunks[(row * cols + col) as usize].push(idx as u32);
                }
            }
        }

        Self {
            origin: [bmin.x, bmin.z],
            chunk_size,
            cols,
            rows,
            chunks,
        }
    }

    fn query(&self, rmin: [f32; 2], rmax: [f32; 2]) -> Vec<u32> {
        let c0 = ((rmin[0] - self.origin[0]) / self.chunk_size).floor() as i32;
        let c1 = ((rmax[0] - self.origin[0]) / self.chunk_size).floor() as i32;
        let r0 = ((rmin[1] - self.origin[1]) / self.chunk_size).floor() as i32;
        let r1 = ((rmax[1] - self.origin[1]) / self.chunk_size).floor() as i32;
        if c1 < 0 || r1 < 0 || c0 >= self.cols || r0 >= self.rows {
            return Vec::new();
        }
        let c0 = c0.clamp(0, self.cols - 1);
        let c1 = c1.clamp(0, self.cols - 1);
        let r0 = r0.clamp(0, self.rows - 1);
        let r1 = r1.clamp(0, self.rows - 1);

        let mut out = Vec::new();
        for row in r0..=r1 {
            for col in c0..=c1 {
                out.extend_from_slice(&self.chunks[(row * self.cols + col) as usize]);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_geometry() -> WorldGeometry {
        let verts = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::new(10.0, 0.0, 10.0),
            Vec3::new(0.0, 0.0, 10.0),
        ];
        WorldGeometry::new(verts, vec![[0, 2, 1], [0, 3, 2]]).unwrap()
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(WorldGeometry::new(vec![], vec![[0, 1, 2]]).is_err());
        assert!(WorldGeometry::new(vec![Vec3::ZERO], vec![]).is_err());
        assert!(WorldGeometry::new(vec![Vec3::ZERO], vec![[0, 0, 1]]).is_err());
        assert!(
            WorldGeometry::new(vec![Vec3::new(f32::NAN, 0.0, 0.0)], vec![[0, 0, 0]]).is_err()
        );
    }

    #[test]
    fn test_bounds() {
        let geom = quad_geometry();
        let (bmin, bmax) = geom.bounds();
        assert_eq!(bmin, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(bmax, Vec3::new(10.0, 0.0, 10.0));
    }

    #[test]
    fn test_query_covers_and_misses() {
        let geom = quad_geometry();
        let all = geom.triangles_overlapping_rect([-1.0, -1.0], [11.0, 11.0]);
        assert_eq!(all, vec![0, 1]);

        let none = geom.triangles_overlapping_rect([50.0, 50.0], [60.0, 60.0]);
        assert!(none.is_empty());
    }

    #[test]
    fn test_query_deterministic_order() {
        let geom = quad_geometry();
        let a = geom.triangles_overlapping_rect([0.0, 0.0], [10.0, 10.0]);
        let b = geom.triangles_overlapping_rect([0.0, 0.0], [10.0, 10.0]);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_point_in_polygon() {
        let volume = AreaVolume::from_box(
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(4.0, 1.0, 4.0),
            crate::AREA_WATER,
        );
        assert!(volume.contains_xz(3.0, 3.0));
        assert!(!volume.contains_xz(5.0, 3.0));
        assert!(!volume.contains_xz(3.0, 1.0));
    }
}
