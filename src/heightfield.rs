//! Span heightfield rasterization and walkability filtering.
//!
//! One heightfield covers one padded tile. Triangles are clipped into grid
//! cells by successive polygon division along rows and columns, producing
//! solid spans per column. Filters then knock out spans an agent cannot
//! stand on, and the surviving floors are extracted into dense layer grids
//! ready for compression.

use glam::Vec3;

use crate::{AREA_NULL, AREA_WALKABLE};

/// Sentinel height for empty layer cells.
pub const NO_HEIGHT: u8 = 0xff;

const MAX_SPAN_HEIGHT: i32 = u16::MAX as i32;

/// Solid vertical span in a heightfield column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Bottom of the span in cell units
    pub smin: u16,
    /// Top of the span in cell units
    pub smax: u16,
    /// Area id of the top surface
    pub area: u8,
}

/// Axis used when dividing polygons during rasterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Z,
}

/// Column-major span heightfield over one padded tile.
pub struct Heightfield {
    pub width: i32,
    pub height: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    columns: Vec<Vec<Span>>,
}

impl Heightfield {
    pub fn new(width: i32, height: i32, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Self {
        Self {
            width,
            height,
            bmin,
            bmax,
            cs,
            ch,
            columns: vec![Vec::new(); (width * height) as usize],
        }
    }

    /// Spans of the column at `(x, z)`, ordered bottom to top.
    pub fn column(&self, x: i32, z: i32) -> &[Span] {
        &self.columns[(z * self.width + x) as usize]
    }

    /// Total span count, mostly useful for diagnostics.
    pub fn span_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    /// Inserts a span, merging it with any overlapping spans in the column.
    ///
    /// When merged span tops land within `merge_thr` cells of each other the
    /// higher area id wins, so a walkable surface is not lost to a sliver of
    /// null area at the same height.
    pub fn add_span(&mut self, x: i32, z: i32, smin: u16, smax: u16, area: u8, merge_thr: i32) {
        let col = &mut self.columns[(z * self.width + x) as usize];
        let mut smin = smin;
        let mut smax = smax;
        let mut area = area;

        let mut i = 0;
        while i < col.len() {
            let s = col[i];
            if s.smin > smax {
                break;
            }
            if s.smax < smin {
                i += 1;
                continue;
            }
            smin = smin.min(s.smin);
            if (s.smax as i32 - smax as i32).abs() <= merge_thr {
                area = area.max(s.area);
            }
            smax = smax.max(s.smax);
            col.remove(i);
        }
        col.insert(i, Span { smin, smax, area });
    }

    /// Rasterizes one triangle into the heightfield.
    pub fn rasterize_triangle(&mut self, v0: Vec3, v1: Vec3, v2: Vec3, area: u8, merge_thr: i32) {
        let tmin = v0.min(v1).min(v2);
        let tmax = v0.max(v1).max(v2);
        if tmax.x < self.bmin.x
            || tmin.x > self.bmax.x
            || tmax.z < self.bmin.z
            || tmin.z > self.bmax.z
        {
            return;
        }

        let ics = 1.0 / self.cs;
        let ich = 1.0 / self.ch;
        let by = self.bmax.y - self.bmin.y;

        // Footprint rows; z0 may start one row below the grid so the first
        // division still consumes geometry south of it.
        let z0 = (((tmin.z - self.bmin.z) * ics).floor() as i32).clamp(-1, self.height - 1);
        let z1 = (((tmax.z - self.bmin.z) * ics).floor() as i32).clamp(0, self.height - 1);

        let mut rest: Vec<Vec3> = vec![v0, v1, v2];
        for z in z0..=z1 {
            if rest.len() < 3 {
                break;
            }
            let row_edge = self.bmin.z + (z + 1) as f32 * self.cs;
            let (row, remainder) = divide_poly(&rest, row_edge, Axis::Z);
            rest = remainder;
            if z < 0 || row.len() < 3 {
                continue;
            }

            let mut rminx = row[0].x;
            let mut rmaxx = row[0].x;
            for v in &row[1..] {
                rminx = rminx.min(v.x);
                rmaxx = rmaxx.max(v.x);
            }
            let x0 = (((rminx - self.bmin.x) * ics).floor() as i32).clamp(-1, self.width - 1);
            let x1 = (((rmaxx - self.bmin.x) * ics).floor() as i32).clamp(0, self.width - 1);

            let mut row_rest = row;
            for x in x0..=x1 {
                if row_rest.len() < 3 {
                    break;
                }
                let col_edge = self.bmin.x + (x + 1) as f32 * self.cs;
                let (cell, remainder) = divide_poly(&row_rest, col_edge, Axis::X);
                row_rest = remainder;
                if x < 0 || cell.len() < 3 {
                    continue;
                }

                let mut ymin = cell[0].y;
                let mut ymax = cell[0].y;
                for v in &cell[1..] {
                    ymin = ymin.min(v.y);
                    ymax = ymax.max(v.y);
                }
                ymin -= self.bmin.y;
                ymax -= self.bmin.y;
                if ymax < 0.0 || ymin > by {
                    continue;
                }
                let ymin = ymin.max(0.0);
                let ymax = ymax.min(by);

                let smin = ((ymin * ich).floor() as i32).clamp(0, MAX_SPAN_HEIGHT - 1);
                let smax = ((ymax * ich).ceil() as i32).clamp(smin + 1, MAX_SPAN_HEIGHT);
                self.add_span(x, z, smin as u16, smax as u16, area, merge_thr);
            }
        }
    }

    /// Re-marks low obstacles as walkable when an agent can step onto them
    /// from the walkable span below.
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb: i32) {
        for col in &mut self.columns {
            let mut prev_walkable = false;
            let mut prev_area = AREA_NULL;
            let mut prev_max = 0i32;
            for s in col.iter_mut() {
                let walkable = s.area != AREA_NULL;
                if !walkable
                    && prev_walkable
                    && (s.smax as i32 - prev_max).abs() <= walkable_climb
                {
                    s.area = prev_area;
                }
                prev_walkable = walkable;
                prev_area = s.area;
                prev_max = s.smax as i32;
            }
        }
    }

    /// Nulls spans whose floor drops further than the agent can climb down
    /// toward any of the four neighbor columns.
    pub fn filter_ledge_spans(&mut self, walkable_height: i32, walkable_climb: i32) {
        const DIRS: [(i32, i32); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];

        for z in 0..self.height {
            for x in 0..self.width {
                let col_idx = (z * self.width + x) as usize;
                for i in 0..self.columns[col_idx].len() {
                    let s = self.columns[col_idx][i];
                    if s.area == AREA_NULL {
                        continue;
                    }
                    let bot = s.smax as i32;
                    let top = self.columns[col_idx]
                        .get(i + 1)
                        .map(|n| n.smin as i32)
                        .unwrap_or(MAX_SPAN_HEIGHT);

                    let mut minh = MAX_SPAN_HEIGHT;
                    for (dx, dz) in DIRS {
                        let nx = x + dx;
                        let nz = z + dz;
                        if nx < 0 || nz < 0 || nx >= self.width || nz >= self.height {
                            minh = minh.min(-walkable_climb - 1);
                            continue;
                        }
                        let ncol = &self.columns[(nz * self.width + nx) as usize];

                        // Gap below the first neighbor span counts as floor.
                        let mut nbot = -walkable_climb;
                        let mut ntop = ncol.first().map(|n| n.smin as i32).unwrap_or(MAX_SPAN_HEIGHT);
                        if top.min(ntop) - bot.max(nbot) > walkable_height {
                            minh = minh.min(nbot - bot);
                        }
                        for (k, ns) in ncol.iter().enumerate() {
                            nbot = ns.smax as i32;
                            ntop = ncol
                                .get(k + 1)
                                .map(|n| n.smin as i32)
                                .unwrap_or(MAX_SPAN_HEIGHT);
                            if top.min(ntop) - bot.max(nbot) > walkable_height {
                                minh = minh.min(nbot - bot);
                            }
                        }
                    }

                    if minh < -walkable_climb {
                        self.columns[col_idx][i].area = AREA_NULL;
                    }
                }
            }
        }
    }

    /// Nulls spans without enough clearance above them for the agent.
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: i32) {
        for col in &mut self.columns {
            for i in 0..col.len() {
                let top = col
                    .get(i + 1)
                    .map(|n| n.smin as i32)
                    .unwrap_or(MAX_SPAN_HEIGHT);
                let s = &mut col[i];
                if top - s.smax as i32 <= walkable_height {
                    s.area = AREA_NULL;
                }
            }
        }
    }

    /// Extracts walkable floors into dense layer grids, bottom floor first.
    ///
    /// Layer `k` collects the k-th walkable span of every column. Floors
    /// more than 254 cells above the layer's lowest floor cannot be encoded
    /// and are dropped from that layer.
    pub fn build_layers(&self, walkable_climb: i32, max_layers: usize) -> Vec<HeightfieldLayer> {
        let cell_count = (self.width * self.height) as usize;
        let mut layers = Vec::new();

        for layer_idx in 0..max_layers {
            let mut floors: Vec<Option<(u16, u8)>> = vec![None; cell_count];
            let mut any = false;
            let mut hmin = u16::MAX;
            let mut hmax = 0u16;

            for (ci, col) in self.columns.iter().enumerate() {
                let mut walkable_rank = 0;
                for s in col {
                    if s.area == AREA_NULL {
                        continue;
                    }
                    if walkable_rank == layer_idx {
                        floors[ci] = Some((s.smax, s.area));
                        hmin = hmin.min(s.smax);
                        hmax = hmax.max(s.smax);
                        any = true;
                        break;
                    }
                    walkable_rank += 1;
                }
            }
            if !any {
                break;
            }

            let mut heights = vec![NO_HEIGHT; cell_count];
            let mut areas = vec![AREA_NULL; cell_count];
            for ci in 0..cell_count {
                if let Some((floor, area)) = floors[ci] {
                    let rel = (floor - hmin) as i32;
                    if rel < NO_HEIGHT as i32 {
                        heights[ci] = rel as u8;
                        areas[ci] = area;
                    }
                }
            }

            let mut layer = HeightfieldLayer {
                width: self.width,
                height: self.height,
                hmin,
                hmax,
                heights,
                areas,
                cons: vec![0; cell_count],
            };
            layer.update_connections(walkable_climb);
            layers.push(layer);
        }

        layers
    }
}

/// Splits a convex polygon along an axis-aligned edge. The first result
/// lies at or below `offset` on the axis, the second at or above it.
fn divide_poly(poly: &[Vec3], offset: f32, axis: Axis) -> (Vec<Vec3>, Vec<Vec3>) {
    let get = |v: Vec3| match axis {
        Axis::X => v.x,
        Axis::Z => v.z,
    };
    let d: Vec<f32> = poly.iter().map(|&v| offset - get(v)).collect();

    let mut low = Vec::with_capacity(poly.len() + 1);
    let mut high = Vec::with_capacity(poly.len() + 1);
    let n = poly.len();
    let mut j = n - 1;
    for i in 0..n {
        let same_side = (d[i] >= 0.0) == (d[j] >= 0.0);
        if !same_side {
            let t = d[j] / (d[j] - d[i]);
            let v = poly[j] + (poly[i] - poly[j]) * t;
            low.push(v);
            high.push(v);
            if d[i] > 0.0 {
                low.push(poly[i]);
            } else if d[i] < 0.0 {
                high.push(poly[i]);
            }
        } else if d[i] >= 0.0 {
            low.push(poly[i]);
            if d[i] == 0.0 {
                high.push(poly[i]);
            }
        } else {
            high.push(poly[i]);
        }
        j = i;
    }
    (low, high)
}

/// One extracted floor of a heightfield: dense height, area and neighbor
/// connectivity grids relative to `hmin`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightfieldLayer {
    pub width: i32,
    pub height: i32,
    /// Lowest floor in the layer, in cell units
    pub hmin: u16,
    /// Highest floor in the layer, in cell units
    pub hmax: u16,
    /// Floor height above `hmin` per cell, `NO_HEIGHT` when empty
    pub heights: Vec<u8>,
    /// Area id per cell
    pub areas: Vec<u8>,
    /// 4-bit neighbor reachability mask per cell (-x, +z, +x, -z)
    pub cons: Vec<u8>,
}

impl HeightfieldLayer {
    /// True when the cell holds a walkable floor.
    pub fn is_walkable(&self, x: i32, z: i32) -> bool {
        let i = (z * self.width + x) as usize;
        self.heights[i] != NO_HEIGHT && self.areas[i] != AREA_NULL
    }

    /// Recomputes the neighbor reachability masks.
    pub fn update_connections(&mut self, walkable_climb: i32) {
        const DIRS: [(i32, i32); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];
        for z in 0..self.height {
            for x in 0..self.width {
                let i = (z * self.width + x) as usize;
                if self.heights[i] == NO_HEIGHT {
                    self.cons[i] = 0;
                    continue;
                }
                let mut con = 0u8;
                for (dir, (dx, dz)) in DIRS.iter().enumerate() {
                    let nx = x + dx;
                    let nz = z + dz;
                    if nx < 0 || nz < 0 || nx >= self.width || nz >= self.height {
                        continue;
                    }
                    let ni = (nz * self.width + nx) as usize;
                    if self.heights[ni] == NO_HEIGHT {
                        continue;
                    }
                    let dh = self.heights[i] as i32 - self.heights[ni] as i32;
                    if dh.abs() <= walkable_climb {
                        con |= 1 << dir;
                    }
                }
                self.cons[i] = con;
            }
        }
    }

    /// Erodes walkable area away from unwalkable cells and grid edges by
    /// the agent radius, using a two-pass chamfer distance in half-cell
    /// units (2 straight, 3 diagonal).
    pub fn erode_walkable_area(&mut self, radius: i32) {
        let w = self.width;
        let h = self.height;
        let mut dist = vec![i32::MAX / 4; (w * h) as usize];

        for z in 0..h {
            for x in 0..w {
                let i = (z * w + x) as usize;
                if self.heights[i] == NO_HEIGHT || self.areas[i] == AREA_NULL {
                    dist[i] = 0;
                }
            }
        }

        let sample = |dist: &[i32], x: i32, z: i32| -> i32 {
            if x < 0 || z < 0 || x >= w || z >= h {
                // Beyond the grid counts as unwalkable.
                0
            } else {
                dist[(z * w + x) as usize]
            }
        };

        // Forward pass
        for z in 0..h {
            for x in 0..w {
                let i = (z * w + x) as usize;
                let mut d = dist[i];
                d = d.min(sample(&dist, x - 1, z) + 2);
                d = d.min(sample(&dist, x - 1, z - 1) + 3);
                d = d.min(sample(&dist, x, z - 1) + 2);
                d = d.min(sample(&dist, x + 1, z - 1) + 3);
                dist[i] = d;
            }
        }
        // Backward pass
        for z in (0..h).rev() {
            for x in (0..w).rev() {
                let i = (z * w + x) as usize;
                let mut d = dist[i];
                d = d.min(sample(&dist, x + 1, z) + 2);
                d = d.min(sample(&dist, x + 1, z + 1) + 3);
                d = d.min(sample(&dist, x, z + 1) + 2);
                d = d.min(sample(&dist, x - 1, z + 1) + 3);
                dist[i] = d;
            }
        }

        let threshold = radius * 2;
        for i in 0..(w * h) as usize {
            if dist[i] < threshold && self.areas[i] != AREA_NULL {
                self.areas[i] = AREA_NULL;
            }
        }
    }

    /// Stamps an area volume onto covered walkable cells.
    pub fn mark_volume(
        &mut self,
        bmin: Vec3,
        cs: f32,
        ch: f32,
        volume: &crate::geometry::AreaVolume,
    ) {
        for z in 0..self.height {
            for x in 0..self.width {
                let i = (z * self.width + x) as usize;
                if self.heights[i] == NO_HEIGHT || self.areas[i] == AREA_NULL {
                    continue;
                }
                let wx = bmin.x + (x as f32 + 0.5) * cs;
                let wz = bmin.z + (z as f32 + 0.5) * cs;
                let wy = bmin.y + (self.hmin as i32 + self.heights[i] as i32) as f32 * ch;
                if wy >= volume.hmin && wy <= volume.hmax && volume.contains_xz(wx, wz) {
                    self.areas[i] = volume.area;
                }
            }
        }
    }

    /// Bounding box of non-empty cells, or `None` for an empty layer.
    pub fn data_bounds(&self) -> Option<(i32, i32, i32, i32)> {
        let mut bounds: Option<(i32, i32, i32, i32)> = None;
        for z in 0..self.height {
            for x in 0..self.width {
                if self.heights[(z * self.width + x) as usize] == NO_HEIGHT {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (x, x, z, z),
                    Some((minx, maxx, minz, maxz)) => {
                        (minx.min(x), maxx.max(x), minz.min(z), maxz.max(z))
                    }
                });
            }
        }
        bounds
    }
}

/// Marks a triangle walkable when its slope stays under the limit.
pub fn mark_walkable_triangle(v0: Vec3, v1: Vec3, v2: Vec3, max_slope_deg: f32) -> u8 {
    let normal = (v1 - v0).cross(v2 - v0);
    let len = normal.length();
    if len <= f32::EPSILON {
        return AREA_NULL;
    }
    let ny = normal.y / len;
    if ny > max_slope_deg.to_radians().cos() {
        AREA_WALKABLE
    } else {
        AREA_NULL
    }
}
