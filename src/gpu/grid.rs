//! GPU spatial index
//!
//! A fixed-capacity flat array per cell with an atomic insertion counter.
//! Two compute passes rebuild it (clear, build); neighbour traversal is a
//! ring walk exposed to fragments as a stateful cursor
//! (`neighbor_iter_init` / `neighbor_iter_next`).
//!
//! [`AtomicGrid`] and [`RingCursor`] replay the same algorithm on the host so
//! the traversal can be tested without a device.

use bytemuck::{Pod, Zeroable};
use glam::{IVec2, Vec2};

use crate::consts::NEIGHBOR_END;
use crate::sim::particle::Particle;
use crate::sim::spatial::GridBounds;

/// Grid configuration uniform (must match WGSL `GridConfig`)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GridConfig {
    pub origin: [f32; 2], // offset 0
    pub cell_size: f32,   // offset 8
    pub max_per_cell: u32, // offset 12
    pub cols: u32,        // offset 16
    pub rows: u32,        // offset 20
    pub _pad: [u32; 2],   // offset 24, total 32
}

impl GridConfig {
    pub fn new(bounds: &GridBounds, max_per_cell: u32) -> Self {
        Self {
            origin: bounds.origin.to_array(),
            cell_size: bounds.cell_size,
            max_per_cell: max_per_cell.max(1),
            cols: bounds.cols,
            rows: bounds.rows,
            _pad: [0; 2],
        }
    }

    pub fn cell_count(&self) -> u32 {
        self.cols * self.rows
    }
}

/// Offset of cell `k` on ring `ring` around the centre (ring 0 is the centre)
///
/// Ring `r > 0` has `8r` cells walked counter-clockwise from the lower-left
/// corner, so every cell of the square is visited exactly once.
pub fn ring_offset(ring: i32, k: i32) -> IVec2 {
    if ring == 0 {
        return IVec2::ZERO;
    }
    let side = 2 * ring;
    let t = k % side;
    match k / side {
        0 => IVec2::new(-ring + t, -ring),
        1 => IVec2::new(ring, -ring + t),
        2 => IVec2::new(ring - t, ring),
        _ => IVec2::new(-ring, ring - t),
    }
}

#[inline]
pub fn ring_len(ring: i32) -> i32 {
    if ring == 0 { 1 } else { 8 * ring }
}

/// WGSL for the index: config struct, build/clear entry points and the cursor.
///
/// Expects `particles`, `particles_prev`, `sim`, `grid`, `grid_counts` and
/// `grid_cells` to be declared. `grid_counts` carries one extra trailing slot
/// that counts dropped insertions.
pub fn grid_wgsl(workgroup_size: u32) -> String {
    format!(
        r#"struct GridConfig {{
    origin: vec2<f32>,
    cell_size: f32,
    max_per_cell: u32,
    cols: u32,
    rows: u32,
    _pad0: u32,
    _pad1: u32,
}}

fn grid_cell_coords(position: vec2<f32>) -> vec2<i32> {{
    let c = floor((position - grid.origin) / grid.cell_size);
    return vec2<i32>(
        clamp(i32(c.x), 0, i32(grid.cols) - 1),
        clamp(i32(c.y), 0, i32(grid.rows) - 1),
    );
}}

fn grid_flat(cell: vec2<i32>) -> u32 {{
    return u32(cell.y) * grid.cols + u32(cell.x);
}}

@compute @workgroup_size({workgroup_size})
fn clear_grid(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i <= grid.cols * grid.rows) {{
        atomicStore(&grid_counts[i], 0u);
    }}
}}

@compute @workgroup_size({workgroup_size})
fn build_grid(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let i = gid.x;
    if (i >= sim.particle_count) {{ return; }}
    let p = particles[i];
    if (p.mass == 0.0) {{ return; }}
    let cell = grid_flat(grid_cell_coords(p.position));
    let slot = atomicAdd(&grid_counts[cell], 1u);
    if (slot < grid.max_per_cell) {{
        grid_cells[cell * grid.max_per_cell + slot] = i;
    }} else {{
        atomicAdd(&grid_counts[grid.cols * grid.rows], 1u);
    }}
}}

struct NeighborCursor {{
    point: vec2<f32>,
    radius_sq: f32,
    center: vec2<i32>,
    ring: i32,
    max_ring: i32,
    k: i32,
    cell: i32,
    slot: u32,
}}

fn ring_offset(ring: i32, k: i32) -> vec2<i32> {{
    if (ring == 0) {{ return vec2<i32>(0, 0); }}
    let side = 2 * ring;
    let t = k % side;
    switch (k / side) {{
        case 0: {{ return vec2<i32>(-ring + t, -ring); }}
        case 1: {{ return vec2<i32>(ring, -ring + t); }}
        case 2: {{ return vec2<i32>(ring - t, ring); }}
        default: {{ return vec2<i32>(-ring, ring - t); }}
    }}
}}

fn neighbor_iter_init(point: vec2<f32>, radius: f32) -> NeighborCursor {{
    var cursor: NeighborCursor;
    cursor.point = point;
    cursor.radius_sq = radius * radius;
    cursor.center = grid_cell_coords(point);
    cursor.ring = 0;
    // The centre is clamped inside the grid, so no ring past the widest axis holds cells
    let widest = f32(max(grid.cols, grid.rows));
    cursor.max_ring = i32(min(ceil(max(radius, 0.0) / grid.cell_size), widest));
    cursor.k = 0;
    cursor.cell = -1;
    cursor.slot = 0u;
    return cursor;
}}

fn neighbor_iter_next(cursor: ptr<function, NeighborCursor>) -> u32 {{
    loop {{
        if ((*cursor).cell >= 0) {{
            let cell = u32((*cursor).cell);
            let count = min(atomicLoad(&grid_counts[cell]), grid.max_per_cell);
            while ((*cursor).slot < count) {{
                let idx = grid_cells[cell * grid.max_per_cell + (*cursor).slot];
                (*cursor).slot += 1u;
                let d = particles_prev[idx].position - (*cursor).point;
                if (dot(d, d) <= (*cursor).radius_sq) {{
                    return idx;
                }}
            }}
            (*cursor).cell = -1;
        }}
        if ((*cursor).ring > (*cursor).max_ring) {{
            return NEIGHBOR_END;
        }}
        var ring_cells = 1;
        if ((*cursor).ring > 0) {{ ring_cells = 8 * (*cursor).ring; }}
        if ((*cursor).k >= ring_cells) {{
            (*cursor).ring += 1;
            (*cursor).k = 0;
            continue;
        }}
        let c = (*cursor).center + ring_offset((*cursor).ring, (*cursor).k);
        (*cursor).k += 1;
        if (c.x >= 0 && c.y >= 0 && c.x < i32(grid.cols) && c.y < i32(grid.rows)) {{
            (*cursor).cell = i32(grid_flat(c));
            (*cursor).slot = 0u;
        }}
    }}
    return NEIGHBOR_END;
}}
"#
    )
}

/// Host replay of the atomic-counter grid
#[derive(Debug, Clone)]
pub struct AtomicGrid {
    config: GridConfig,
    bounds: GridBounds,
    counts: Vec<u32>,
    cells: Vec<u32>,
    positions: Vec<Vec2>,
    dropped: u32,
}

impl AtomicGrid {
    pub fn new(bounds: GridBounds, max_per_cell: u32) -> Self {
        let config = GridConfig::new(&bounds, max_per_cell);
        let cells = config.cell_count() as usize;
        Self {
            config,
            bounds,
            counts: vec![0; cells],
            cells: vec![0; cells * config.max_per_cell as usize],
            positions: Vec::new(),
            dropped: 0,
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn clear(&mut self) {
        self.counts.fill(0);
        self.dropped = 0;
    }

    /// Insert every live particle in index order. Insertions past a cell's
    /// capacity are dropped and counted.
    pub fn build(&mut self, particles: &[Particle]) {
        self.clear();
        self.positions.clear();
        self.positions.extend(particles.iter().map(|p| p.position));
        let max = self.config.max_per_cell;
        for (index, p) in particles.iter().enumerate() {
            if !p.is_alive() {
                continue;
            }
            let cell = self.bounds.flat_index(self.bounds.cell_of(p.position));
            let slot = self.counts[cell];
            self.counts[cell] += 1;
            if slot < max {
                self.cells[cell * max as usize + slot as usize] = index as u32;
            } else {
                self.dropped += 1;
            }
        }
        if self.dropped > 0 {
            log::warn!("GPU grid dropped {} insertions (cell capacity {})", self.dropped, max);
        }
    }

    /// Insertions dropped by the last build
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn cursor(&self, point: Vec2, radius: f32) -> RingCursor<'_> {
        RingCursor {
            grid: self,
            point,
            radius_sq: radius * radius,
            center: self.bounds.cell_of(point),
            ring: 0,
            max_ring: self.bounds.rings_for(radius),
            k: 0,
            cell: None,
            slot: 0,
        }
    }

    /// Collected cursor results, excluding `exclude`
    pub fn query(&self, point: Vec2, radius: f32, exclude: Option<u32>) -> Vec<u32> {
        self.cursor(point, radius)
            .filter(|&i| Some(i) != exclude)
            .collect()
    }
}

/// Host replay of `neighbor_iter_next`
pub struct RingCursor<'a> {
    grid: &'a AtomicGrid,
    point: Vec2,
    radius_sq: f32,
    center: IVec2,
    ring: i32,
    max_ring: i32,
    k: i32,
    cell: Option<usize>,
    slot: u32,
}

impl RingCursor<'_> {
    /// Next index, or `NEIGHBOR_END` once exhausted
    pub fn next_raw(&mut self) -> u32 {
        self.next().unwrap_or(NEIGHBOR_END)
    }
}

impl Iterator for RingCursor<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let max = self.grid.config.max_per_cell;
        loop {
            if let Some(cell) = self.cell {
                let count = self.grid.counts[cell].min(max);
                while self.slot < count {
                    let index = self.grid.cells[cell * max as usize + self.slot as usize];
                    self.slot += 1;
                    let position = self.grid.positions[index as usize];
                    if position.distance_squared(self.point) <= self.radius_sq {
                        return Some(index);
                    }
                }
                self.cell = None;
            }
            if self.ring > self.max_ring {
                return None;
            }
            if self.k >= ring_len(self.ring) {
                self.ring += 1;
                self.k = 0;
                continue;
            }
            let c = self.center + ring_offset(self.ring, self.k);
            self.k += 1;
            let bounds = &self.grid.bounds;
            if c.x >= 0 && c.y >= 0 && c.x < bounds.cols as i32 && c.y < bounds.rows as i32 {
                self.cell = Some(bounds.flat_index(c));
                self.slot = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::sim::particle::{ParticleInit, ParticleStore};
    use crate::sim::spatial::SpatialGrid;

    fn store_from(points: &[(f32, f32)]) -> ParticleStore {
        let mut store = ParticleStore::new();
        for &(x, y) in points {
            store.spawn(ParticleInit {
                position: Vec2::new(x, y),
                ..Default::default()
            });
        }
        store
    }

    #[test]
    fn test_grid_config_size() {
        assert_eq!(std::mem::size_of::<GridConfig>(), 32);
    }

    #[test]
    fn test_ring_offsets_cover_perimeter_once() {
        for ring in 1..4 {
            let cells: HashSet<_> = (0..ring_len(ring)).map(|k| ring_offset(ring, k)).collect();
            assert_eq!(cells.len() as i32, ring_len(ring));
            assert!(cells.iter().all(|c| c.x.abs().max(c.y.abs()) == ring));
        }
    }

    #[test]
    fn test_overflow_is_dropped_and_counted() {
        let store = store_from(&[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]);
        let bounds = GridBounds::covering(Vec2::ZERO, Vec2::splat(100.0), 10.0);
        let mut grid = AtomicGrid::new(bounds, 2);
        grid.build(store.particles());
        assert_eq!(grid.dropped(), 1);
        // The third particle is invisible this step
        let found = grid.query(Vec2::ZERO, 20.0, None);
        assert_eq!(found.len(), 2);
        assert!(!found.contains(&2));
    }

    #[test]
    fn test_dead_particles_not_inserted() {
        let mut store = store_from(&[(1.0, 1.0), (2.0, 2.0)]);
        store.particles_mut()[0].kill();
        let bounds = GridBounds::covering(Vec2::ZERO, Vec2::splat(100.0), 10.0);
        let mut grid = AtomicGrid::new(bounds, 8);
        grid.build(store.particles());
        assert_eq!(grid.query(Vec2::ZERO, 50.0, None), vec![1]);
    }

    #[test]
    fn test_cursor_ends_with_sentinel() {
        let store = store_from(&[(5.0, 5.0)]);
        let bounds = GridBounds::covering(Vec2::ZERO, Vec2::splat(100.0), 10.0);
        let mut grid = AtomicGrid::new(bounds, 8);
        grid.build(store.particles());
        let mut cursor = grid.cursor(Vec2::new(6.0, 6.0), 3.0);
        assert_eq!(cursor.next_raw(), 0);
        assert_eq!(cursor.next_raw(), NEIGHBOR_END);
    }

    #[test]
    fn test_huge_radius_walks_only_grid_rings() {
        let store = store_from(&[(5.0, 5.0), (95.0, 95.0)]);
        let bounds = GridBounds::covering(Vec2::ZERO, Vec2::splat(100.0), 10.0);
        let mut grid = AtomicGrid::new(bounds, 8);
        grid.build(store.particles());

        let cursor = grid.cursor(Vec2::new(5.0, 5.0), 1.0e9);
        assert_eq!(cursor.max_ring, 10);
        assert_eq!(grid.query(Vec2::new(5.0, 5.0), 1.0e9, Some(0)), vec![1]);
        assert!(grid_wgsl(64).contains("min(ceil(max(radius, 0.0) / grid.cell_size), widest)"));
    }

    #[test]
    fn test_wgsl_declares_entry_points() {
        let src = grid_wgsl(64);
        assert!(src.contains("fn clear_grid"));
        assert!(src.contains("fn build_grid"));
        assert!(src.contains("@workgroup_size(64)"));
        assert!(src.contains("fn neighbor_iter_next(cursor: ptr<function, NeighborCursor>)"));
    }

    proptest! {
        #[test]
        fn prop_both_indexes_agree(
            points in prop::collection::vec((-300.0f32..300.0, -300.0f32..300.0), 1..80),
            qx in -350.0f32..350.0,
            qy in -350.0f32..350.0,
            radius in 0.0f32..120.0,
            cell_size in 5.0f32..60.0,
        ) {
            let store = store_from(&points);
            let particles = store.particles();
            let point = Vec2::new(qx, qy);
            // Bounds smaller than the cloud so edge clamping is exercised
            let bounds = GridBounds::covering(Vec2::splat(-150.0), Vec2::splat(150.0), cell_size);

            let mut cpu = SpatialGrid::with_bounds(bounds);
            cpu.build(particles);
            let mut gpu = AtomicGrid::new(bounds, particles.len() as u32);
            gpu.build(particles);
            prop_assert_eq!(gpu.dropped(), 0);

            let exclude = Some(0);
            let mut a = cpu.query(point, radius, exclude);
            let mut b = gpu.query(point, radius, exclude);
            a.sort_unstable();
            b.sort_unstable();

            let mut brute: Vec<u32> = particles
                .iter()
                .enumerate()
                .filter(|(i, p)| *i != 0 && p.position.distance_squared(point) <= radius * radius)
                .map(|(i, _)| i as u32)
                .collect();
            brute.sort_unstable();

            prop_assert_eq!(&a, &b);
            prop_assert_eq!(&a, &brute);
        }
    }
}
