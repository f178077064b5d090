//! CPU spatial index
//!
//! A bucket grid keyed by world cell, rebuilt every step. The grid covers the
//! camera viewport plus padding; bounds are only re-derived when the camera
//! drifts by more than half a cell. Out-of-range particles are clamped into
//! the nearest edge cell, so queries stay exact everywhere.

use glam::{IVec2, Vec2};
use serde::{Deserialize, Serialize};

use super::particle::Particle;

/// Camera viewport in world space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// World-space center of the view
    pub center: Vec2,
    /// Visible world extent at zoom 1
    pub viewport: Vec2,
    pub zoom: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            center: Vec2::ZERO,
            viewport: Vec2::new(1280.0, 720.0),
            zoom: 1.0,
        }
    }
}

impl Camera {
    /// Visible world extent at the current zoom
    pub fn visible_extent(&self) -> Vec2 {
        self.viewport / self.zoom.max(1e-6)
    }
}

/// Axis-aligned region covered by a grid, snapped to whole cells
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub origin: Vec2,
    pub cell_size: f32,
    pub cols: u32,
    pub rows: u32,
}

impl GridBounds {
    /// Derive bounds from the camera viewport plus `padding` (fraction of extent).
    ///
    /// The cell count depends only on the padded extent: one spare cell per
    /// axis absorbs the origin snap, so panning never changes the grid shape.
    pub fn from_camera(camera: &Camera, cell_size: f32, padding: f32) -> Self {
        let cell_size = cell_size.max(1e-3);
        let extent = camera.visible_extent() * (1.0 + 2.0 * padding);
        let min = camera.center - extent * 0.5;
        let dims = (extent / cell_size).ceil().max(Vec2::ONE) + Vec2::ONE;
        Self {
            origin: (min / cell_size).floor() * cell_size,
            cell_size,
            cols: dims.x as u32,
            rows: dims.y as u32,
        }
    }

    /// Smallest cell-aligned bounds covering `[min, max]`
    pub fn covering(min: Vec2, max: Vec2, cell_size: f32) -> Self {
        let cell_size = cell_size.max(1e-3);
        let origin = (min / cell_size).floor() * cell_size;
        let dims = ((max - origin) / cell_size).ceil().max(Vec2::ONE);
        Self {
            origin,
            cell_size,
            cols: dims.x as u32,
            rows: dims.y as u32,
        }
    }

    /// Limit the cell count per axis. The region is preserved by widening cells.
    pub fn capped(self, max_cells: u32) -> Self {
        let max_cells = max_cells.max(1);
        let widest = self.cols.max(self.rows);
        if widest <= max_cells {
            return self;
        }
        let scale = widest as f32 / max_cells as f32;
        let cell_size = self.cell_size * scale;
        let extent = Vec2::new(self.cols as f32, self.rows as f32) * self.cell_size;
        Self {
            origin: self.origin,
            cell_size,
            cols: ((extent.x / cell_size).ceil() as u32).clamp(1, max_cells),
            rows: ((extent.y / cell_size).ceil() as u32).clamp(1, max_cells),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    /// Cell coordinates of a world position, clamped to the grid
    #[inline]
    pub fn cell_of(&self, position: Vec2) -> IVec2 {
        let c = ((position - self.origin) / self.cell_size).floor();
        IVec2::new(
            (c.x as i32).clamp(0, self.cols as i32 - 1),
            (c.y as i32).clamp(0, self.rows as i32 - 1),
        )
    }

    #[inline]
    pub fn flat_index(&self, cell: IVec2) -> usize {
        cell.y as usize * self.cols as usize + cell.x as usize
    }

    /// Number of rings a ring search needs to cover `radius`.
    ///
    /// Capped at the widest axis: the search centre is always a grid cell, so
    /// further rings hold no cells.
    #[inline]
    pub fn rings_for(&self, radius: f32) -> i32 {
        let widest = self.cols.max(self.rows) as f32;
        (radius / self.cell_size).ceil().clamp(0.0, widest) as i32
    }
}

/// Keeps grid bounds in step with the camera.
///
/// Bounds are re-derived when the camera centre drifts more than half a cell
/// from where they were last derived, or when the zoom or viewport changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundsTracker {
    anchor: Camera,
    cell_size: f32,
    padding: f32,
    max_cells: u32,
    bounds: GridBounds,
}

impl BoundsTracker {
    pub fn new(camera: &Camera, cell_size: f32, padding: f32, max_cells: u32) -> Self {
        Self {
            anchor: *camera,
            cell_size,
            padding,
            max_cells,
            bounds: GridBounds::from_camera(camera, cell_size, padding).capped(max_cells),
        }
    }

    pub fn bounds(&self) -> &GridBounds {
        &self.bounds
    }

    /// Returns true if the bounds changed
    pub fn track(&mut self, camera: &Camera) -> bool {
        let reframed = camera.zoom != self.anchor.zoom || camera.viewport != self.anchor.viewport;
        let drift = (camera.center - self.anchor.center).abs().max_element();
        if !reframed && drift <= self.bounds.cell_size * 0.5 {
            return false;
        }
        self.anchor = *camera;
        let candidate = GridBounds::from_camera(camera, self.cell_size, self.padding).capped(self.max_cells);
        if candidate == self.bounds {
            return false;
        }
        self.bounds = candidate;
        true
    }
}

/// Bucketed CPU spatial index
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    bounds: GridBounds,
    /// None for grids with fixed bounds
    tracker: Option<BoundsTracker>,
    /// Particle indices per cell
    buckets: Vec<Vec<u32>>,
    /// Positions captured at build time (queries never see later edits)
    positions: Vec<Vec2>,
    occupied: Vec<usize>,
}

impl SpatialGrid {
    /// Grid following `camera`, with at most `max_cells` cells per axis
    pub fn new(camera: &Camera, cell_size: f32, padding: f32, max_cells: u32) -> Self {
        let tracker = BoundsTracker::new(camera, cell_size, padding, max_cells);
        let mut grid = Self::with_bounds(*tracker.bounds());
        grid.tracker = Some(tracker);
        grid
    }

    /// Grid with fixed bounds; `track_camera` leaves it alone
    pub fn with_bounds(bounds: GridBounds) -> Self {
        Self {
            bounds,
            tracker: None,
            buckets: vec![Vec::new(); bounds.cell_count()],
            positions: Vec::new(),
            occupied: Vec::new(),
        }
    }

    pub fn bounds(&self) -> &GridBounds {
        &self.bounds
    }

    /// Follow the camera. Returns true if the bounds changed.
    pub fn track_camera(&mut self, camera: &Camera) -> bool {
        let Some(tracker) = self.tracker.as_mut() else {
            return false;
        };
        if !tracker.track(camera) {
            return false;
        }
        let bounds = *tracker.bounds();
        log::debug!(
            "Spatial grid bounds moved: {}x{} cells at {:?}",
            bounds.cols,
            bounds.rows,
            bounds.origin
        );
        self.bounds = bounds;
        self.buckets = vec![Vec::new(); bounds.cell_count()];
        self.occupied.clear();
        true
    }

    /// Rebuild from the current particle positions. Dead particles are skipped.
    pub fn build(&mut self, particles: &[Particle]) {
        for &cell in &self.occupied {
            self.buckets[cell].clear();
        }
        self.occupied.clear();
        self.positions.clear();
        self.positions.extend(particles.iter().map(|p| p.position));

        for (index, p) in particles.iter().enumerate() {
            if !p.is_alive() {
                continue;
            }
            let cell = self.bounds.flat_index(self.bounds.cell_of(p.position));
            if self.buckets[cell].is_empty() {
                self.occupied.push(cell);
            }
            self.buckets[cell].push(index as u32);
        }
    }

    /// Indices of particles within `radius` of `point`, excluding `exclude`
    pub fn query(&self, point: Vec2, radius: f32, exclude: Option<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        self.query_into(point, radius, exclude, &mut out);
        out
    }

    /// Like `query`, appending into a reusable buffer
    pub fn query_into(&self, point: Vec2, radius: f32, exclude: Option<u32>, out: &mut Vec<u32>) {
        let radius_sq = radius * radius;
        let rings = self.bounds.rings_for(radius);
        let center = self.bounds.cell_of(point);
        let min = (center - IVec2::splat(rings)).max(IVec2::ZERO);
        let max = (center + IVec2::splat(rings))
            .min(IVec2::new(self.bounds.cols as i32 - 1, self.bounds.rows as i32 - 1));

        for y in min.y..=max.y {
            for x in min.x..=max.x {
                let cell = self.bounds.flat_index(IVec2::new(x, y));
                for &index in &self.buckets[cell] {
                    if Some(index) == exclude {
                        continue;
                    }
                    if self.positions[index as usize].distance_squared(point) <= radius_sq {
                        out.push(index);
                    }
                }
            }
        }
    }

    /// Number of indexed particles
    pub fn indexed_count(&self) -> usize {
        self.occupied.iter().map(|&c| self.buckets[c].len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::particle::{ParticleInit, ParticleStore};

    fn grid_for(points: &[Vec2]) -> (SpatialGrid, ParticleStore) {
        let mut store = ParticleStore::new();
        for &position in points {
            store.spawn(ParticleInit {
                position,
                ..Default::default()
            });
        }
        let camera = Camera {
            center: Vec2::ZERO,
            viewport: Vec2::new(200.0, 200.0),
            zoom: 1.0,
        };
        let mut grid = SpatialGrid::new(&camera, 10.0, 0.5, 256);
        grid.build(store.particles());
        (grid, store)
    }

    #[test]
    fn test_bounds_include_padding() {
        let camera = Camera {
            center: Vec2::ZERO,
            viewport: Vec2::new(100.0, 100.0),
            zoom: 1.0,
        };
        let bounds = GridBounds::from_camera(&camera, 10.0, 0.5);
        // 100 + 2 * 50 padding = 200 wide, plus the spare cell
        assert_eq!(bounds.cols, 21);
        assert_eq!(bounds.rows, 21);
        assert!((bounds.origin.x + 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_query_excludes_self_and_far() {
        let (grid, _) = grid_for(&[Vec2::ZERO, Vec2::new(3.0, 0.0), Vec2::new(50.0, 0.0)]);
        let mut found = grid.query(Vec2::ZERO, 5.0, Some(0));
        found.sort();
        assert_eq!(found, vec![1]);
    }

    #[test]
    fn test_out_of_bounds_particles_are_clamped_not_dropped() {
        let far = Vec2::new(10_000.0, 0.0);
        let (grid, _) = grid_for(&[far, far + Vec2::new(1.0, 0.0)]);
        assert_eq!(grid.indexed_count(), 2);
        let found = grid.query(far, 2.0, Some(0));
        assert_eq!(found, vec![1]);
    }

    #[test]
    fn test_dead_particles_absent() {
        let mut store = ParticleStore::new();
        let a = store.spawn(ParticleInit::default());
        store.spawn(ParticleInit::default());
        store.kill(a);
        let mut grid = SpatialGrid::new(&Camera::default(), 10.0, 0.5, 256);
        grid.build(store.particles());
        assert_eq!(grid.query(Vec2::ZERO, 5.0, None), vec![1]);
    }

    #[test]
    fn test_track_camera_half_cell_threshold() {
        let mut camera = Camera::default();
        let mut grid = SpatialGrid::new(&camera, 40.0, 0.5, 256);
        camera.center.x += 10.0;
        assert!(!grid.track_camera(&camera));
        camera.center.x += 60.0;
        assert!(grid.track_camera(&camera));
    }

    #[test]
    fn test_pan_keeps_grid_shape() {
        let camera = Camera::default();
        let base = GridBounds::from_camera(&camera, 40.0, 0.5);
        for dx in [3.0, 10.0, 19.0, 27.5, 333.3, -71.0] {
            let panned = Camera {
                center: camera.center + Vec2::new(dx, dx * 0.5),
                ..camera
            };
            let bounds = GridBounds::from_camera(&panned, 40.0, 0.5);
            assert_eq!((bounds.cols, bounds.rows), (base.cols, base.rows));
            // Still covers the padded viewport
            let extent = panned.visible_extent() * 2.0;
            let min = panned.center - extent * 0.5;
            assert!(bounds.origin.x <= min.x && bounds.origin.y <= min.y);
            let far = bounds.origin + Vec2::new(bounds.cols as f32, bounds.rows as f32) * bounds.cell_size;
            assert!(far.x >= min.x + extent.x && far.y >= min.y + extent.y);
        }
    }

    #[test]
    fn test_zoom_out_is_capped() {
        let camera = Camera {
            zoom: 0.001,
            ..Default::default()
        };
        let mut grid = SpatialGrid::new(&Camera::default(), 40.0, 0.5, 128);
        assert!(grid.track_camera(&camera));
        let bounds = grid.bounds();
        assert!(bounds.cols <= 128 && bounds.rows <= 128);
        assert!(bounds.cols as f32 * bounds.cell_size >= camera.visible_extent().x * 2.0);
    }

    #[test]
    fn test_huge_radius_query_visits_whole_grid() {
        let (grid, _) = grid_for(&[Vec2::new(-90.0, -90.0), Vec2::new(90.0, 90.0)]);
        let mut found = grid.query(Vec2::new(100.0, 100.0), 1.0e12, None);
        found.sort();
        assert_eq!(found, vec![0, 1]);
        assert!(grid.query(Vec2::ZERO, f32::INFINITY, Some(0)).contains(&1));
    }

    #[test]
    fn test_capped_bounds_keep_region() {
        let bounds = GridBounds::covering(Vec2::ZERO, Vec2::new(1000.0, 500.0), 10.0);
        assert_eq!(bounds.cols, 100);
        let capped = bounds.capped(50);
        assert!(capped.cols <= 50);
        assert!(capped.cols as f32 * capped.cell_size >= 1000.0 - 1e-3);
        assert!(capped.rows as f32 * capped.cell_size >= 500.0 - 1e-3);
    }
}
