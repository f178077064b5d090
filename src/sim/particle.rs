//! Particle records and the store that owns them
//!
//! Identity is a stable `ParticleId` handed out by the store. Ids are never
//! reused, so a particle removed during a step can not alias a newly created one.

use glam::{Vec2, Vec4};
use serde::{Deserialize, Serialize};

/// Stable particle identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticleId(pub u32);

/// A simulated particle
///
/// `mass == 0` marks the particle dead (removed at the end of the step),
/// `mass < 0` marks it pinned (alive but immovable).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub id: ParticleId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Accumulated during `apply`, zeroed by integration
    pub acceleration: Vec2,
    pub size: f32,
    pub mass: f32,
    pub color: Vec4,
}

impl Particle {
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.mass != 0.0
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.mass < 0.0
    }

    /// Inverse mass, zero for pinned and dead particles
    #[inline]
    pub fn inverse_mass(&self) -> f32 {
        if self.mass > 0.0 { 1.0 / self.mass } else { 0.0 }
    }

    /// Mark for removal at the end of the current step
    pub fn kill(&mut self) {
        self.mass = 0.0;
    }
}

/// Creation parameters for a particle (the store assigns the id)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticleInit {
    pub position: Vec2,
    pub velocity: Vec2,
    pub size: f32,
    pub mass: f32,
    pub color: Vec4,
}

impl Default for ParticleInit {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            size: 5.0,
            mass: 1.0,
            color: Vec4::ONE,
        }
    }
}

/// Owner of the live particle set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticleStore {
    particles: Vec<Particle>,
    /// Next id to hand out
    next_id: u32,
}

impl ParticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            particles: Vec::with_capacity(capacity),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> ParticleId {
        let id = ParticleId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create a particle and return its id
    pub fn spawn(&mut self, init: ParticleInit) -> ParticleId {
        let id = self.allocate_id();
        self.particles.push(Particle {
            id,
            position: init.position,
            velocity: init.velocity,
            acceleration: Vec2::ZERO,
            size: init.size,
            mass: init.mass,
            color: init.color,
        });
        id
    }

    /// Mark a particle dead; it is compacted out by the next `compact`.
    /// Returns false if the id is not live.
    pub fn kill(&mut self, id: ParticleId) -> bool {
        match self.get_mut(id) {
            Some(p) if p.is_alive() => {
                p.kill();
                true
            }
            _ => false,
        }
    }

    /// Remove dead particles in place, keeping survivors in order.
    /// Returns the number of particles removed.
    pub fn compact(&mut self) -> usize {
        let before = self.particles.len();
        self.particles.retain(|p| p.is_alive());
        before - self.particles.len()
    }

    pub fn get(&self, id: ParticleId) -> Option<&Particle> {
        self.index_of(id).map(|i| &self.particles[i])
    }

    pub fn get_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        self.index_of(id).map(move |i| &mut self.particles[i])
    }

    /// Index of a particle in the live array.
    ///
    /// Ids are assigned in increasing order and compaction is stable, so the
    /// array stays sorted by id; replaced sets are re-sorted on ingest.
    pub fn index_of(&self, id: ParticleId) -> Option<usize> {
        self.particles.binary_search_by_key(&id, |p| p.id).ok()
    }

    /// Bulk export of the current particle set
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    /// Bulk ingest. Ids not previously handed out by this store are replaced
    /// with fresh ones so identity stays unique.
    pub fn replace_all(&mut self, mut particles: Vec<Particle>) {
        particles.sort_by_key(|p| p.id);
        // Sorted by original id, so duplicates are adjacent
        let mut previous: Option<ParticleId> = None;
        for p in &mut particles {
            let original = p.id;
            if original.0 >= self.next_id || previous == Some(original) {
                p.id = self.allocate_id();
            }
            previous = Some(original);
        }
        particles.sort_by_key(|p| p.id);
        self.particles = particles;
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Number of ids handed out so far
    pub fn ids_issued(&self) -> u32 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f32, y: f32) -> ParticleInit {
        ParticleInit {
            position: Vec2::new(x, y),
            ..Default::default()
        }
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let mut store = ParticleStore::new();
        let a = store.spawn(at(0.0, 0.0));
        let b = store.spawn(at(1.0, 0.0));
        assert!(b > a);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_compact_is_stable() {
        let mut store = ParticleStore::new();
        let ids: Vec<_> = (0..5).map(|i| store.spawn(at(i as f32, 0.0))).collect();
        assert!(store.kill(ids[1]));
        assert!(store.kill(ids[3]));
        assert_eq!(store.compact(), 2);
        let remaining: Vec<_> = store.particles().iter().map(|p| p.id).collect();
        assert_eq!(remaining, vec![ids[0], ids[2], ids[4]]);
    }

    #[test]
    fn test_ids_not_reused_after_kill() {
        let mut store = ParticleStore::new();
        let a = store.spawn(at(0.0, 0.0));
        store.kill(a);
        let b = store.spawn(at(0.0, 0.0));
        assert_ne!(a, b);
        store.compact();
        let c = store.spawn(at(0.0, 0.0));
        assert!(c > b);
        assert!(store.get(a).is_none());
    }

    #[test]
    fn test_pinned_is_alive() {
        let mut store = ParticleStore::new();
        let id = store.spawn(ParticleInit {
            mass: -1.0,
            ..Default::default()
        });
        let p = store.get(id).unwrap();
        assert!(p.is_alive());
        assert!(p.is_pinned());
        assert_eq!(p.inverse_mass(), 0.0);
        assert_eq!(store.compact(), 0);
    }

    #[test]
    fn test_replace_all_reassigns_foreign_ids() {
        let mut store = ParticleStore::new();
        let a = store.spawn(at(0.0, 0.0));
        let mut exported = store.particles().to_vec();
        let mut foreign = exported[0];
        foreign.id = ParticleId(999);
        exported.push(foreign);
        store.replace_all(exported);
        assert_eq!(store.len(), 2);
        assert!(store.get(a).is_some());
        assert!(store.get(ParticleId(999)).is_none());
        assert_eq!(store.ids_issued(), 2);
    }
}
