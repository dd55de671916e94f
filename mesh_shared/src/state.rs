//! Replicated shared state.
//!
//! One coarse lock guards both entities and projectiles. Removal timers and
//! protocol writers go through the same lock, so a purge never lands in the
//! middle of an iteration over the store.
//!
//! Entity lifecycle:
//! 1. Active: created by local spawn or the first `move` for an unseen id.
//! 2. Eliminated: health reached 0 (or an `eliminate` arrived). Excluded from
//!    collision targeting and further damage.
//! 3. Removed: the grace delay elapsed without a revive. Purged from the map.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    math::{hits_entity, in_arena, Vec2, ARENA_HEIGHT, ARENA_WIDTH, ENTITY_SIZE},
    net::PeerAddress,
};

pub const MAX_HEALTH: i32 = 100;
/// Damage dealt by one projectile hit.
pub const DAMAGE_PER_HIT: i32 = 5;
/// Frames between two shots of the same entity.
pub const SHOT_COOLDOWN_FRAMES: u32 = 20;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

const SPAWN_ATTEMPTS: usize = 64;

/// A simulated actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Top-left corner of the hitbox.
    pub position: Vec2,
    /// Facing angle in radians.
    pub angle: f64,
    pub health: i32,
    /// Frames until the entity may fire again.
    pub cooldown: u32,
    pub eliminated: bool,
    /// Link that last carried a `move` for this entity. `None` for local ones.
    pub origin: Option<PeerAddress>,
    #[serde(skip)]
    epoch: u64,
}

impl Entity {
    pub fn new(id: impl Into<String>, position: Vec2) -> Self {
        Self {
            id: id.into(),
            position,
            angle: 0.0,
            health: MAX_HEALTH,
            cooldown: 0,
            eliminated: false,
            origin: None,
            epoch: 0,
        }
    }

    /// Centre of the hitbox.
    pub fn center(&self) -> Vec2 {
        self.position
            .add(Vec2::new(ENTITY_SIZE / 2.0, ENTITY_SIZE / 2.0))
    }

    fn mark_eliminated(&mut self) {
        self.eliminated = true;
        self.epoch += 1;
    }
}

/// A moving point with an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projectile {
    pub position: Vec2,
    /// Units per frame.
    pub velocity: Vec2,
    pub active: bool,
    pub owner_id: String,
}

impl Projectile {
    pub fn new(owner_id: impl Into<String>, position: Vec2, velocity: Vec2) -> Self {
        Self {
            position,
            velocity,
            active: true,
            owner_id: owner_id.into(),
        }
    }
}

/// Result of [`StateStore::apply_damage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    Missing,
    AlreadyEliminated,
    Damaged { health: i32 },
    Eliminated,
}

/// A projectile hit produced by [`StateStore::advance_projectiles`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub target: String,
    pub owner: String,
    pub outcome: DamageOutcome,
}

#[derive(Debug, Default)]
struct World {
    entities: BTreeMap<String, Entity>,
    projectiles: Vec<Projectile>,
}

impl World {
    fn damage(&mut self, id: &str, amount: i32) -> DamageOutcome {
        let Some(e) = self.entities.get_mut(id) else {
            return DamageOutcome::Missing;
        };
        if e.eliminated {
            return DamageOutcome::AlreadyEliminated;
        }
        e.health = (e.health - amount).max(0);
        if e.health == 0 {
            e.mark_eliminated();
            DamageOutcome::Eliminated
        } else {
            DamageOutcome::Damaged { health: e.health }
        }
    }

    fn purge_if_eliminated(&mut self, id: &str, epoch: u64) -> bool {
        let stale = self
            .entities
            .get(id)
            .is_some_and(|e| e.eliminated && e.epoch == epoch);
        if stale {
            self.entities.remove(id);
        }
        stale
    }
}

/// Entity and projectile store shared between the protocol layer (writers)
/// and the presentation layer (readers). Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateStore {
    world: Arc<Mutex<World>>,
    grace: Duration,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl StateStore {
    /// Creates an empty store whose eliminated entities are purged after
    /// `grace`.
    pub fn new(grace: Duration) -> Self {
        Self {
            world: Arc::new(Mutex::new(World::default())),
            grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or moves an entity. Returns true when the entity was created.
    pub fn upsert_position(&self, id: &str, x: f64, y: f64, angle: f64) -> bool {
        self.upsert(None, id, x, y, angle)
    }

    /// Like [`Self::upsert_position`], remembering the link it arrived on.
    pub fn upsert_remote(&self, origin: &PeerAddress, id: &str, x: f64, y: f64, angle: f64) -> bool {
        self.upsert(Some(origin), id, x, y, angle)
    }

    fn upsert(&self, origin: Option<&PeerAddress>, id: &str, x: f64, y: f64, angle: f64) -> bool {
        let mut world = self.lock();
        let mut created = false;
        let e = world.entities.entry(id.to_string()).or_insert_with(|| {
            created = true;
            Entity::new(id, Vec2::ZERO)
        });
        e.position = Vec2::new(x, y);
        e.angle = angle;
        if let Some(origin) = origin {
            e.origin = Some(origin.clone());
        }
        created
    }

    /// Spawns a local entity at a random spot not overlapping existing ones.
    /// An existing entity with the same id is replaced.
    pub fn spawn_local(&self, id: &str) -> Vec2 {
        let mut world = self.lock();
        let mut rng = rand::thread_rng();
        let mut pos = Vec2::ZERO;
        for _ in 0..SPAWN_ATTEMPTS {
            pos = Vec2::new(
                rng.gen_range(0.0..ARENA_WIDTH - ENTITY_SIZE),
                rng.gen_range(0.0..ARENA_HEIGHT - ENTITY_SIZE),
            );
            let overlapping = world
                .entities
                .values()
                .any(|e| e.position.dist_sq(pos) < ENTITY_SIZE * ENTITY_SIZE);
            if !overlapping {
                break;
            }
        }
        world
            .entities
            .insert(id.to_string(), Entity::new(id, pos));
        info!(entity = %id, x = pos.x, y = pos.y, "Spawned local entity");
        pos
    }

    /// `health = max(0, health - amount)`. Reaching 0 eliminates the entity
    /// and schedules its removal after the grace period.
    pub fn apply_damage(&self, id: &str, amount: i32) -> DamageOutcome {
        let outcome = self.lock().damage(id, amount);
        if outcome == DamageOutcome::Eliminated {
            info!(entity = %id, "Entity eliminated");
            self.schedule_removal(id, self.grace);
        }
        outcome
    }

    /// Marks an entity eliminated without damage. Returns false when the
    /// entity is unknown or already eliminated.
    pub fn eliminate(&self, id: &str) -> bool {
        let changed = match self.lock().entities.get_mut(id) {
            Some(e) if !e.eliminated => {
                e.health = 0;
                e.mark_eliminated();
                true
            }
            _ => false,
        };
        if changed {
            info!(entity = %id, "Entity eliminated");
            self.schedule_removal(id, self.grace);
        }
        changed
    }

    /// Brings an eliminated entity back. Any pending removal becomes a no-op.
    pub fn revive(&self, id: &str, health: i32) -> bool {
        match self.lock().entities.get_mut(id) {
            Some(e) if e.eliminated => {
                e.eliminated = false;
                e.health = health.clamp(1, MAX_HEALTH);
                info!(entity = %id, health = e.health, "Entity revived");
                true
            }
            _ => false,
        }
    }

    /// Purges `id` after `delay` if it is still present and still in the
    /// elimination it was in when scheduled. Abandoned if the process exits.
    pub fn schedule_removal(&self, id: &str, delay: Duration) {
        let Some(epoch) = self.lock().entities.get(id).map(|e| e.epoch) else {
            return;
        };
        let world = Arc::clone(&self.world);
        let id = id.to_string();
        let purge = move || {
            let removed = world
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .purge_if_eliminated(&id, epoch);
            if removed {
                info!(entity = %id, "Removed eliminated entity");
            } else {
                debug!(entity = %id, "Removal timer found nothing to purge");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    purge();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    purge();
                });
            }
        }
    }

    /// Eliminates every entity last updated over the link `addr`.
    /// Returns the affected ids.
    pub fn on_peer_disconnected(&self, addr: &PeerAddress) -> Vec<String> {
        let ids: Vec<String> = {
            let mut world = self.lock();
            world
                .entities
                .values_mut()
                .filter(|e| !e.eliminated && e.origin.as_ref() == Some(addr))
                .map(|e| {
                    e.mark_eliminated();
                    e.id.clone()
                })
                .collect()
        };
        for id in &ids {
            info!(entity = %id, peer = %addr, "Entity eliminated after disconnect");
            self.schedule_removal(id, self.grace);
        }
        ids
    }

    pub fn add_projectile(&self, p: Projectile) {
        self.lock().projectiles.push(p);
    }

    /// Moves projectiles by `velocity * dt` (`dt` in frames), retires the
    /// ones leaving the arena, and resolves at most one hit per projectile.
    pub fn advance_projectiles(&self, dt: f64) -> Vec<Hit> {
        let mut hits = Vec::new();
        {
            let mut world = self.lock();
            let mut projectiles = std::mem::take(&mut world.projectiles);

            // Damage lands before the next projectile picks a target, so an
            // entity eliminated earlier in this pass is no longer hittable.
            for p in projectiles.iter_mut().filter(|p| p.active) {
                p.position = p.position.add(p.velocity.scale(dt));
                if !in_arena(p.position) {
                    p.active = false;
                    continue;
                }
                let target = world
                    .entities
                    .values()
                    .find(|e| {
                        !e.eliminated && e.id != p.owner_id && hits_entity(p.position, e.position)
                    })
                    .map(|e| e.id.clone());
                if let Some(target) = target {
                    p.active = false;
                    let outcome = world.damage(&target, DAMAGE_PER_HIT);
                    hits.push(Hit {
                        target,
                        owner: p.owner_id.clone(),
                        outcome,
                    });
                }
            }
            projectiles.retain(|p| p.active);
            world.projectiles = projectiles;
        }

        for hit in &hits {
            match hit.outcome {
                DamageOutcome::Damaged { health } => {
                    debug!(entity = %hit.target, by = %hit.owner, health, "Entity hit");
                }
                DamageOutcome::Eliminated => {
                    info!(entity = %hit.target, by = %hit.owner, "Entity eliminated");
                    self.schedule_removal(&hit.target, self.grace);
                }
                _ => {}
            }
        }
        hits
    }

    /// Runs `f` on the entity under the store lock.
    pub fn update_entity<R>(&self, id: &str, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        self.lock().entities.get_mut(id).map(f)
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.lock().entities.get(id).cloned()
    }

    /// Snapshot of all entities in id order.
    pub fn entities(&self) -> Vec<Entity> {
        self.lock().entities.values().cloned().collect()
    }

    /// Snapshot of in-flight projectiles.
    pub fn projectiles(&self) -> Vec<Projectile> {
        self.lock().projectiles.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(grace: Duration, id: &str, x: f64, y: f64) -> StateStore {
        let store = StateStore::new(grace);
        store.upsert_position(id, x, y, 0.0);
        store
    }

    #[test]
    fn damage_never_goes_negative() {
        let store = store_with(Duration::from_secs(60), "p1", 0.0, 0.0);
        assert_eq!(
            store.apply_damage("p1", 30),
            DamageOutcome::Damaged { health: 70 }
        );
        assert_eq!(store.apply_damage("p1", 500), DamageOutcome::Eliminated);
        let e = store.entity("p1").unwrap();
        assert_eq!(e.health, 0);
        assert!(e.eliminated);
    }

    #[test]
    fn eliminated_entities_take_no_further_damage() {
        let store = store_with(Duration::from_secs(60), "p1", 0.0, 0.0);
        store.apply_damage("p1", MAX_HEALTH);
        assert_eq!(store.apply_damage("p1", 5), DamageOutcome::AlreadyEliminated);
        assert_eq!(store.apply_damage("ghost", 5), DamageOutcome::Missing);
    }

    #[test]
    fn projectile_hit_deals_damage() {
        let store = store_with(Duration::from_secs(60), "p1", 50.0, 50.0);
        store.add_projectile(Projectile::new(
            "p2",
            Vec2::new(51.0, 55.0),
            Vec2::new(4.0, 0.0),
        ));

        let hits = store.advance_projectiles(1.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target, "p1");
        assert_eq!(hits[0].outcome, DamageOutcome::Damaged { health: 95 });

        let e = store.entity("p1").unwrap();
        assert_eq!(e.health, 95);
        assert!(!e.eliminated);
        assert!(store.projectiles().is_empty());
    }

    #[test]
    fn owner_is_never_hit_by_its_own_projectile() {
        let store = store_with(Duration::from_secs(60), "p1", 50.0, 50.0);
        store.add_projectile(Projectile::new("p1", Vec2::new(55.0, 55.0), Vec2::ZERO));
        assert!(store.advance_projectiles(1.0).is_empty());
        assert_eq!(store.projectiles().len(), 1);
    }

    #[test]
    fn projectiles_leaving_the_arena_are_retired() {
        let store = StateStore::default();
        store.add_projectile(Projectile::new(
            "p1",
            Vec2::new(ARENA_WIDTH - 1.0, 10.0),
            Vec2::new(4.0, 0.0),
        ));
        store.advance_projectiles(1.0);
        assert!(store.projectiles().is_empty());
    }

    #[test]
    fn one_projectile_hits_at_most_one_entity() {
        let store = StateStore::new(Duration::from_secs(60));
        store.upsert_position("a", 50.0, 50.0, 0.0);
        store.upsert_position("b", 50.0, 50.0, 0.0);
        store.add_projectile(Projectile::new("p9", Vec2::new(55.0, 55.0), Vec2::ZERO));
        let hits = store.advance_projectiles(1.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target, "a");
        assert_eq!(store.entity("b").unwrap().health, MAX_HEALTH);
    }

    #[test]
    fn projectile_passes_an_entity_eliminated_earlier_in_the_same_pass() {
        let store = store_with(Duration::from_secs(60), "p1", 50.0, 50.0);
        store.update_entity("p1", |e| e.health = DAMAGE_PER_HIT);
        store.add_projectile(Projectile::new("p2", Vec2::new(55.0, 55.0), Vec2::ZERO));
        store.add_projectile(Projectile::new("p3", Vec2::new(56.0, 56.0), Vec2::ZERO));

        let hits = store.advance_projectiles(1.0);
        assert_eq!(
            hits,
            vec![Hit {
                target: "p1".into(),
                owner: "p2".into(),
                outcome: DamageOutcome::Eliminated,
            }]
        );
        let left = store.projectiles();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].owner_id, "p3");
    }

    #[tokio::test]
    async fn eliminated_entity_is_skipped_then_removed_after_grace() {
        let grace = Duration::from_millis(50);
        let store = store_with(grace, "p1", 50.0, 50.0);

        assert_eq!(store.apply_damage("p1", MAX_HEALTH), DamageOutcome::Eliminated);
        assert!(store.entity("p1").unwrap().eliminated);

        store.add_projectile(Projectile::new("p2", Vec2::new(55.0, 55.0), Vec2::ZERO));
        assert!(store.advance_projectiles(1.0).is_empty());

        tokio::time::sleep(grace * 4).await;
        assert!(store.entity("p1").is_none());
    }

    #[tokio::test]
    async fn revive_cancels_pending_removal() {
        let grace = Duration::from_millis(50);
        let store = store_with(grace, "p1", 0.0, 0.0);
        store.eliminate("p1");
        assert!(store.revive("p1", 40));

        tokio::time::sleep(grace * 4).await;
        let e = store.entity("p1").unwrap();
        assert!(!e.eliminated);
        assert_eq!(e.health, 40);
    }

    #[tokio::test]
    async fn stale_timer_does_not_cut_a_new_grace_period_short() {
        let grace = Duration::from_millis(200);
        let store = store_with(grace, "p1", 0.0, 0.0);
        store.eliminate("p1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.revive("p1", MAX_HEALTH);
        store.eliminate("p1");

        // The first timer fires here, but belongs to the previous elimination.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.entity("p1").is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.entity("p1").is_none());
    }

    #[test]
    fn removal_runs_without_a_runtime() {
        let grace = Duration::from_millis(20);
        let store = store_with(grace, "p1", 0.0, 0.0);
        store.eliminate("p1");
        std::thread::sleep(grace * 10);
        assert!(store.entity("p1").is_none());
    }

    #[test]
    fn disconnect_eliminates_entities_from_that_link() {
        let store = StateStore::new(Duration::from_secs(60));
        let a = PeerAddress::from("10.0.0.1:9001");
        let b = PeerAddress::from("10.0.0.2:9001");
        store.upsert_remote(&a, "pa", 0.0, 0.0, 0.0);
        store.upsert_remote(&b, "pb", 100.0, 100.0, 0.0);
        store.upsert_position("local", 200.0, 200.0, 0.0);

        assert_eq!(store.on_peer_disconnected(&a), vec!["pa".to_string()]);
        assert!(store.entity("pa").unwrap().eliminated);
        assert!(!store.entity("pb").unwrap().eliminated);
        assert!(!store.entity("local").unwrap().eliminated);
    }

    #[test]
    fn local_spawns_do_not_overlap() {
        let store = StateStore::default();
        let a = store.spawn_local("a");
        let b = store.spawn_local("b");
        assert!(a.dist_sq(b) >= ENTITY_SIZE * ENTITY_SIZE);
        assert_eq!(store.entities().len(), 2);
    }
}
