use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bevy_ecs::prelude::{Component, Entity, World};
use glam::Vec2;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rhai::{Engine, ImmutableString, FLOAT, INT};
use serde::{Deserialize, Serialize};

use crate::scripts::HostContext;
use crate::time::Time;

/// World objects scripts are allowed to spawn.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Ore,
    Chest,
    Potion,
    Slime,
    Bomb,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] =
        [EntityKind::Ore, EntityKind::Chest, EntityKind::Potion, EntityKind::Slime, EntityKind::Bomb];

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Ore => "Ore",
            EntityKind::Chest => "Chest",
            EntityKind::Potion => "Potion",
            EntityKind::Slime => "Slime",
            EntityKind::Bomb => "Bomb",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Component, Clone, Copy, Debug, Default)]
pub struct Transform {
    pub translation: Vec2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRecord {
    pub frame: u64,
    pub kind: EntityKind,
    pub position: [f32; 2],
    pub entity: u64,
}

/// The slice of game state scripts can see: spawned objects, the player, and the clock.
pub struct GameWorld {
    pub world: World,
    player: Vec2,
    time: Time,
    rng: StdRng,
    spawns: Vec<SpawnRecord>,
    logs: Vec<String>,
}

impl GameWorld {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self { world: World::new(), player: Vec2::ZERO, time: Time::new(), rng, spawns: Vec::new(), logs: Vec::new() }
    }

    pub fn player(&self) -> Vec2 {
        self.player
    }

    pub fn set_player(&mut self, position: Vec2) {
        self.player = position;
    }

    pub fn time(&self) -> &Time {
        &self.time
    }

    pub fn advance(&mut self, delta: Duration) {
        self.time.advance(delta);
    }

    pub fn spawn(&mut self, kind: EntityKind, position: Vec2) -> Entity {
        let entity = self.world.spawn((kind, Transform { translation: position })).id();
        self.spawns.push(SpawnRecord {
            frame: self.time.frame(),
            kind,
            position: position.to_array(),
            entity: entity.to_bits(),
        });
        log::debug!(target: "game", "spawned {kind} at ({:.1}, {:.1})", position.x, position.y);
        entity
    }

    pub fn despawn(&mut self, entity: Entity) -> bool {
        self.world.despawn(entity)
    }

    pub fn position_of(&self, entity: Entity) -> Option<Vec2> {
        self.world.get::<Transform>(entity).map(|transform| transform.translation)
    }

    pub fn count(&mut self, kind: EntityKind) -> usize {
        let mut query = self.world.query::<&EntityKind>();
        query.iter(&self.world).filter(|existing| **existing == kind).count()
    }

    /// Objects of `kind` within `radius` of `center`.
    pub fn count_near(&mut self, kind: EntityKind, center: Vec2, radius: f32) -> usize {
        let mut query = self.world.query::<(&EntityKind, &Transform)>();
        query
            .iter(&self.world)
            .filter(|(existing, transform)| {
                **existing == kind && transform.translation.distance_squared(center) <= radius * radius
            })
            .count()
    }

    pub fn counts(&mut self) -> BTreeMap<EntityKind, usize> {
        let mut counts = BTreeMap::new();
        let mut query = self.world.query::<&EntityKind>();
        for kind in query.iter(&self.world) {
            *counts.entry(*kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn random_range(&mut self, min: f32, max: f32) -> f32 {
        if max > min {
            self.rng.gen_range(min..max)
        } else {
            min
        }
    }

    pub fn push_log(&mut self, message: impl Into<String>) {
        self.logs.push(message.into());
    }

    pub fn spawn_log(&self) -> &[SpawnRecord] {
        &self.spawns
    }

    pub fn take_spawns(&mut self) -> Vec<SpawnRecord> {
        std::mem::take(&mut self.spawns)
    }

    pub fn take_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }
}

impl Default for GameWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a [`GameWorld`], exposed to scripts as the `World` type.
#[derive(Clone)]
pub struct GameContext {
    world: Arc<Mutex<GameWorld>>,
}

impl GameContext {
    pub fn new(world: GameWorld) -> Self {
        Self { world: Arc::new(Mutex::new(world)) }
    }

    pub fn lock(&self) -> MutexGuard<'_, GameWorld> {
        self.world.lock()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut GameWorld) -> R) -> R {
        f(&mut self.world.lock())
    }

    fn spawn_named(&self, kind: &str, x: FLOAT, y: FLOAT) -> INT {
        match EntityKind::parse(kind) {
            Some(kind) => self.with(|world| world.spawn(kind, Vec2::new(x as f32, y as f32))).to_bits() as INT,
            None => {
                log::warn!(target: "script", "spawn: unknown kind '{kind}'");
                -1
            }
        }
    }

    fn despawn_bits(&self, bits: INT) -> bool {
        if bits < 0 {
            return false;
        }
        match Entity::try_from_bits(bits as u64) {
            Ok(entity) => self.with(|world| world.despawn(entity)),
            Err(_) => false,
        }
    }

    fn count_named(&self, kind: &str) -> INT {
        EntityKind::parse(kind).map_or(0, |kind| self.with(|world| world.count(kind)) as INT)
    }

    fn count_near_player(&self, kind: &str, radius: FLOAT) -> INT {
        let Some(kind) = EntityKind::parse(kind) else {
            return 0;
        };
        self.with(|world| {
            let player = world.player();
            world.count_near(kind, player, radius as f32) as INT
        })
    }

    fn log_message(&self, message: &str) {
        log::info!(target: "script", "{message}");
        self.with(|world| world.push_log(message));
    }
}

impl HostContext for GameContext {
    fn register_api(engine: &mut Engine) {
        engine.register_type_with_name::<GameContext>("World");
        engine.register_fn("player_x", |ctx: &mut GameContext| ctx.lock().player().x as FLOAT);
        engine.register_fn("player_y", |ctx: &mut GameContext| ctx.lock().player().y as FLOAT);
        engine.register_fn("spawn_at", |ctx: &mut GameContext, kind: ImmutableString, x: FLOAT, y: FLOAT| {
            ctx.spawn_named(kind.as_str(), x, y)
        });
        engine.register_fn("spawn_at", |ctx: &mut GameContext, kind: ImmutableString, x: INT, y: INT| {
            ctx.spawn_named(kind.as_str(), x as FLOAT, y as FLOAT)
        });
        engine.register_fn("despawn", |ctx: &mut GameContext, entity: INT| ctx.despawn_bits(entity));
        engine.register_fn("count", |ctx: &mut GameContext, kind: ImmutableString| ctx.count_named(kind.as_str()));
        engine.register_fn("count_near", |ctx: &mut GameContext, kind: ImmutableString, radius: FLOAT| {
            ctx.count_near_player(kind.as_str(), radius)
        });
        engine.register_fn("elapsed_ms", |ctx: &mut GameContext| ctx.lock().time().elapsed_millis() as FLOAT);
        engine.register_fn("delta_ms", |ctx: &mut GameContext| ctx.lock().time().delta_millis() as FLOAT);
        engine.register_fn("frame", |ctx: &mut GameContext| ctx.lock().time().frame() as INT);
        engine.register_fn("rand", |ctx: &mut GameContext, min: FLOAT, max: FLOAT| {
            ctx.with(|world| world.random_range(min as f32, max as f32)) as FLOAT
        });
        engine.register_fn("log", |ctx: &mut GameContext, message: ImmutableString| ctx.log_message(message.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!(EntityKind::parse("ore"), Some(EntityKind::Ore));
        assert_eq!(EntityKind::parse(" Slime "), Some(EntityKind::Slime));
        assert_eq!(EntityKind::parse("dragon"), None);
    }

    #[test]
    fn spawn_count_and_despawn() {
        let mut world = GameWorld::with_seed(7);
        let ore = world.spawn(EntityKind::Ore, Vec2::new(1.0, 2.0));
        world.spawn(EntityKind::Ore, Vec2::new(50.0, 0.0));
        world.spawn(EntityKind::Chest, Vec2::ZERO);
        assert_eq!(world.count(EntityKind::Ore), 2);
        assert_eq!(world.count_near(EntityKind::Ore, Vec2::ZERO, 10.0), 1);
        assert_eq!(world.position_of(ore), Some(Vec2::new(1.0, 2.0)));
        assert!(world.despawn(ore));
        assert_eq!(world.count(EntityKind::Ore), 1);
        assert_eq!(world.counts().get(&EntityKind::Chest), Some(&1));
        assert_eq!(world.spawn_log().len(), 3);
    }

    #[test]
    fn seeded_worlds_roll_the_same_numbers() {
        let mut a = GameWorld::with_seed(42);
        let mut b = GameWorld::with_seed(42);
        let rolls_a: Vec<f32> = (0..4).map(|_| a.random_range(0.0, 10.0)).collect();
        let rolls_b: Vec<f32> = (0..4).map(|_| b.random_range(0.0, 10.0)).collect();
        assert_eq!(rolls_a, rolls_b);
        assert_eq!(a.random_range(5.0, 5.0), 5.0);
    }

    #[test]
    fn context_despawn_rejects_invalid_handles() {
        let ctx = GameContext::new(GameWorld::with_seed(1));
        assert!(!ctx.despawn_bits(-1));
        assert_eq!(ctx.spawn_named("dragon", 0.0, 0.0), -1);
        let bits = ctx.spawn_named("bomb", 3.0, 4.0);
        assert!(bits >= 0);
        assert_eq!(ctx.count_named("Bomb"), 1);
        assert!(ctx.despawn_bits(bits));
        assert_eq!(ctx.count_named("Bomb"), 0);
    }

    #[test]
    fn scripts_spawn_through_the_registered_api() {
        let mut engine = Engine::new_raw();
        GameContext::register_api(&mut engine);
        let ast = engine
            .compile("fn execute(world) { world.spawn_at(\"Chest\", 4.0, 5.0); world.count(\"chest\") }")
            .expect("compile");
        let ctx = GameContext::new(GameWorld::with_seed(9));
        let count: INT = engine.call_fn(&mut rhai::Scope::new(), &ast, "execute", (ctx.clone(),)).expect("call");
        assert_eq!(count, 1);
        let spawns = ctx.with(|world| world.take_spawns());
        assert_eq!(spawns[0].kind, EntityKind::Chest);
        assert_eq!(spawns[0].position, [4.0, 5.0]);
    }
}
