//! Local player simulation.
//!
//! Input capture lives outside the core. This module turns one frame of
//! sampled input into state changes on the local entity and reports each
//! change as a [`LocalEvent`], which the node broadcasts to its peers.

use crate::{
    math::{clamp_to_arena, Vec2, ENTITY_SIZE},
    protocol::Message,
    state::{Projectile, StateStore, SHOT_COOLDOWN_FRAMES},
};

/// Units per frame for player movement.
pub const PLAYER_SPEED: f64 = 2.0;
/// Units per frame for projectiles.
pub const PROJECTILE_SPEED: f64 = 4.0;

/// User input for one frame. `dx`/`dy` are in -1..=1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub dx: f64,
    pub dy: f64,
    pub fire: bool,
}

impl InputState {
    /// Combines two inputs sampled in the same frame. Directions add up
    /// (clamped per axis) and a fire request is never lost.
    pub fn merge(self, other: InputState) -> InputState {
        InputState {
            dx: (self.dx + other.dx).clamp(-1.0, 1.0),
            dy: (self.dy + other.dy).clamp(-1.0, 1.0),
            fire: self.fire || other.fire,
        }
    }

    pub fn velocity(self) -> Vec2 {
        Vec2::new(
            self.dx.clamp(-1.0, 1.0) * PLAYER_SPEED,
            self.dy.clamp(-1.0, 1.0) * PLAYER_SPEED,
        )
    }
}

/// A change to local state that peers need to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    Moved {
        id: String,
        position: Vec2,
        angle: f64,
    },
    Fired(Projectile),
    /// The local entity was eliminated.
    Eliminated { id: String },
}

impl LocalEvent {
    pub fn to_message(&self) -> Message {
        match self {
            LocalEvent::Moved {
                id,
                position,
                angle,
            } => Message::Move {
                id: id.clone(),
                x: position.x,
                y: position.y,
                angle: *angle,
            },
            LocalEvent::Fired(p) => Message::Bullet {
                owner_id: p.owner_id.clone(),
                x: p.position.x,
                y: p.position.y,
                vx: p.velocity.x,
                vy: p.velocity.y,
            },
            LocalEvent::Eliminated { id } => Message::Eliminate { id: id.clone() },
        }
    }
}

/// Drives the entity owned by this node.
#[derive(Debug, Clone)]
pub struct LocalController {
    id: String,
}

impl LocalController {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Applies one frame of input. Eliminated or missing entities do nothing.
    pub fn step(&self, store: &StateStore, input: InputState) -> Vec<LocalEvent> {
        let v = input.velocity();
        let step = store.update_entity(&self.id, |e| {
            if e.eliminated {
                return (None, None);
            }

            let mut moved = None;
            if v != Vec2::ZERO {
                e.angle = v.angle();
                e.position = clamp_to_arena(e.position.add(v));
                moved = Some(LocalEvent::Moved {
                    id: e.id.clone(),
                    position: e.position,
                    angle: e.angle,
                });
            }

            e.cooldown = e.cooldown.saturating_sub(1);
            let mut shot = None;
            if input.fire && e.cooldown == 0 {
                let origin = e.position.add(Vec2::new(ENTITY_SIZE / 2.0, ENTITY_SIZE / 2.0));
                shot = Some(Projectile::new(
                    e.id.clone(),
                    origin,
                    Vec2::from_angle(e.angle).scale(PROJECTILE_SPEED),
                ));
                e.cooldown = SHOT_COOLDOWN_FRAMES;
            }
            (moved, shot)
        });

        let Some((moved, shot)) = step else {
            return Vec::new();
        };
        let mut events: Vec<LocalEvent> = moved.into_iter().collect();
        if let Some(p) = shot {
            store.add_projectile(p.clone());
            events.push(LocalEvent::Fired(p));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::ARENA_WIDTH;

    #[test]
    fn inputs_from_one_frame_merge() {
        let fire = InputState {
            fire: true,
            ..Default::default()
        };
        let right = InputState {
            dx: 1.0,
            ..Default::default()
        };
        let merged = fire.merge(right).merge(right);
        assert_eq!(
            merged,
            InputState {
                dx: 1.0,
                dy: 0.0,
                fire: true
            }
        );
    }

    fn setup(x: f64, y: f64) -> (StateStore, LocalController) {
        let store = StateStore::default();
        store.upsert_position("me", x, y, 0.0);
        (store, LocalController::new("me"))
    }

    #[test]
    fn moving_right_updates_position_and_angle() {
        let (store, ctl) = setup(100.0, 100.0);
        let events = ctl.step(
            &store,
            InputState {
                dx: 1.0,
                ..Default::default()
            },
        );
        assert_eq!(
            events,
            vec![LocalEvent::Moved {
                id: "me".into(),
                position: Vec2::new(102.0, 100.0),
                angle: 0.0,
            }]
        );
    }

    #[test]
    fn movement_is_clamped_to_the_arena() {
        let (store, ctl) = setup(ARENA_WIDTH - ENTITY_SIZE, 0.0);
        ctl.step(
            &store,
            InputState {
                dx: 1.0,
                dy: -1.0,
                fire: false,
            },
        );
        assert_eq!(
            store.entity("me").unwrap().position,
            Vec2::new(ARENA_WIDTH - ENTITY_SIZE, 0.0)
        );
    }

    #[test]
    fn firing_spawns_from_centre_and_respects_cooldown() {
        let (store, ctl) = setup(100.0, 100.0);
        let fire = InputState {
            fire: true,
            ..Default::default()
        };

        let events = ctl.step(&store, fire);
        let LocalEvent::Fired(p) = &events[0] else {
            panic!("expected a shot, got {events:?}");
        };
        assert_eq!(p.position, Vec2::new(110.0, 110.0));
        assert_eq!(p.velocity, Vec2::new(PROJECTILE_SPEED, 0.0));
        assert_eq!(store.projectiles().len(), 1);

        for _ in 1..SHOT_COOLDOWN_FRAMES {
            assert!(ctl.step(&store, fire).is_empty());
        }
        assert_eq!(ctl.step(&store, fire).len(), 1);
    }

    #[test]
    fn eliminated_player_is_frozen() {
        let (store, ctl) = setup(100.0, 100.0);
        store.eliminate("me");
        let events = ctl.step(
            &store,
            InputState {
                dx: 1.0,
                dy: 0.0,
                fire: true,
            },
        );
        assert!(events.is_empty());
    }

    #[test]
    fn events_map_to_wire_messages() {
        let ev = LocalEvent::Moved {
            id: "me".into(),
            position: Vec2::new(1.0, 2.0),
            angle: 0.5,
        };
        assert_eq!(
            ev.to_message(),
            Message::Move {
                id: "me".into(),
                x: 1.0,
                y: 2.0,
                angle: 0.5,
            }
        );
    }
}
