//! Authoritative 2D physics world
//!
//! Players are dynamic circles inside a rectangular arena made of four static
//! wall segments. The step is a plain semi-implicit Euler integration followed
//! by contact resolution:
//! - body/body contacts push both circles apart and exchange an impulse along
//!   the contact normal, scaled by restitution
//! - body/wall contacts push the circle back inside, reflect the normal
//!   velocity (restitution) and bleed tangential velocity into spin (friction)
//!
//! Spin decays exponentially every step and never exceeds the rate of a body
//! rolling at `max_speed`.
//!
//! Bodies are kept in a `BTreeMap` so every pass visits them in id order and
//! two worlds fed the same inputs produce the same floats.

use crate::error::WorldError;
use log::{debug, error};
use serde::Serialize;
use shared::{PlayerId, PlayerState, WorldConfig};
use std::collections::BTreeMap;
use std::f32::consts::TAU;

/// Exponential spin decay rate, per second
pub const ANGULAR_DAMPING: f32 = 1.5;

/// Below this distance two centres are treated as coincident
const COINCIDENT_EPSILON: f32 = 1e-4;

///Represents a vector in 2D space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Vec2 { x, y }
    }

    ///Returns the magnitude of the vector.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    ///Returns the normalized vector, or zero for the zero vector.
    pub fn normalize(&self) -> Vec2 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vec2::ZERO
        } else {
            Vec2 {
                x: self.x / mag,
                y: self.y / mag,
            }
        }
    }

    ///Returns the scaled vector.
    pub fn scale(&self, scalar: f32) -> Vec2 {
        Vec2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    ///Returns the sum of two vectors.
    pub fn add(&self, other: &Vec2) -> Vec2 {
        Vec2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    ///Returns the difference of two vectors.
    pub fn sub(&self, other: &Vec2) -> Vec2 {
        Vec2 {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    pub fn dot(&self, other: &Vec2) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// Counter-clockwise perpendicular
    pub fn perp(&self) -> Vec2 {
        Vec2 {
            x: -self.y,
            y: self.x,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Limits the length to `max`, keeping direction
    pub fn clamp_magnitude(&self, max: f32) -> Vec2 {
        if self.magnitude() > max {
            self.normalize().scale(max)
        } else {
            *self
        }
    }
}

impl From<(f32, f32)> for Vec2 {
    fn from((x, y): (f32, f32)) -> Self {
        Vec2 { x, y }
    }
}

/// Static boundary segment; `normal` points into the arena
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Wall {
    pub start: Vec2,
    pub end: Vec2,
    pub normal: Vec2,
}

impl Wall {
    fn new(start: Vec2, end: Vec2, normal: Vec2) -> Self {
        Wall { start, end, normal }
    }

    /// Signed distance from the wall line, positive on the arena side
    pub fn distance(&self, point: &Vec2) -> f32 {
        point.sub(&self.start).dot(&self.normal)
    }
}

/// Dynamic circle body owned by one player
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Body {
    pub id: PlayerId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Orientation in radians, kept in `[0, 2π)`
    pub angle: f32,
    pub angular_velocity: f32,
    pub radius: f32,
}

impl Body {
    fn new(id: PlayerId, position: Vec2, radius: f32) -> Self {
        Body {
            id,
            position,
            velocity: Vec2::ZERO,
            angle: 0.0,
            angular_velocity: 0.0,
            radius,
        }
    }

    fn state(&self) -> PlayerState {
        PlayerState {
            id: self.id,
            x: self.position.x,
            y: self.position.y,
            angle: self.angle,
        }
    }
}

/// Axis-aligned arena rectangle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Arena {
    pub min: Vec2,
    pub max: Vec2,
}

impl Arena {
    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    pub fn contains(&self, point: &Vec2, margin: f32) -> bool {
        point.x >= self.min.x + margin
            && point.x <= self.max.x - margin
            && point.y >= self.min.y + margin
            && point.y <= self.max.y - margin
    }
}

pub struct World {
    config: WorldConfig,
    gravity: Vec2,
    arena: Arena,
    walls: [Wall; 4],
    bodies: BTreeMap<PlayerId, Body>,
}

impl World {
    /// Builds the arena walls and fixes the simulation parameters
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        validate_config(&config)?;

        let min = Vec2::from(config.arena_origin);
        let max = min.add(&Vec2::from(config.arena_size));
        let arena = Arena { min, max };

        let bottom_left = min;
        let bottom_right = Vec2::new(max.x, min.y);
        let top_left = Vec2::new(min.x, max.y);
        let top_right = max;

        let walls = [
            Wall::new(bottom_left, top_left, Vec2::new(1.0, 0.0)),
            Wall::new(bottom_right, top_right, Vec2::new(-1.0, 0.0)),
            Wall::new(bottom_left, bottom_right, Vec2::new(0.0, 1.0)),
            Wall::new(top_left, top_right, Vec2::new(0.0, -1.0)),
        ];

        Ok(World {
            gravity: Vec2::from(config.gravity),
            config,
            arena,
            walls,
            bodies: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn arena(&self) -> Arena {
        self.arena
    }

    pub fn walls(&self) -> &[Wall] {
        &self.walls
    }

    pub fn body(&self, id: PlayerId) -> Option<&Body> {
        self.bodies.get(&id)
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.bodies.contains_key(&id)
    }

    pub fn player_count(&self) -> usize {
        self.bodies.len()
    }

    /// Inserts a new body for `id`. A spawn point overlapping a wall is pushed
    /// back inside by the same contact response the step uses.
    pub fn spawn_player(&mut self, id: PlayerId, spawn: Vec2) -> Result<PlayerId, WorldError> {
        if self.bodies.contains_key(&id) {
            return Err(WorldError::DuplicateId(id));
        }
        if !spawn.is_finite() {
            return Err(WorldError::InvalidInput {
                id,
                reason: "spawn position is not finite",
            });
        }

        let mut body = Body::new(id, spawn, self.config.player_radius);
        for wall in &self.walls {
            resolve_wall_contact(&mut body, wall, 0.0, 0.0);
        }

        debug!(
            "Spawned body {} at ({:.2}, {:.2})",
            id, body.position.x, body.position.y
        );
        self.bodies.insert(id, body);
        Ok(id)
    }

    pub fn remove_player(&mut self, id: PlayerId) -> Result<(), WorldError> {
        self.bodies
            .remove(&id)
            .map(|_| ())
            .ok_or(WorldError::NotFound(id))
    }

    /// Overwrites the body's velocity, clamped to `max_speed`
    pub fn set_velocity(&mut self, id: PlayerId, vx: f32, vy: f32) -> Result<Vec2, WorldError> {
        let requested = Vec2::new(vx, vy);
        if !requested.is_finite() {
            return Err(WorldError::InvalidInput {
                id,
                reason: "velocity is not finite",
            });
        }

        let max_speed = self.config.max_speed;
        let body = self.bodies.get_mut(&id).ok_or(WorldError::NotFound(id))?;
        body.velocity = requested.clamp_magnitude(max_speed);
        Ok(body.velocity)
    }

    /// Overwrites the orientation and stops any spin
    pub fn set_orientation(&mut self, id: PlayerId, angle: f32) -> Result<(), WorldError> {
        if !angle.is_finite() {
            return Err(WorldError::InvalidInput {
                id,
                reason: "angle is not finite",
            });
        }

        let body = self.bodies.get_mut(&id).ok_or(WorldError::NotFound(id))?;
        body.angle = wrap_angle(angle);
        body.angular_velocity = 0.0;
        Ok(())
    }

    /// Advances every body by exactly `dt`
    pub fn step(&mut self, dt: f32) {
        let max_speed = self.config.max_speed;
        let restitution = self.config.restitution;
        let friction = self.config.friction;

        for body in self.bodies.values_mut() {
            body.velocity = body
                .velocity
                .add(&self.gravity.scale(dt))
                .clamp_magnitude(max_speed);
            body.position = body.position.add(&body.velocity.scale(dt));
            body.angle = wrap_angle(body.angle + body.angular_velocity * dt);
            body.angular_velocity *= (-ANGULAR_DAMPING * dt).exp();
        }

        self.handle_body_collisions(restitution);

        for body in self.bodies.values_mut() {
            for wall in &self.walls {
                resolve_wall_contact(body, wall, restitution, friction);
            }
            // Contact impulses can add up past the limit
            body.velocity = body.velocity.clamp_magnitude(max_speed);
            let max_spin = max_speed / body.radius;
            body.angular_velocity = body.angular_velocity.clamp(-max_spin, max_spin);

            if !body.position.is_finite() {
                error!("Body {} left the finite range, resetting to arena centre", body.id);
                body.position = self.arena.min.add(&self.arena.max).scale(0.5);
                body.velocity = Vec2::ZERO;
            }
        }
    }

    /// Read-only view of every body, ordered by id
    pub fn snapshot(&self) -> Vec<PlayerState> {
        self.bodies.values().map(Body::state).collect()
    }

    fn handle_body_collisions(&mut self, restitution: f32) {
        let ids: Vec<PlayerId> = self.bodies.keys().copied().collect();

        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (id1, id2) = (ids[i], ids[j]);

                if let (Some(mut body1), Some(mut body2)) =
                    (self.bodies.get(&id1).copied(), self.bodies.get(&id2).copied())
                {
                    if resolve_body_contact(&mut body1, &mut body2, restitution) {
                        self.bodies.insert(id1, body1);
                        self.bodies.insert(id2, body2);
                    }
                }
            }
        }
    }
}

fn validate_config(config: &WorldConfig) -> Result<(), WorldError> {
    let (width, height) = config.arena_size;
    let (gx, gy) = config.gravity;
    let (ox, oy) = config.arena_origin;

    if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
        return Err(WorldError::Configuration(format!(
            "arena dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    if !(gx.is_finite() && gy.is_finite() && ox.is_finite() && oy.is_finite()) {
        return Err(WorldError::Configuration(
            "gravity and arena origin must be finite".into(),
        ));
    }
    if !config.max_speed.is_finite() || config.max_speed <= 0.0 {
        return Err(WorldError::Configuration(format!(
            "max_speed must be positive, got {}",
            config.max_speed
        )));
    }
    if !config.player_radius.is_finite() || config.player_radius <= 0.0 {
        return Err(WorldError::Configuration(format!(
            "player_radius must be positive, got {}",
            config.player_radius
        )));
    }
    if config.player_radius * 2.0 >= width.min(height) {
        return Err(WorldError::Configuration(format!(
            "player radius {} does not fit into a {}x{} arena",
            config.player_radius, width, height
        )));
    }
    for (name, value) in [
        ("restitution", config.restitution),
        ("friction", config.friction),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(WorldError::Configuration(format!(
                "{} must lie in [0, 1], got {}",
                name, value
            )));
        }
    }
    Ok(())
}

fn wrap_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Pushes the body out of the wall and applies the bounce. Returns true on contact.
fn resolve_wall_contact(body: &mut Body, wall: &Wall, restitution: f32, friction: f32) -> bool {
    let penetration = body.radius - wall.distance(&body.position);
    if penetration <= 0.0 {
        return false;
    }

    body.position = body.position.add(&wall.normal.scale(penetration));

    let normal_speed = body.velocity.dot(&wall.normal);
    if normal_speed < 0.0 {
        let tangent = wall.normal.perp();
        let tangent_speed = body.velocity.dot(&tangent);

        // Coulomb limit: friction can remove at most mu * normal impulse
        let normal_impulse = -(1.0 + restitution) * normal_speed;
        let max_friction = friction * normal_impulse;
        let new_tangent_speed = if tangent_speed.abs() <= max_friction {
            0.0
        } else {
            tangent_speed - max_friction * tangent_speed.signum()
        };

        body.velocity = wall
            .normal
            .scale(-normal_speed * restitution)
            .add(&tangent.scale(new_tangent_speed));

        // Solid disc: I = m r^2 / 2
        body.angular_velocity += 2.0 * (tangent_speed - new_tangent_speed) / body.radius;
    }

    true
}

/// Separates two overlapping circles of equal mass. Returns true on contact.
fn resolve_body_contact(body1: &mut Body, body2: &mut Body, restitution: f32) -> bool {
    let delta = body2.position.sub(&body1.position);
    let distance = delta.magnitude();
    let min_distance = body1.radius + body2.radius;

    if distance >= min_distance {
        return false;
    }

    let normal = if distance < COINCIDENT_EPSILON {
        Vec2::new(1.0, 0.0)
    } else {
        delta.scale(1.0 / distance)
    };

    let separation = (min_distance - distance) * 0.5;
    body1.position = body1.position.sub(&normal.scale(separation));
    body2.position = body2.position.add(&normal.scale(separation));

    let approach_speed = body2.velocity.sub(&body1.velocity).dot(&normal);
    if approach_speed < 0.0 {
        let impulse = -(1.0 + restitution) * approach_speed * 0.5;
        body1.velocity = body1.velocity.sub(&normal.scale(impulse));
        body2.velocity = body2.velocity.add(&normal.scale(impulse));
    }

    true
}
