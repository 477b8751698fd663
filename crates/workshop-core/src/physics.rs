//! Physics adapter
//!
//! The simulation talks to a `PhysicsBackend` keyed by instance/element id.
//! `RapierWorld` implements it on a zero-gravity rapier world. Bodies are
//! kinematic position-based until switched to damped dynamic bodies to take
//! impulses. Relationship cables are spring joints.

use rapier2d_f64::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};
use workshop_common::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    /// Position-driven, ignores forces
    Kinematic,
    /// Force-driven, damped, zero gravity
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpringDesc {
    pub rest_length: f64,
    pub stiffness: f64,
    pub damping: f64,
}

impl Default for SpringDesc {
    fn default() -> Self {
        Self {
            rest_length: 120.0,
            stiffness: 4.0,
            damping: 0.8,
        }
    }
}

/// Capability set the frame loop needs from a physics engine.
/// Every removal is idempotent.
pub trait PhysicsBackend: Send + Sync {
    fn add_body(&mut self, id: &str, position: Position, body_type: BodyType);
    fn remove_body(&mut self, id: &str) -> bool;
    fn has_body(&self, id: &str) -> bool;
    fn set_position(&mut self, id: &str, position: Position) -> bool;
    fn set_body_type(&mut self, id: &str, body_type: BodyType) -> bool;
    fn body_type(&self, id: &str) -> Option<BodyType>;
    /// Only affects dynamic bodies
    fn apply_impulse(&mut self, id: &str, impulse: Position) -> bool;
    fn add_collider(&mut self, id: &str, radius: f64) -> bool;
    fn remove_collider(&mut self, id: &str) -> bool;
    fn add_spring(&mut self, spring_id: &str, a: &str, b: &str, desc: SpringDesc) -> bool;
    fn remove_spring(&mut self, spring_id: &str) -> bool;
    fn step(&mut self, dt_ms: f64);
    fn position(&self, id: &str) -> Option<Position>;
    /// Authoritative post-step positions
    fn positions(&self) -> BTreeMap<String, Position>;
}

/// Pixels per simulation "meter", used to scale rapier's contact tolerances
const LENGTH_UNIT: f64 = 100.0;
const BODY_MASS: f64 = 1.0;
const LINEAR_DAMPING: f64 = 3.0;

fn to_vector(position: Position) -> Vector<Real> {
    vector![position.x, position.y]
}

fn to_position(vector: &Vector<Real>) -> Position {
    Position::new(vector.x, vector.y)
}

fn rigid_body_type(body_type: BodyType) -> RigidBodyType {
    match body_type {
        BodyType::Kinematic => RigidBodyType::KinematicPositionBased,
        BodyType::Dynamic => RigidBodyType::Dynamic,
    }
}

/// Rapier world keyed by workshop ids
pub struct RapierWorld {
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    physics_pipeline: PhysicsPipeline,
    island_manager: IslandManager,
    broad_phase: BroadPhaseMultiSap,
    narrow_phase: NarrowPhase,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    bodies: BTreeMap<String, RigidBodyHandle>,
    colliders: HashMap<String, ColliderHandle>,
    /// spring id -> (joint, body a, body b)
    springs: HashMap<String, (ImpulseJointHandle, String, String)>,
}

impl Default for RapierWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl RapierWorld {
    pub fn new() -> Self {
        let integration_parameters = IntegrationParameters {
            length_unit: LENGTH_UNIT,
            ..IntegrationParameters::default()
        };
        Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            gravity: vector![0.0, 0.0],
            integration_parameters,
            physics_pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseMultiSap::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            bodies: BTreeMap::new(),
            colliders: HashMap::new(),
            springs: HashMap::new(),
        }
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn spring_count(&self) -> usize {
        self.springs.len()
    }

    pub fn velocity(&self, id: &str) -> Option<Position> {
        self.body(id).map(|rb| to_position(rb.linvel()))
    }

    fn body(&self, id: &str) -> Option<&RigidBody> {
        self.bodies
            .get(id)
            .and_then(|handle| self.rigid_body_set.get(*handle))
    }

    fn body_mut(&mut self, id: &str) -> Option<&mut RigidBody> {
        let handle = *self.bodies.get(id)?;
        self.rigid_body_set.get_mut(handle)
    }

    fn detach_springs(&mut self, id: &str) {
        let attached: Vec<String> = self
            .springs
            .iter()
            .filter(|(_, (_, a, b))| a == id || b == id)
            .map(|(spring_id, _)| spring_id.clone())
            .collect();
        if !attached.is_empty() {
            debug!("Dropped {} springs attached to {}", attached.len(), id);
        }
        for spring_id in attached {
            self.remove_spring(&spring_id);
        }
    }
}

impl PhysicsBackend for RapierWorld {
    fn add_body(&mut self, id: &str, position: Position, body_type: BodyType) {
        self.remove_body(id);
        let rigid_body = RigidBodyBuilder::new(rigid_body_type(body_type))
            .translation(to_vector(position))
            .additional_mass(BODY_MASS)
            .lock_rotations()
            .linear_damping(LINEAR_DAMPING)
            .gravity_scale(0.0)
            .build();
        let handle = self.rigid_body_set.insert(rigid_body);
        self.bodies.insert(id.to_string(), handle);
    }

    fn remove_body(&mut self, id: &str) -> bool {
        if !self.bodies.contains_key(id) {
            return false;
        }
        self.detach_springs(id);
        self.colliders.remove(id);
        let Some(handle) = self.bodies.remove(id) else {
            return false;
        };
        self.rigid_body_set
            .remove(
                handle,
                &mut self.island_manager,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                true,
            )
            .is_some()
    }

    fn has_body(&self, id: &str) -> bool {
        self.bodies.contains_key(id)
    }

    fn set_position(&mut self, id: &str, position: Position) -> bool {
        match self.body_mut(id) {
            Some(rb) => {
                rb.set_translation(to_vector(position), true);
                if !rb.is_dynamic() {
                    rb.set_linvel(vector![0.0, 0.0], true);
                }
                true
            }
            None => false,
        }
    }

    fn set_body_type(&mut self, id: &str, body_type: BodyType) -> bool {
        match self.body_mut(id) {
            Some(rb) => {
                rb.set_linvel(vector![0.0, 0.0], true);
                rb.set_body_type(rigid_body_type(body_type), true);
                true
            }
            None => false,
        }
    }

    fn body_type(&self, id: &str) -> Option<BodyType> {
        self.body(id).map(|rb| {
            if rb.is_dynamic() {
                BodyType::Dynamic
            } else {
                BodyType::Kinematic
            }
        })
    }

    fn apply_impulse(&mut self, id: &str, impulse: Position) -> bool {
        match self.body_mut(id) {
            Some(rb) if rb.is_dynamic() => {
                // unit mass: the impulse is the velocity change
                let linvel = *rb.linvel() + to_vector(impulse) / BODY_MASS;
                rb.set_linvel(linvel, true);
                true
            }
            _ => false,
        }
    }

    fn add_collider(&mut self, id: &str, radius: f64) -> bool {
        let Some(parent) = self.bodies.get(id).copied() else {
            return false;
        };
        if let Some(old) = self.colliders.remove(id) {
            self.collider_set
                .remove(old, &mut self.island_manager, &mut self.rigid_body_set, true);
        }
        // Mass comes from the body; the collider only shapes contacts
        let collider = ColliderBuilder::ball(radius).density(0.0).build();
        let handle =
            self.collider_set
                .insert_with_parent(collider, parent, &mut self.rigid_body_set);
        self.colliders.insert(id.to_string(), handle);
        true
    }

    fn remove_collider(&mut self, id: &str) -> bool {
        let Some(handle) = self.colliders.remove(id) else {
            return false;
        };
        self.collider_set
            .remove(handle, &mut self.island_manager, &mut self.rigid_body_set, true)
            .is_some()
    }

    fn add_spring(&mut self, spring_id: &str, a: &str, b: &str, desc: SpringDesc) -> bool {
        let (Some(handle_a), Some(handle_b)) =
            (self.bodies.get(a).copied(), self.bodies.get(b).copied())
        else {
            return false;
        };
        self.remove_spring(spring_id);
        let joint = SpringJointBuilder::new(desc.rest_length, desc.stiffness, desc.damping).build();
        let handle = self
            .impulse_joint_set
            .insert(handle_a, handle_b, joint, true);
        self.springs.insert(
            spring_id.to_string(),
            (handle, a.to_string(), b.to_string()),
        );
        true
    }

    fn remove_spring(&mut self, spring_id: &str) -> bool {
        match self.springs.remove(spring_id) {
            Some((handle, _, _)) => {
                self.impulse_joint_set.remove(handle, true);
                true
            }
            None => false,
        }
    }

    fn step(&mut self, dt_ms: f64) {
        if dt_ms <= 0.0 {
            return;
        }
        self.integration_parameters.dt = dt_ms / 1000.0;
        self.physics_pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            None,
            &(),
            &(),
        );
        trace!("Stepped {} bodies by {:.1}ms", self.bodies.len(), dt_ms);
    }

    fn position(&self, id: &str) -> Option<Position> {
        self.body(id).map(|rb| to_position(rb.translation()))
    }

    fn positions(&self) -> BTreeMap<String, Position> {
        self.bodies
            .iter()
            .filter_map(|(id, handle)| {
                self.rigid_body_set
                    .get(*handle)
                    .map(|rb| (id.clone(), to_position(rb.translation())))
            })
            .collect()
    }
}
