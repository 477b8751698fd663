//! Placed agents, logical agent profiles and relationships

use serde::{Deserialize, Serialize};
use workshop_common::{Position, generate_id};

/// Legacy movement preference stored on an instance. The FSM's initial
/// state is derived from it on creation and on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    #[default]
    Stationary,
    Wander,
    Patrol,
}

/// A placed occurrence of a logical agent on the canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstance {
    pub instance_id: String,
    pub agent_id: String,
    pub position: Position,
    pub behavior: Behavior,
    pub home_position: Position,
}

impl AgentInstance {
    pub fn new(agent_id: impl Into<String>, position: Position, behavior: Behavior) -> Self {
        Self {
            instance_id: generate_id(),
            agent_id: agent_id.into(),
            position,
            behavior,
            home_position: position,
        }
    }
}

/// Display data for a logical agent shared by any number of instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub agent_id: String,
    pub name: String,
}

/// A labeled directed edge between two instances, drawn as a cable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: String,
    pub from_instance_id: String,
    pub to_instance_id: String,
    pub label: String,
}

impl Relationship {
    pub fn new(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            from_instance_id: from.into(),
            to_instance_id: to.into(),
            label: label.into(),
        }
    }

    pub fn touches(&self, instance_id: &str) -> bool {
        self.from_instance_id == instance_id || self.to_instance_id == instance_id
    }
}
