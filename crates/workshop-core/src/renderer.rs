//! Renderer capability set
//!
//! The simulation pushes visual side effects through this trait and never
//! reads anything back. Coordinates are always canonical world space; any
//! projection is the renderer's business.

use crate::elements::ElementKind;
use parking_lot::Mutex;
use workshop_common::Position;

/// Fire-and-forget visual side effects. Every method defaults to a no-op.
pub trait Renderer: Send + Sync {
    fn create_agent_sprite(&self, _instance_id: &str, _agent_id: &str, _position: Position) {}
    fn remove_sprite(&self, _id: &str) {}
    fn update_sprite_position(&self, _id: &str, _position: Position) {}
    fn set_glow_color(&self, _instance_id: &str, _color: u32) {}
    fn trigger_pulse(&self, _instance_id: &str) {}
    fn show_reaction_emoji(&self, _instance_id: &str, _emoji: &str) {}
    fn create_element_sprite(&self, _element_id: &str, _kind: ElementKind, _position: Position) {}
    fn update_badge(&self, _element_id: &str, _count: usize) {}
    fn create_rope(&self, _relationship_id: &str, _from: Position, _to: Position) {}
    /// `hot` is true while both endpoints share an active conversation
    fn update_rope(&self, _relationship_id: &str, _from: Position, _to: Position, _hot: bool) {}
    fn remove_rope(&self, _relationship_id: &str) {}
}

/// Discards everything (headless runs)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {}

/// One recorded renderer call
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCall {
    CreateAgentSprite { instance_id: String, agent_id: String },
    RemoveSprite(String),
    SetGlow { instance_id: String, color: u32 },
    Pulse(String),
    Reaction { instance_id: String, emoji: String },
    CreateElementSprite(String),
    Badge { element_id: String, count: usize },
    CreateRope(String),
    UpdateRope { relationship_id: String, hot: bool },
    RemoveRope(String),
}

/// Keeps every call except per-frame position updates, for assertions
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    calls: Mutex<Vec<RenderCall>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&RenderCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn push(&self, call: RenderCall) {
        self.calls.lock().push(call);
    }
}

impl Renderer for RecordingRenderer {
    fn create_agent_sprite(&self, instance_id: &str, agent_id: &str, _position: Position) {
        self.push(RenderCall::CreateAgentSprite {
            instance_id: instance_id.to_string(),
            agent_id: agent_id.to_string(),
        });
    }

    fn remove_sprite(&self, id: &str) {
        self.push(RenderCall::RemoveSprite(id.to_string()));
    }

    fn set_glow_color(&self, instance_id: &str, color: u32) {
        self.push(RenderCall::SetGlow {
            instance_id: instance_id.to_string(),
            color,
        });
    }

    fn trigger_pulse(&self, instance_id: &str) {
        self.push(RenderCall::Pulse(instance_id.to_string()));
    }

    fn show_reaction_emoji(&self, instance_id: &str, emoji: &str) {
        self.push(RenderCall::Reaction {
            instance_id: instance_id.to_string(),
            emoji: emoji.to_string(),
        });
    }

    fn create_element_sprite(&self, element_id: &str, _kind: ElementKind, _position: Position) {
        self.push(RenderCall::CreateElementSprite(element_id.to_string()));
    }

    fn update_badge(&self, element_id: &str, count: usize) {
        self.push(RenderCall::Badge {
            element_id: element_id.to_string(),
            count,
        });
    }

    fn create_rope(&self, relationship_id: &str, _from: Position, _to: Position) {
        self.push(RenderCall::CreateRope(relationship_id.to_string()));
    }

    fn update_rope(&self, relationship_id: &str, _from: Position, _to: Position, hot: bool) {
        self.push(RenderCall::UpdateRope {
            relationship_id: relationship_id.to_string(),
            hot,
        });
    }

    fn remove_rope(&self, relationship_id: &str) {
        self.push(RenderCall::RemoveRope(relationship_id.to_string()));
    }
}
