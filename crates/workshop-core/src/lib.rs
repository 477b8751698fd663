//! Workshop Core - The spatial agent simulation
//!
//! This crate provides the frame-driven simulation behind the workshop canvas:
//! - Proximity queries and per-agent action queues
//! - The agent state machine with debounced transitions
//! - Conversation admission, proximity gating and idle banter
//! - Workshop elements, memory and snapshot persistence
//! - The physics and renderer seams driven by the frame loop

pub mod context;
pub mod conversation;
pub mod elements;
pub mod fsm;
pub mod memory;
pub mod model;
pub mod persistence;
pub mod physics;
pub mod proximity;
pub mod queue;
pub mod renderer;
pub mod simulation;

// Re-export key types for convenience
pub use context::{AwarenessScan, ChangeHook, MotionState, SharedContext, SimulationContext};
pub use conversation::{
    ConversationKind, ConversationManager, ConversationStatus, GateOutcome, WorkshopConversation,
    agent_session_key, parse_agent_session_key,
};
pub use elements::{ElementKind, ElementPayload, VoteDirection, VoteOutcome, WorkshopElement};
pub use fsm::{AgentState, FsmEvent, FsmRegistry};
pub use memory::{AgentMemory, MemoryStore};
pub use model::{AgentInstance, AgentProfile, Behavior, Relationship};
pub use persistence::{AutoSaver, InMemorySaveSlots, LocalCache, SaveSlotStore, WorkshopSnapshot};
pub use physics::{BodyType, PhysicsBackend, RapierWorld, SpringDesc};
pub use proximity::InstanceMap;
pub use queue::{ActionQueues, AgentAction, ReadPriority};
pub use renderer::{NullRenderer, RecordingRenderer, Renderer};
pub use simulation::{AgentTasks, BanterCallback, RunningSimulation, Simulation};
