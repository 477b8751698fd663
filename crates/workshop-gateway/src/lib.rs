//! Workshop Gateway - Chat gateway integration for the Workshop
//!
//! This crate connects the simulation to a chat gateway that only offers
//! single-agent sessions:
//! - The `ChatRpc` surface (`chat.send` / `chat.history`)
//! - The `GatewayBridge` turn loop, element reads and context compaction
//! - Prompt construction
//! - A scripted in-process gateway for headless runs

pub mod bridge;
pub mod prompts;
pub mod rpc;
pub mod scripted;

// Re-export key types for convenience
pub use bridge::{BridgeEvent, GatewayBridge, Listener, LoopOutcome, WorkshopMessage};
pub use rpc::{ChatRpc, ChatSendRequest, HistoryMessage, extract_text, latest_reply};
pub use scripted::{Responder, ScriptedGateway};
