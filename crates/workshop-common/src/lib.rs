//! Workshop Common - Shared utilities and types
//!
//! This crate provides the error type, settings structs, tuning constants,
//! the clock abstraction and small utilities used by every Workshop crate.

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConversationSettings, GatewaySettings, PersistenceSettings, SimulationSettings,
    WorkshopSettings,
};
pub use error::{Result, WorkshopError};
pub use types::Position;
pub use utils::*;
