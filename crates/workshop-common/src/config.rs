//! Settings for the Workshop simulation
//!
//! All sections deserialize with `#[serde(default)]`, so a TOML file only
//! needs to name the values it overrides.

use crate::constants::{self, conversation, gateway, movement, persistence, timers};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level settings, persisted alongside every snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkshopSettings {
    pub simulation: SimulationSettings,
    pub conversation: ConversationSettings,
    pub gateway: GatewaySettings,
    pub persistence: PersistenceSettings,
}

impl WorkshopSettings {
    /// Parse settings from a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load settings from a TOML file, falling back to defaults when it is absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&raw)?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }
}

/// Movement, timer and radius tuning for the frame loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub proximity_radius: f64,
    pub interaction_radius: f64,
    pub wander_speed: f64,
    pub wander_retarget_ms: f64,
    pub wander_min_radius: f64,
    pub wander_max_radius: f64,
    pub interest_radius: f64,
    pub interest_bias: f64,
    pub interest_jitter: f64,
    pub patrol_radius: f64,
    pub patrol_angular_speed: f64,
    pub max_wander_extent: f64,
    pub heartbeat_min_ms: f64,
    pub heartbeat_max_ms: f64,
    pub heartbeat_duration_ms: f64,
    pub cooldown_ms: f64,
    pub seek_info_interval_ms: f64,
    pub seek_info_radius: f64,
    pub stale_read_ms: i64,
    pub reaction_cooldown_ms: f64,
    pub proximity_gate_interval_ms: f64,
    /// Fixed RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            proximity_radius: constants::DEFAULT_PROXIMITY_RADIUS,
            interaction_radius: constants::INTERACTION_RADIUS,
            wander_speed: movement::WANDER_SPEED_PX_PER_SEC,
            wander_retarget_ms: movement::WANDER_RETARGET_MS,
            wander_min_radius: movement::WANDER_MIN_RADIUS,
            wander_max_radius: movement::WANDER_MAX_RADIUS,
            interest_radius: movement::INTEREST_RADIUS,
            interest_bias: movement::INTEREST_BIAS,
            interest_jitter: movement::INTEREST_JITTER,
            patrol_radius: movement::PATROL_RADIUS,
            patrol_angular_speed: movement::PATROL_ANGULAR_SPEED,
            max_wander_extent: movement::MAX_WANDER_EXTENT,
            heartbeat_min_ms: timers::HEARTBEAT_MIN_MS,
            heartbeat_max_ms: timers::HEARTBEAT_MAX_MS,
            heartbeat_duration_ms: timers::HEARTBEAT_DURATION_MS,
            cooldown_ms: timers::COOLDOWN_MS,
            seek_info_interval_ms: timers::SEEK_INFO_INTERVAL_MS,
            seek_info_radius: timers::SEEK_INFO_RADIUS,
            stale_read_ms: timers::STALE_READ_MS,
            reaction_cooldown_ms: timers::REACTION_COOLDOWN_MS,
            proximity_gate_interval_ms: timers::PROXIMITY_GATE_INTERVAL_MS,
            seed: None,
        }
    }
}

/// Admission control for conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    pub max_concurrent_conversations: usize,
    pub idle_banter_enabled: bool,
    pub idle_banter_budget_per_hour: u32,
    pub banter_cooldown_ms: i64,
    pub banter_check_interval_ms: f64,
    pub banter_max_turns: u32,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_concurrent_conversations: conversation::MAX_CONCURRENT_CONVERSATIONS,
            idle_banter_enabled: true,
            idle_banter_budget_per_hour: conversation::IDLE_BANTER_BUDGET_PER_HOUR,
            banter_cooldown_ms: conversation::BANTER_COOLDOWN_MS,
            banter_check_interval_ms: conversation::BANTER_CHECK_INTERVAL_MS,
            banter_max_turns: conversation::BANTER_MAX_TURNS,
        }
    }
}

/// Chat gateway polling behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub poll_interval_ms: u64,
    pub initial_poll_delay_ms: u64,
    pub response_timeout_ms: u64,
    pub compaction_timeout_ms: u64,
    pub history_limit: usize,
    pub compaction_turn_threshold: u32,
    pub default_max_turns: u32,
}

impl GatewaySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn initial_poll_delay(&self) -> Duration {
        Duration::from_millis(self.initial_poll_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn compaction_timeout(&self) -> Duration {
        Duration::from_millis(self.compaction_timeout_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: gateway::POLL_INTERVAL_MS,
            initial_poll_delay_ms: gateway::INITIAL_POLL_DELAY_MS,
            response_timeout_ms: gateway::RESPONSE_TIMEOUT_MS,
            compaction_timeout_ms: gateway::COMPACTION_TIMEOUT_MS,
            history_limit: gateway::HISTORY_LIMIT,
            compaction_turn_threshold: gateway::COMPACTION_TURN_THRESHOLD,
            default_max_turns: gateway::DEFAULT_MAX_TURNS,
        }
    }
}

/// Local cache and auto-save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub data_dir: PathBuf,
    /// Identifier of the gateway host the local cache is keyed by
    pub active_host: String,
    pub auto_save_debounce_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            active_host: "default".to_string(),
            auto_save_debounce_ms: persistence::AUTO_SAVE_DEBOUNCE_MS,
        }
    }
}
