//! Tuning constants for the Workshop simulation
//!
//! Distances are world-space pixels, durations are milliseconds unless the
//! name says otherwise.

/// Default radius within which two agents count as "near"
pub const DEFAULT_PROXIMITY_RADIUS: f64 = 150.0;

/// Distance at which an agent can interact with an element
pub const INTERACTION_RADIUS: f64 = 70.0;

/// Action queue capacity (compactContext entries do not count)
pub const ACTION_QUEUE_CAP: usize = 5;

/// Per-agent memory ring buffer sizes
pub mod memory {
    pub const MAX_WORKSPACE_NOTES: usize = 10;
    pub const MAX_RECENT_INTERACTIONS: usize = 5;
    pub const MAX_PINBOARD_ITEMS: usize = 5;
    /// Summaries stored in environment state are truncated to this length
    pub const MAX_ENVIRONMENT_SUMMARY_CHARS: usize = 400;
    /// Notes taken from board reads are truncated to this length
    pub const MAX_NOTE_CHARS: usize = 200;
}

/// Pinboard items are removed once upvotes - downvotes reaches this
pub const PIN_REMOVAL_SCORE: i64 = -3;

/// Agent movement
pub mod movement {
    pub const WANDER_SPEED_PX_PER_SEC: f64 = 80.0;
    pub const WANDER_RETARGET_MS: f64 = 3_000.0;
    pub const WANDER_MIN_RADIUS: f64 = 30.0;
    pub const WANDER_MAX_RADIUS: f64 = 120.0;
    pub const INTEREST_RADIUS: f64 = 300.0;
    pub const INTEREST_BIAS: f64 = 0.6;
    pub const INTEREST_JITTER: f64 = 30.0;
    pub const PATROL_RADIUS: f64 = 100.0;
    pub const PATROL_ANGULAR_SPEED: f64 = 0.0006;
    pub const MAX_WANDER_EXTENT: f64 = 250.0;
    pub const HOME_IMPULSE: f64 = 120.0;
    pub const TETHER_MS: f64 = 600.0;
}

/// FSM and loop timers
pub mod timers {
    pub const HEARTBEAT_MIN_MS: f64 = 10_000.0;
    pub const HEARTBEAT_MAX_MS: f64 = 15_000.0;
    pub const HEARTBEAT_DURATION_MS: f64 = 2_000.0;
    pub const COOLDOWN_MS: f64 = 4_000.0;
    pub const SEEK_INFO_INTERVAL_MS: f64 = 90_000.0;
    pub const SEEK_INFO_RADIUS: f64 = 400.0;
    pub const STALE_READ_MS: i64 = 5 * 60 * 1_000;
    pub const REACTION_COOLDOWN_MS: f64 = 30_000.0;
    pub const PROXIMITY_GATE_INTERVAL_MS: f64 = 1_000.0;
}

/// Conversation admission defaults
pub mod conversation {
    pub const MAX_CONCURRENT_CONVERSATIONS: usize = 3;
    pub const IDLE_BANTER_BUDGET_PER_HOUR: u32 = 20;
    pub const BANTER_COOLDOWN_MS: i64 = 120_000;
    pub const BANTER_CHECK_INTERVAL_MS: f64 = 28_000.0;
    pub const BANTER_MAX_TURNS: u32 = 4;
    pub const BUDGET_WINDOW_MS: i64 = 3_600_000;
}

/// Gateway polling and compaction
pub mod gateway {
    pub const POLL_INTERVAL_MS: u64 = 2_000;
    pub const INITIAL_POLL_DELAY_MS: u64 = 3_000;
    pub const RESPONSE_TIMEOUT_MS: u64 = 120_000;
    pub const COMPACTION_TIMEOUT_MS: u64 = 60_000;
    pub const HISTORY_LIMIT: usize = 50;
    pub const COMPACTION_TURN_THRESHOLD: u32 = 8;
    pub const DEFAULT_MAX_TURNS: u32 = 6;
}

/// Persistence
pub mod persistence {
    pub const AUTO_SAVE_DEBOUNCE_MS: u64 = 300;
    pub const SNAPSHOT_VERSION: u32 = 1;
}
