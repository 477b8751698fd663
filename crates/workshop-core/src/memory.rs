//! Per-agent bounded memory
//!
//! Each instance gets a lazily created `AgentMemory` with ring buffers for
//! notes, interactions and pinboard items. The whole store is persisted to
//! one JSON file per active host and is only ever cleared explicitly.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use workshop_common::constants::memory::{
    MAX_ENVIRONMENT_SUMMARY_CHARS, MAX_PINBOARD_ITEMS, MAX_RECENT_INTERACTIONS, MAX_WORKSPACE_NOTES,
};
use workshop_common::{Result, sanitize_key, truncate_string};

/// What an agent last learned from an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentEntry {
    pub summary: String,
    pub last_read_at: i64,
}

/// One remembered exchange with another agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub conversation_id: String,
    pub with_agent_ids: Vec<String>,
    pub summary: String,
    pub at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentMemory {
    pub context_summary: String,
    pub workspace_notes: VecDeque<String>,
    pub recent_interactions: VecDeque<Interaction>,
    pub environment_state: HashMap<String, EnvironmentEntry>,
    pub active_pinboard_items: VecDeque<String>,
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, cap: usize) {
    buffer.push_back(item);
    while buffer.len() > cap {
        buffer.pop_front();
    }
}

impl AgentMemory {
    pub fn set_context_summary(&mut self, summary: impl Into<String>) {
        self.context_summary = summary.into();
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        push_bounded(&mut self.workspace_notes, note.into(), MAX_WORKSPACE_NOTES);
    }

    pub fn record_interaction(&mut self, interaction: Interaction) {
        push_bounded(&mut self.recent_interactions, interaction, MAX_RECENT_INTERACTIONS);
    }

    /// Remember a pinboard item; re-pinning an item moves it to the back
    pub fn pin_item(&mut self, item_id: impl Into<String>) {
        let item_id = item_id.into();
        self.active_pinboard_items.retain(|existing| existing != &item_id);
        push_bounded(&mut self.active_pinboard_items, item_id, MAX_PINBOARD_ITEMS);
    }

    pub fn record_read(&mut self, element_id: &str, summary: &str, at: i64) {
        self.environment_state.insert(
            element_id.to_string(),
            EnvironmentEntry {
                summary: truncate_string(summary, MAX_ENVIRONMENT_SUMMARY_CHARS),
                last_read_at: at,
            },
        );
    }

    /// Never read, or last read more than `stale_after_ms` ago
    pub fn is_stale(&self, element_id: &str, now: i64, stale_after_ms: i64) -> bool {
        self.environment_state
            .get(element_id)
            .is_none_or(|entry| now - entry.last_read_at > stale_after_ms)
    }
}

/// Every instance's memory, persisted per host
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    memories: HashMap<String, AgentMemory>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Backed by `<data_dir>/memory/<host>.json`, loading what is already there
    pub fn open(data_dir: impl AsRef<Path>, host: &str) -> Result<Self> {
        let path = data_dir
            .as_ref()
            .join("memory")
            .join(format!("{}.json", sanitize_key(host)));
        let memories = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        info!("Opened agent memory at {:?} ({} agents)", path, memories.len());
        Ok(Self {
            memories,
            path: Some(path),
        })
    }

    /// Memory for an instance, created on first access
    pub fn get_or_create(&mut self, instance_id: &str) -> &mut AgentMemory {
        self.memories.entry(instance_id.to_string()).or_default()
    }

    pub fn get(&self, instance_id: &str) -> Option<&AgentMemory> {
        self.memories.get(instance_id)
    }

    pub fn clear(&mut self, instance_id: &str) -> bool {
        self.memories.remove(instance_id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.memories.clear();
    }

    /// Write the store to disk; a no-op for in-memory stores
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.memories)?)?;
        debug!("Saved {} agent memories to {:?}", self.memories.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffers_evict_oldest() {
        let mut memory = AgentMemory::default();
        for i in 0..12 {
            memory.add_note(format!("note {}", i));
        }
        assert_eq!(memory.workspace_notes.len(), MAX_WORKSPACE_NOTES);
        assert_eq!(memory.workspace_notes.front().map(String::as_str), Some("note 2"));

        for i in 0..7 {
            memory.pin_item(format!("pin {}", i));
        }
        assert_eq!(memory.active_pinboard_items.len(), MAX_PINBOARD_ITEMS);
        assert_eq!(memory.active_pinboard_items.front().map(String::as_str), Some("pin 2"));

        for i in 0..6 {
            memory.record_interaction(Interaction {
                conversation_id: format!("c{}", i),
                with_agent_ids: vec![],
                summary: String::new(),
                at: i,
            });
        }
        assert_eq!(memory.recent_interactions.len(), MAX_RECENT_INTERACTIONS);
        assert_eq!(memory.recent_interactions[0].conversation_id, "c1");
    }

    #[test]
    fn test_repin_moves_to_back() {
        let mut memory = AgentMemory::default();
        memory.pin_item("a");
        memory.pin_item("b");
        memory.pin_item("a");
        assert_eq!(memory.active_pinboard_items, VecDeque::from(vec!["b".to_string(), "a".to_string()]));
    }

    #[test]
    fn test_staleness() {
        let mut memory = AgentMemory::default();
        assert!(memory.is_stale("board", 1_000, 300_000));
        memory.record_read("board", "rules", 1_000);
        assert!(!memory.is_stale("board", 200_000, 300_000));
        assert!(memory.is_stale("board", 302_000, 300_000));
    }

    #[test]
    fn test_store_persists_per_host() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = MemoryStore::open(dir.path(), "gateway.local:18789").unwrap();
            store.get_or_create("inst-1").set_context_summary("talked about rust");
            store.save().unwrap();
        }
        let store = MemoryStore::open(dir.path(), "gateway.local:18789").unwrap();
        assert_eq!(
            store.get("inst-1").map(|m| m.context_summary.as_str()),
            Some("talked about rust")
        );

        let other = MemoryStore::open(dir.path(), "other-host").unwrap();
        assert!(other.get("inst-1").is_none());
    }
}
