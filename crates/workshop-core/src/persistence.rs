//! Snapshots, the local cache and debounced auto-save
//!
//! A `WorkshopSnapshot` is the full serializable workshop state. The local
//! cache keeps one snapshot per active host on disk; `AutoSaver` writes it
//! shortly after the last mutation. Remote save slots are reached through
//! the `SaveSlotStore` trait.

use crate::context::SimulationContext;
use crate::conversation::WorkshopConversation;
use crate::elements::WorkshopElement;
use crate::memory::MemoryStore;
use crate::model::{AgentInstance, AgentProfile, Relationship};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workshop_common::constants::persistence::SNAPSHOT_VERSION;
use workshop_common::{Result, WorkshopError, WorkshopSettings, sanitize_key};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkshopSnapshot {
    pub version: u32,
    pub saved_at: i64,
    pub settings: WorkshopSettings,
    pub instances: Vec<AgentInstance>,
    #[serde(default)]
    pub profiles: Vec<AgentProfile>,
    #[serde(default)]
    pub elements: Vec<WorkshopElement>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub conversations: Vec<WorkshopConversation>,
}

impl WorkshopSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let snapshot: WorkshopSnapshot = serde_json::from_str(raw)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(WorkshopError::Persistence(format!(
                "snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }
}

/// Fast-path snapshot file for one active host
#[derive(Debug, Clone)]
pub struct LocalCache {
    path: PathBuf,
}

impl LocalCache {
    pub fn new(data_dir: impl AsRef<Path>, host: &str) -> Self {
        let path = data_dir
            .as_ref()
            .join("cache")
            .join(format!("workshop-{}.json", sanitize_key(host)));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<WorkshopSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let snapshot = WorkshopSnapshot::from_json(&raw)?;
        debug!("Loaded cached workshop from {:?}", self.path);
        Ok(Some(snapshot))
    }

    /// Write through a temp file so a crash never leaves a torn cache
    pub fn save(&self, snapshot: &WorkshopSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, snapshot.to_json()?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Cached workshop to {:?}", self.path);
        Ok(())
    }

    pub fn clear(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path)?;
        Ok(true)
    }
}

/// Remote key-value save slots holding opaque snapshots
#[async_trait]
pub trait SaveSlotStore: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<String>>;
    async fn load(&self, slot: &str) -> anyhow::Result<Option<WorkshopSnapshot>>;
    async fn save(&self, slot: &str, snapshot: &WorkshopSnapshot) -> anyhow::Result<()>;
    async fn delete(&self, slot: &str) -> anyhow::Result<bool>;
}

/// Process-local save slots
#[derive(Debug, Default)]
pub struct InMemorySaveSlots {
    slots: Mutex<BTreeMap<String, String>>,
}

impl InMemorySaveSlots {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SaveSlotStore for InMemorySaveSlots {
    async fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.slots.lock().keys().cloned().collect())
    }

    async fn load(&self, slot: &str) -> anyhow::Result<Option<WorkshopSnapshot>> {
        let raw = self.slots.lock().get(slot).cloned();
        match raw {
            Some(raw) => Ok(Some(WorkshopSnapshot::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, slot: &str, snapshot: &WorkshopSnapshot) -> anyhow::Result<()> {
        let raw = snapshot.to_json()?;
        self.slots.lock().insert(slot.to_string(), raw);
        Ok(())
    }

    async fn delete(&self, slot: &str) -> anyhow::Result<bool> {
        Ok(self.slots.lock().remove(slot).is_some())
    }
}

/// Debounced writer for the local cache
///
/// Every mutation reschedules the pending write; only the last one in a
/// burst reaches disk.
pub struct AutoSaver {
    context: Weak<parking_lot::Mutex<SimulationContext>>,
    cache: LocalCache,
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl AutoSaver {
    /// Attach to a context so its mutations schedule saves
    pub fn attach(
        context: &Arc<parking_lot::Mutex<SimulationContext>>,
        cache: LocalCache,
        debounce: Duration,
    ) -> Arc<Self> {
        let saver = Arc::new(Self {
            context: Arc::downgrade(context),
            cache,
            debounce,
            pending: Mutex::new(None),
        });
        let hook = Arc::clone(&saver);
        context
            .lock()
            .set_change_hook(Some(Arc::new(move || hook.schedule())));
        info!("Auto-save attached ({:?} debounce)", debounce);
        saver
    }

    /// (Re)arm the pending write
    pub fn schedule(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping auto-save");
            return;
        };
        let context = self.context.clone();
        let cache = self.cache.clone();
        let debounce = self.debounce;
        let task = runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(context) = context.upgrade() else {
                return;
            };
            let (snapshot, memory) = capture(&context);
            drop(context);
            let written =
                tokio::task::spawn_blocking(move || write_state(&cache, &snapshot, &memory)).await;
            match written {
                Ok(Ok(())) => debug!("Auto-saved workshop state"),
                Ok(Err(e)) => warn!("Auto-save failed: {}", e),
                Err(e) => warn!("Auto-save task ended abnormally: {}", e),
            }
        });
        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    /// Write immediately, cancelling any pending write
    pub fn flush(&self) -> Result<()> {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        let Some(context) = self.context.upgrade() else {
            return Ok(());
        };
        let (snapshot, memory) = capture(&context);
        write_state(&self.cache, &snapshot, &memory)
    }

    /// Cancel any pending write and detach from the context
    pub fn stop(&self) {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        if let Some(context) = self.context.upgrade() {
            context.lock().set_change_hook(None);
        }
    }
}

/// Copy what gets persisted; the lock is released before any disk I/O
fn capture(context: &parking_lot::Mutex<SimulationContext>) -> (WorkshopSnapshot, MemoryStore) {
    let ctx = context.lock();
    (ctx.snapshot(), ctx.memory().clone())
}

fn write_state(cache: &LocalCache, snapshot: &WorkshopSnapshot, memory: &MemoryStore) -> Result<()> {
    memory.save()?;
    cache.save(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Behavior;
    use workshop_common::Position;

    fn sample_snapshot() -> WorkshopSnapshot {
        let mut ctx = SimulationContext::headless(WorkshopSettings::default());
        ctx.place_agent("agent-a", Position::new(10.0, 20.0), Behavior::Wander);
        ctx.snapshot()
    }

    #[test]
    fn test_local_cache_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "gateway.local:18789");
        assert!(cache.load().unwrap().is_none());

        let snapshot = sample_snapshot();
        cache.save(&snapshot).unwrap();
        assert!(cache.path().ends_with("cache/workshop-gateway.local_18789.json"));
        assert_eq!(cache.load().unwrap(), Some(snapshot));
        assert!(cache.clear().unwrap());
        assert!(!cache.clear().unwrap());
    }

    #[test]
    fn test_newer_snapshot_version_rejected() {
        let mut snapshot = sample_snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let raw = serde_json::to_string(&snapshot).unwrap();
        assert!(matches!(
            WorkshopSnapshot::from_json(&raw),
            Err(WorkshopError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_slots() {
        let slots = InMemorySaveSlots::new();
        let snapshot = sample_snapshot();
        slots.save("main", &snapshot).await.unwrap();
        assert_eq!(slots.list().await.unwrap(), vec!["main".to_string()]);
        assert_eq!(slots.load("main").await.unwrap(), Some(snapshot));
        assert!(slots.delete("main").await.unwrap());
        assert!(slots.load("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_saver_coalesces_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "host");
        let shared = SimulationContext::headless(WorkshopSettings::default()).into_shared();
        let saver = AutoSaver::attach(&shared, cache.clone(), Duration::from_millis(30));

        for i in 0..5 {
            shared
                .lock()
                .place_agent("agent", Position::new(i as f64, 0.0), Behavior::Stationary);
        }
        assert!(cache.load().unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let saved = cache.load().unwrap().unwrap();
        assert_eq!(saved.instances.len(), 5);
        saver.stop();
    }

    #[test]
    fn test_flush_writes_memory_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "host");
        let mut ctx = SimulationContext::headless(WorkshopSettings::default());
        ctx.set_memory_store(MemoryStore::open(dir.path(), "host").unwrap());
        let a = ctx.place_agent("agent-a", Position::default(), Behavior::Stationary);
        ctx.memory_mut(&a).add_note("remember the demo");
        let shared = ctx.into_shared();
        let saver = AutoSaver::attach(&shared, cache.clone(), Duration::from_secs(60));

        saver.flush().unwrap();

        assert_eq!(cache.load().unwrap().unwrap().instances.len(), 1);
        let reopened = MemoryStore::open(dir.path(), "host").unwrap();
        let notes = &reopened.get(&a).unwrap().workspace_notes;
        assert_eq!(notes.front().map(String::as_str), Some("remember the demo"));
        // the context is free again once flush returns
        assert!(shared.try_lock().is_some());
        saver.stop();
    }
}
