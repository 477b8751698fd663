//! Per-agent action queue
//!
//! Bounded, priority-ordered and deduplicated. `CompactContext` entries are
//! exempt from the cap and are never evicted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use workshop_common::constants::ACTION_QUEUE_CAP;

/// Urgency of an element read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPriority {
    High,
    Normal,
}

/// A pending intent for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentAction {
    #[serde(rename_all = "camelCase")]
    ReadElement {
        element_id: String,
        priority: ReadPriority,
    },
    #[serde(rename_all = "camelCase")]
    ApproachAgent { target_instance_id: String },
    CompactContext,
    #[serde(rename_all = "camelCase")]
    SeekInfo { element_id: String },
}

impl AgentAction {
    /// Fixed ordering; lower runs first
    pub fn rank(&self) -> u8 {
        match self {
            AgentAction::CompactContext => 0,
            AgentAction::ReadElement {
                priority: ReadPriority::High,
                ..
            } => 1,
            AgentAction::ReadElement {
                priority: ReadPriority::Normal,
                ..
            } => 2,
            AgentAction::SeekInfo { .. } => 3,
            AgentAction::ApproachAgent { .. } => 4,
        }
    }

    /// (kind, identifying field) used for dedup
    fn dedup_key(&self) -> (&'static str, &str) {
        match self {
            AgentAction::ReadElement { element_id, .. } => ("readElement", element_id.as_str()),
            AgentAction::ApproachAgent { target_instance_id } => {
                ("approachAgent", target_instance_id.as_str())
            }
            AgentAction::CompactContext => ("compactContext", ""),
            AgentAction::SeekInfo { element_id } => ("seekInfo", element_id.as_str()),
        }
    }

    pub fn is_compact(&self) -> bool {
        matches!(self, AgentAction::CompactContext)
    }

    /// The element this action targets, if any
    pub fn element_id(&self) -> Option<&str> {
        match self {
            AgentAction::ReadElement { element_id, .. } | AgentAction::SeekInfo { element_id } => {
                Some(element_id.as_str())
            }
            _ => None,
        }
    }
}

/// All agents' queues, keyed by instance id
#[derive(Debug, Clone)]
pub struct ActionQueues {
    queues: HashMap<String, Vec<AgentAction>>,
    cap: usize,
}

impl Default for ActionQueues {
    fn default() -> Self {
        Self::with_cap(ACTION_QUEUE_CAP)
    }
}

impl ActionQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            queues: HashMap::new(),
            cap,
        }
    }

    /// Add an action. Returns false if an equivalent one was already queued.
    pub fn enqueue(&mut self, instance_id: &str, action: AgentAction) -> bool {
        let queue = self.queues.entry(instance_id.to_string()).or_default();
        if queue.iter().any(|a| a.dedup_key() == action.dedup_key()) {
            return false;
        }

        if !action.is_compact() {
            let bounded = queue.iter().filter(|a| !a.is_compact()).count();
            if bounded >= self.cap {
                // The queue is sorted, so the last non-compact entry is the lowest priority
                if let Some(idx) = queue.iter().rposition(|a| !a.is_compact()) {
                    let evicted = queue.remove(idx);
                    debug!("Queue for {} full, evicted {:?}", instance_id, evicted);
                }
            }
        }

        queue.push(action);
        queue.sort_by_key(AgentAction::rank);
        true
    }

    /// Highest-priority action without removing it
    pub fn peek(&self, instance_id: &str) -> Option<&AgentAction> {
        self.queues.get(instance_id).and_then(|q| q.first())
    }

    /// Remove and return the highest-priority action
    pub fn dequeue(&mut self, instance_id: &str) -> Option<AgentAction> {
        let queue = self.queues.get_mut(instance_id)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    pub fn len(&self, instance_id: &str) -> usize {
        self.queues.get(instance_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, instance_id: &str) -> bool {
        self.len(instance_id) == 0
    }

    pub fn contains(&self, instance_id: &str, action: &AgentAction) -> bool {
        self.queues
            .get(instance_id)
            .is_some_and(|q| q.iter().any(|a| a.dedup_key() == action.dedup_key()))
    }

    pub fn clear(&mut self, instance_id: &str) {
        self.queues.remove(instance_id);
    }

    /// Drop every queue (workshop reset)
    pub fn clear_all(&mut self) {
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(id: &str, priority: ReadPriority) -> AgentAction {
        AgentAction::ReadElement {
            element_id: id.to_string(),
            priority,
        }
    }

    fn seek(id: &str) -> AgentAction {
        AgentAction::SeekInfo {
            element_id: id.to_string(),
        }
    }

    #[test]
    fn test_duplicate_read_is_ignored() {
        let mut queues = ActionQueues::new();
        assert!(queues.enqueue("a", read("board", ReadPriority::Normal)));
        assert!(!queues.enqueue("a", read("board", ReadPriority::Normal)));
        assert_eq!(queues.len("a"), 1);
    }

    #[test]
    fn test_priority_order() {
        let mut queues = ActionQueues::new();
        queues.enqueue("a", seek("s1"));
        queues.enqueue(
            "a",
            AgentAction::ApproachAgent {
                target_instance_id: "b".to_string(),
            },
        );
        queues.enqueue("a", read("hi", ReadPriority::High));
        queues.enqueue("a", AgentAction::CompactContext);
        queues.enqueue("a", read("lo", ReadPriority::Normal));

        let mut order = Vec::new();
        while let Some(action) = queues.dequeue("a") {
            order.push(action.rank());
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queues = ActionQueues::new();
        queues.enqueue("a", seek("s1"));
        queues.enqueue("a", read("hi", ReadPriority::High));
        assert_eq!(queues.peek("a"), Some(&read("hi", ReadPriority::High)));
        assert_eq!(queues.len("a"), 2);
        assert_eq!(queues.peek("nobody"), None);
    }

    #[test]
    fn test_cap_evicts_lowest_priority_but_never_compact() {
        let mut queues = ActionQueues::new();
        queues.enqueue("a", AgentAction::CompactContext);
        queues.enqueue("a", read("r1", ReadPriority::High));
        queues.enqueue("a", read("r2", ReadPriority::Normal));
        queues.enqueue("a", seek("s1"));
        queues.enqueue("a", seek("s2"));
        queues.enqueue(
            "a",
            AgentAction::ApproachAgent {
                target_instance_id: "b".to_string(),
            },
        );
        assert_eq!(queues.len("a"), 6);

        // sixth non-compact action
        queues.enqueue("a", read("r3", ReadPriority::High));
        assert_eq!(queues.len("a"), 6);
        assert!(queues.contains("a", &AgentAction::CompactContext));
        assert!(!queues.contains(
            "a",
            &AgentAction::ApproachAgent {
                target_instance_id: "b".to_string()
            }
        ));
        assert!(queues.contains("a", &read("r3", ReadPriority::High)));
    }

    #[test]
    fn test_compact_is_exempt_from_cap() {
        let mut queues = ActionQueues::with_cap(1);
        queues.enqueue("a", seek("s1"));
        queues.enqueue("a", AgentAction::CompactContext);
        assert_eq!(queues.len("a"), 2);
        assert_eq!(queues.peek("a"), Some(&AgentAction::CompactContext));
    }

    #[test]
    fn test_clear() {
        let mut queues = ActionQueues::new();
        queues.enqueue("a", seek("s1"));
        queues.enqueue("b", seek("s1"));
        queues.clear("a");
        assert!(queues.is_empty("a"));
        assert_eq!(queues.len("b"), 1);
        queues.clear_all();
        assert!(queues.is_empty("b"));
    }
}
