//! Conversation registry and admission control
//!
//! The manager owns every `WorkshopConversation` and decides whether a new
//! one may start. It never touches FSMs directly: operations return the
//! instance ids that must receive `conversationStart` / `conversationEnd`,
//! and the `SimulationContext` delivers those events.

use crate::fsm::FsmRegistry;
use crate::model::Relationship;
use crate::proximity::{self, InstanceMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use workshop_common::constants::conversation::BUDGET_WINDOW_MS;
use workshop_common::{Clock, ConversationSettings, generate_prefixed_id, group_key, pair_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Task,
    Banter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Interrupted,
    Completed,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkshopConversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub participant_instance_ids: Vec<String>,
    pub participant_agent_ids: Vec<String>,
    pub session_key: String,
    pub status: ConversationStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub title: Option<String>,
}

impl WorkshopConversation {
    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }

    /// Sorted agent ids, identifying the group regardless of order
    pub fn pair_key(&self) -> String {
        group_key(&self.participant_agent_ids)
    }

    pub fn has_participant(&self, instance_id: &str) -> bool {
        self.participant_instance_ids.iter().any(|id| id == instance_id)
    }
}

/// Dedicated gateway session of one participant in a conversation
pub fn agent_session_key(agent_id: &str, conversation_id: &str) -> String {
    format!("agent:{}:workshop:{}", agent_id, conversation_id)
}

/// Split a session key built by `agent_session_key` into `(agent_id, conversation_id)`
pub fn parse_agent_session_key(session_key: &str) -> Option<(&str, &str)> {
    session_key.strip_prefix("agent:")?.split_once(":workshop:")
}

/// Result of a successful `start_conversation`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub conversation_id: String,
    /// False when an active conversation with the same session key was reused
    pub created: bool,
    /// Instances that must receive `conversationStart`
    pub notify: Vec<String>,
}

/// What the proximity gate did to one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub conversation_id: String,
    pub dropped: Vec<String>,
    pub completed: bool,
}

impl GateOutcome {
    /// Everyone who must receive `conversationEnd`
    pub fn to_notify(&self, remaining: &[String]) -> Vec<String> {
        let mut ids = self.dropped.clone();
        if self.completed {
            ids.extend(remaining.iter().cloned());
        }
        ids
    }
}

#[derive(Debug, Clone, Default)]
struct BanterBudget {
    window_start: Option<i64>,
    used: u32,
}

pub struct ConversationManager {
    conversations: BTreeMap<String, WorkshopConversation>,
    settings: ConversationSettings,
    budget: BanterBudget,
    /// Last end time per banter session key
    banter_ended_at: HashMap<String, i64>,
    clock: Arc<dyn Clock>,
}

impl ConversationManager {
    pub fn new(settings: ConversationSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            conversations: BTreeMap::new(),
            settings,
            budget: BanterBudget::default(),
            banter_ended_at: HashMap::new(),
            clock,
        }
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: ConversationSettings) {
        self.settings = settings;
    }

    pub fn active_count(&self) -> usize {
        self.conversations.values().filter(|c| c.is_active()).count()
    }

    /// Banter messages still allowed in the current hourly window
    pub fn banter_budget_remaining(&mut self) -> u32 {
        self.refresh_budget();
        self.settings
            .idle_banter_budget_per_hour
            .saturating_sub(self.budget.used)
    }

    fn refresh_budget(&mut self) {
        let now = self.clock.now_millis();
        if let Some(start) = self.budget.window_start {
            if now - start >= BUDGET_WINDOW_MS {
                debug!("Banter budget window elapsed, resetting");
                self.budget = BanterBudget::default();
            }
        }
    }

    fn consume_budget(&mut self) {
        if self.budget.window_start.is_none() {
            self.budget.window_start = Some(self.clock.now_millis());
        }
        self.budget.used += 1;
    }

    /// Admission control
    pub fn can_start(&mut self, kind: ConversationKind) -> bool {
        if self.active_count() >= self.settings.max_concurrent_conversations {
            return false;
        }
        match kind {
            ConversationKind::Task => true,
            ConversationKind::Banter => {
                self.settings.idle_banter_enabled && self.banter_budget_remaining() > 0
            }
        }
    }

    pub fn start_conversation(
        &mut self,
        kind: ConversationKind,
        participant_instance_ids: Vec<String>,
        participant_agent_ids: Vec<String>,
        session_key: &str,
        title: Option<String>,
    ) -> Option<Admitted> {
        if !self.can_start(kind) {
            debug!("Admission denied for {:?} conversation {}", kind, session_key);
            return None;
        }

        if let Some(existing) = self
            .conversations
            .values()
            .find(|c| c.is_active() && c.session_key == session_key)
        {
            return Some(Admitted {
                conversation_id: existing.id.clone(),
                created: false,
                notify: Vec::new(),
            });
        }

        let now = self.clock.now_millis();
        if kind == ConversationKind::Banter {
            if let Some(ended) = self.banter_ended_at.get(session_key) {
                if now - ended < self.settings.banter_cooldown_ms {
                    debug!("Banter session {} still cooling down", session_key);
                    return None;
                }
            }
        }

        let pair = group_key(&participant_agent_ids);
        let stale: Vec<String> = self
            .conversations
            .values()
            .filter(|c| {
                c.pair_key() == pair
                    && !matches!(
                        c.status,
                        ConversationStatus::Active | ConversationStatus::Interrupted
                    )
            })
            .map(|c| c.id.clone())
            .collect();
        for id in stale {
            debug!("Dropping superseded conversation {}", id);
            self.conversations.remove(&id);
        }

        let conversation = WorkshopConversation {
            id: generate_prefixed_id("conv"),
            kind,
            participant_instance_ids: participant_instance_ids.clone(),
            participant_agent_ids,
            session_key: session_key.to_string(),
            status: ConversationStatus::Active,
            started_at: now,
            ended_at: None,
            title,
        };
        let id = conversation.id.clone();
        self.conversations.insert(id.clone(), conversation);

        if kind == ConversationKind::Banter {
            self.consume_budget();
        }
        info!("Started {:?} conversation {} ({})", kind, id, session_key);

        Some(Admitted {
            conversation_id: id,
            created: true,
            notify: participant_instance_ids,
        })
    }

    /// Complete an active conversation. Returns the participants to notify,
    /// or `None` if the conversation is unknown or already over.
    pub fn end_conversation(&mut self, conversation_id: &str) -> Option<Vec<String>> {
        let now = self.clock.now_millis();
        let conversation = self.conversations.get_mut(conversation_id)?;
        if conversation.status == ConversationStatus::Completed {
            return None;
        }
        conversation.status = ConversationStatus::Completed;
        conversation.ended_at = Some(now);
        if conversation.kind == ConversationKind::Banter {
            self.banter_ended_at
                .insert(conversation.session_key.clone(), now);
        }
        info!("Ended conversation {}", conversation_id);
        Some(conversation.participant_instance_ids.clone())
    }

    /// Drop participants that drifted out of range; complete conversations
    /// left with fewer than two participants.
    pub fn check_proximity_gates(&mut self, instances: &InstanceMap, radius: f64) -> Vec<GateOutcome> {
        let active: Vec<String> = self
            .conversations
            .values()
            .filter(|c| c.is_active())
            .map(|c| c.id.clone())
            .collect();

        let mut outcomes = Vec::new();
        for id in active {
            let Some(conversation) = self.conversations.get(&id) else {
                continue;
            };
            let ids = &conversation.participant_instance_ids;
            // solo task conversations have no partner to stay near
            if ids.len() < 2 {
                continue;
            }
            let dropped: Vec<String> = ids
                .iter()
                .filter(|a| {
                    !ids.iter()
                        .any(|b| b != *a && proximity::within(instances, a, b, radius))
                })
                .cloned()
                .collect();
            if dropped.is_empty() {
                continue;
            }
            outcomes.push(self.drop_participants(&id, &dropped));
        }
        outcomes
    }

    /// Remove a deleted instance from every active conversation
    pub fn remove_participant(&mut self, instance_id: &str) -> Vec<GateOutcome> {
        let affected: Vec<String> = self
            .conversations
            .values()
            .filter(|c| c.is_active() && c.has_participant(instance_id))
            .map(|c| c.id.clone())
            .collect();
        affected
            .iter()
            .map(|id| self.drop_participants(id, &[instance_id.to_string()]))
            .collect()
    }

    fn drop_participants(&mut self, conversation_id: &str, dropped: &[String]) -> GateOutcome {
        let remaining = match self.conversations.get_mut(conversation_id) {
            Some(conversation) => {
                let drop: HashSet<&String> = dropped.iter().collect();
                let mut instance_ids = Vec::new();
                let mut agent_ids = Vec::new();
                for (i, instance_id) in conversation.participant_instance_ids.iter().enumerate() {
                    if !drop.contains(instance_id) {
                        instance_ids.push(instance_id.clone());
                        if let Some(agent_id) = conversation.participant_agent_ids.get(i) {
                            agent_ids.push(agent_id.clone());
                        }
                    }
                }
                conversation.participant_instance_ids = instance_ids;
                conversation.participant_agent_ids = agent_ids;
                conversation.participant_instance_ids.len()
            }
            None => 0,
        };

        let completed = remaining < 2 && self.end_conversation(conversation_id).is_some();
        if completed {
            debug!("Conversation {} lost proximity", conversation_id);
        }
        GateOutcome {
            conversation_id: conversation_id.to_string(),
            dropped: dropped.to_vec(),
            completed,
        }
    }

    /// Relationship pairs eligible for idle banter right now
    pub fn find_banter_candidates(
        &mut self,
        relationships: &[Relationship],
        instances: &InstanceMap,
        fsms: &FsmRegistry,
        radius: f64,
    ) -> Vec<(String, String)> {
        if !self.settings.idle_banter_enabled || self.banter_budget_remaining() == 0 {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        relationships
            .iter()
            .filter(|r| instances.contains_key(&r.from_instance_id) && instances.contains_key(&r.to_instance_id))
            .filter(|r| !fsms.is_conversing(&r.from_instance_id) && !fsms.is_conversing(&r.to_instance_id))
            .filter(|r| proximity::within(instances, &r.from_instance_id, &r.to_instance_id, radius))
            .filter(|r| seen.insert(pair_key(&r.from_instance_id, &r.to_instance_id)))
            .map(|r| (r.from_instance_id.clone(), r.to_instance_id.clone()))
            .collect()
    }

    /// Flag every active conversation as interrupted (used on restore)
    pub fn mark_active_interrupted(&mut self) -> Vec<String> {
        let mut ids = Vec::new();
        for conversation in self.conversations.values_mut() {
            if conversation.is_active() {
                conversation.status = ConversationStatus::Interrupted;
                ids.push(conversation.id.clone());
            }
        }
        ids
    }

    /// Reactivate an interrupted conversation under normal capacity rules.
    /// Returns the participants that must receive `conversationStart`.
    pub fn resume_conversation(&mut self, conversation_id: &str) -> Option<Vec<String>> {
        if self.active_count() >= self.settings.max_concurrent_conversations {
            return None;
        }
        let session_key = {
            let conversation = self.conversations.get(conversation_id)?;
            if conversation.status != ConversationStatus::Interrupted {
                return None;
            }
            conversation.session_key.clone()
        };
        if self
            .conversations
            .values()
            .any(|c| c.is_active() && c.session_key == session_key)
        {
            return None;
        }
        let conversation = self.conversations.get_mut(conversation_id)?;
        conversation.status = ConversationStatus::Active;
        info!("Resumed conversation {}", conversation_id);
        Some(conversation.participant_instance_ids.clone())
    }

    pub fn get(&self, conversation_id: &str) -> Option<&WorkshopConversation> {
        self.conversations.get(conversation_id)
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.get(conversation_id).is_some_and(WorkshopConversation::is_active)
    }

    pub fn all(&self) -> impl Iterator<Item = &WorkshopConversation> {
        self.conversations.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &WorkshopConversation> {
        self.conversations.values().filter(|c| c.is_active())
    }

    /// True if the instance takes part in any active conversation
    pub fn in_active_conversation(&self, instance_id: &str) -> bool {
        self.active().any(|c| c.has_participant(instance_id))
    }

    /// The most recently started conversation an instance took part in
    pub fn most_recent_for(&self, instance_id: &str) -> Option<&WorkshopConversation> {
        self.conversations
            .values()
            .filter(|c| c.has_participant(instance_id))
            .max_by_key(|c| c.started_at)
    }

    /// Replace the registry wholesale (snapshot restore)
    pub fn restore(&mut self, conversations: Vec<WorkshopConversation>) {
        self.conversations = conversations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.banter_ended_at.clear();
        self.budget = BanterBudget::default();
    }
}
