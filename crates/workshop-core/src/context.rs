//! The simulation context
//!
//! One `SimulationContext` owns every per-agent map (instances, FSMs,
//! queues, memory, motion timers), the conversation registry, the physics
//! world and the renderer handle. Components receive it by reference; the
//! frame loop and async continuations share it as a `SharedContext`.
//!
//! The lock is never held across an `.await`.

use crate::conversation::{ConversationKind, ConversationManager, GateOutcome};
use crate::elements::{ElementKind, VoteDirection, VoteOutcome, WorkshopElement};
use crate::fsm::{AgentState, FsmEffect, FsmEvent, FsmRegistry, FsmTimings, Transition};
use crate::memory::{AgentMemory, MemoryStore};
use crate::model::{AgentInstance, AgentProfile, Behavior, Relationship};
use crate::persistence::WorkshopSnapshot;
use crate::physics::{BodyType, PhysicsBackend, RapierWorld, SpringDesc};
use crate::proximity::InstanceMap;
use crate::queue::{ActionQueues, AgentAction, ReadPriority};
use crate::renderer::{NullRenderer, Renderer};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use workshop_common::constants::memory::MAX_NOTE_CHARS;
use workshop_common::constants::persistence::SNAPSHOT_VERSION;
use workshop_common::{Clock, Position, SystemClock, WorkshopSettings, group_key, truncate_string};

pub type SharedContext = Arc<Mutex<SimulationContext>>;

/// Called on heartbeat entry; returns a point of interest to wander toward
pub type AwarenessScan = Arc<dyn Fn(&SimulationContext, &str) -> Option<Position> + Send + Sync>;

/// Called after every persisted mutation
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

const AGENT_COLLIDER_RADIUS: f64 = 16.0;
const ELEMENT_COLLIDER_RADIUS: f64 = 24.0;

/// Per-instance timers and movement targets driven by the frame loop
#[derive(Debug, Clone, Default)]
pub struct MotionState {
    pub wander_target: Option<Position>,
    /// Countdown to the next wander retarget
    pub retarget_ms: f64,
    /// Idle dwell countdown; `None` whenever the agent is not idle
    pub heartbeat_ms: Option<f64>,
    /// Elapsed time toward the next seek-info scan
    pub seek_elapsed_ms: f64,
    pub patrol_angle: f64,
    /// Queued read the agent is walking toward
    pub walk_to: Option<AgentAction>,
    /// Remaining time as a dynamic body after an over-extension impulse
    pub tether_ms: Option<f64>,
    /// Movement state to go back to after a walk-to-read detour
    pub return_to: Option<AgentState>,
}

impl MotionState {
    /// Fresh timers, with the patrol phase matching where the agent stands
    fn for_instance(instance: &AgentInstance) -> Self {
        let mut motion = Self::default();
        if let Some(angle) = orbit_angle(instance) {
            motion.patrol_angle = angle;
        }
        motion
    }
}

/// Angle of an instance around its home, `None` when standing on it
fn orbit_angle(instance: &AgentInstance) -> Option<f64> {
    let offset = instance.position - instance.home_position;
    (offset.length() > 0.0).then(|| offset.y.atan2(offset.x))
}

pub struct SimulationContext {
    settings: WorkshopSettings,
    clock: Arc<dyn Clock>,
    instances: InstanceMap,
    profiles: HashMap<String, AgentProfile>,
    elements: BTreeMap<String, WorkshopElement>,
    relationships: Vec<Relationship>,
    fsms: FsmRegistry,
    queues: ActionQueues,
    conversations: ConversationManager,
    memory: MemoryStore,
    physics: Box<dyn PhysicsBackend>,
    renderer: Arc<dyn Renderer>,
    motion: HashMap<String, MotionState>,
    executing: HashSet<String>,
    reaction_cooldowns: HashMap<(String, String), f64>,
    rope_hot: HashMap<String, bool>,
    awareness_scan: Option<AwarenessScan>,
    change_hook: Option<ChangeHook>,
    revision: u64,
}

impl SimulationContext {
    pub fn new(
        settings: WorkshopSettings,
        clock: Arc<dyn Clock>,
        physics: Box<dyn PhysicsBackend>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let timings = FsmTimings::from(&settings.simulation);
        let conversations = ConversationManager::new(settings.conversation.clone(), Arc::clone(&clock));
        Self {
            settings,
            clock,
            instances: InstanceMap::new(),
            profiles: HashMap::new(),
            elements: BTreeMap::new(),
            relationships: Vec::new(),
            fsms: FsmRegistry::new(timings),
            queues: ActionQueues::new(),
            conversations,
            memory: MemoryStore::new(),
            physics,
            renderer,
            motion: HashMap::new(),
            executing: HashSet::new(),
            reaction_cooldowns: HashMap::new(),
            rope_hot: HashMap::new(),
            awareness_scan: None,
            change_hook: None,
            revision: 0,
        }
    }

    /// System clock, built-in physics, no renderer
    pub fn headless(settings: WorkshopSettings) -> Self {
        Self::new(
            settings,
            Arc::new(SystemClock),
            Box::new(RapierWorld::new()),
            Arc::new(NullRenderer),
        )
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &WorkshopSettings {
        &self.settings
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    pub fn physics(&self) -> &dyn PhysicsBackend {
        self.physics.as_ref()
    }

    pub fn physics_mut(&mut self) -> &mut dyn PhysicsBackend {
        self.physics.as_mut()
    }

    pub fn set_memory_store(&mut self, memory: MemoryStore) {
        self.memory = memory;
    }

    pub fn set_awareness_scan(&mut self, scan: Option<AwarenessScan>) {
        self.awareness_scan = scan;
    }

    pub fn has_awareness_scan(&self) -> bool {
        self.awareness_scan.is_some()
    }

    pub fn set_change_hook(&mut self, hook: Option<ChangeHook>) {
        self.change_hook = hook;
    }

    /// Bumped by every mutation that should reach the save cache
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn mark_dirty(&mut self) {
        self.revision += 1;
        if let Some(hook) = &self.change_hook {
            hook();
        }
    }

    // ---- profiles -------------------------------------------------------

    pub fn upsert_profile(&mut self, agent_id: &str, name: &str) {
        self.profiles.insert(
            agent_id.to_string(),
            AgentProfile {
                agent_id: agent_id.to_string(),
                name: name.to_string(),
            },
        );
    }

    /// Display name for prompts; falls back to the agent id
    pub fn display_name(&self, agent_id: &str) -> String {
        self.profiles
            .get(agent_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| agent_id.to_string())
    }

    // ---- instances ------------------------------------------------------

    /// Place a new instance of a logical agent
    pub fn place_agent(&mut self, agent_id: &str, position: Position, behavior: Behavior) -> String {
        self.add_instance(AgentInstance::new(agent_id, position, behavior))
    }

    pub fn add_instance(&mut self, instance: AgentInstance) -> String {
        let id = instance.instance_id.clone();
        let state = self.fsms.create(&id, instance.behavior);
        self.physics.add_body(&id, instance.position, BodyType::Kinematic);
        self.physics.add_collider(&id, AGENT_COLLIDER_RADIUS);
        self.renderer
            .create_agent_sprite(&id, &instance.agent_id, instance.position);
        self.renderer.set_glow_color(&id, state.glow_color());
        self.motion.insert(id.clone(), MotionState::for_instance(&instance));
        debug!("Placed {} ({}) as {:?}", id, instance.agent_id, state);
        self.instances.insert(id.clone(), instance);
        self.mark_dirty();
        id
    }

    /// Remove an instance and everything keyed by it
    pub fn remove_instance(&mut self, instance_id: &str) -> bool {
        if self.instances.remove(instance_id).is_none() {
            return false;
        }

        for outcome in self.conversations.remove_participant(instance_id) {
            self.deliver_gate_outcome(&outcome);
        }

        let attached: Vec<String> = self
            .relationships
            .iter()
            .filter(|r| r.touches(instance_id))
            .map(|r| r.id.clone())
            .collect();
        for id in attached {
            self.remove_relationship(&id);
        }

        self.fsms.destroy(instance_id);
        self.queues.clear(instance_id);
        self.motion.remove(instance_id);
        self.executing.remove(instance_id);
        self.reaction_cooldowns.retain(|(agent, _), _| agent != instance_id);
        self.physics.remove_collider(instance_id);
        self.physics.remove_body(instance_id);
        self.renderer.remove_sprite(instance_id);
        info!("Removed instance {}", instance_id);
        self.mark_dirty();
        true
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id)
    }

    pub fn instance(&self, instance_id: &str) -> Option<&AgentInstance> {
        self.instances.get(instance_id)
    }

    pub fn instances(&self) -> &InstanceMap {
        &self.instances
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    /// Move an instance directly, keeping physics and renderer in sync
    pub fn set_instance_position(&mut self, instance_id: &str, position: Position) -> bool {
        let Some(instance) = self.instances.get_mut(instance_id) else {
            return false;
        };
        instance.position = position;
        self.physics.set_position(instance_id, position);
        self.renderer.update_sprite_position(instance_id, position);
        true
    }

    pub fn agent_state(&self, instance_id: &str) -> Option<AgentState> {
        self.fsms.state(instance_id)
    }

    pub fn fsms(&self) -> &FsmRegistry {
        &self.fsms
    }

    // ---- elements -------------------------------------------------------

    pub fn add_element(&mut self, element: WorkshopElement) -> String {
        let id = element.id.clone();
        self.physics.add_body(&id, element.position, BodyType::Kinematic);
        self.physics.add_collider(&id, ELEMENT_COLLIDER_RADIUS);
        self.renderer
            .create_element_sprite(&id, element.kind, element.position);
        if element.kind == ElementKind::Inbox {
            self.renderer.update_badge(&id, element.unread_count());
        }
        self.elements.insert(id.clone(), element);
        self.mark_dirty();
        id
    }

    pub fn remove_element(&mut self, element_id: &str) -> bool {
        if self.elements.remove(element_id).is_none() {
            return false;
        }
        self.physics.remove_collider(element_id);
        self.physics.remove_body(element_id);
        self.renderer.remove_sprite(element_id);
        self.reaction_cooldowns.retain(|(_, element), _| element != element_id);
        self.mark_dirty();
        true
    }

    pub fn element(&self, element_id: &str) -> Option<&WorkshopElement> {
        self.elements.get(element_id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &WorkshopElement> {
        self.elements.values()
    }

    /// Pin an item. The author remembers it; agents in reach go read the board.
    pub fn add_pin(&mut self, element_id: &str, author: &str, text: &str) -> Option<String> {
        let pin = self.elements.get_mut(element_id)?.add_pin(author, text)?;
        for id in self.instances_of(author) {
            self.memory.get_or_create(&id).pin_item(pin.clone());
        }
        self.refresh_badge(element_id);
        self.queue_nearby_reads(element_id, Some(author));
        self.mark_dirty();
        Some(pin)
    }

    pub fn vote_pin(
        &mut self,
        element_id: &str,
        item_id: &str,
        voter: &str,
        direction: VoteDirection,
    ) -> VoteOutcome {
        let Some(element) = self.elements.get_mut(element_id) else {
            return VoteOutcome::NotFound;
        };
        let outcome = element.vote(item_id, voter, direction);
        if matches!(outcome, VoteOutcome::Recorded | VoteOutcome::Removed) {
            self.refresh_badge(element_id);
            self.mark_dirty();
        }
        outcome
    }

    pub fn comment_pin(&mut self, element_id: &str, item_id: &str, author: &str, text: &str) -> bool {
        let now = self.now();
        let added = self
            .elements
            .get_mut(element_id)
            .is_some_and(|e| e.comment(item_id, author, text, now));
        if added {
            self.mark_dirty();
        }
        added
    }

    pub fn deliver_message(&mut self, element_id: &str, from: &str, subject: &str, body: &str) -> bool {
        let now = self.now();
        let delivered = self
            .elements
            .get_mut(element_id)
            .is_some_and(|e| e.deliver(from, subject, body, now));
        if delivered {
            self.refresh_badge(element_id);
            self.queue_owner_reads(element_id, from);
            self.mark_dirty();
        }
        delivered
    }

    /// Mark an inbox read, returning how many messages changed
    pub fn mark_inbox_read(&mut self, element_id: &str) -> usize {
        let changed = self
            .elements
            .get_mut(element_id)
            .map_or(0, WorkshopElement::mark_all_read);
        if changed > 0 {
            self.refresh_badge(element_id);
            self.mark_dirty();
        }
        changed
    }

    pub fn set_element_content(&mut self, element_id: &str, content: &str) -> bool {
        let updated = self
            .elements
            .get_mut(element_id)
            .is_some_and(|e| e.set_content(content));
        if updated {
            self.queue_nearby_reads(element_id, None);
            self.mark_dirty();
        }
        updated
    }

    /// Instances of a logical agent, in id order
    pub fn instances_of(&self, agent_id: &str) -> Vec<String> {
        self.instances
            .values()
            .filter(|i| i.agent_id == agent_id)
            .map(|i| i.instance_id.clone())
            .collect()
    }

    /// Instances within interaction range of an element
    pub fn instances_near_element(&self, element_id: &str) -> Vec<String> {
        let Some(at) = self.elements.get(element_id).map(|e| e.position) else {
            return Vec::new();
        };
        let radius = self.settings.simulation.interaction_radius;
        self.instances
            .values()
            .filter(|i| i.position.distance_to(at) <= radius)
            .map(|i| i.instance_id.clone())
            .collect()
    }

    /// A board changed: everyone standing at it (except the author) reads it
    fn queue_nearby_reads(&mut self, element_id: &str, author: Option<&str>) {
        for id in self.instances_near_element(element_id) {
            let is_author = author.is_some_and(|author| {
                self.instances.get(&id).is_some_and(|i| i.agent_id == author)
            });
            if is_author {
                continue;
            }
            self.enqueue_action(
                &id,
                AgentAction::ReadElement {
                    element_id: element_id.to_string(),
                    priority: ReadPriority::Normal,
                },
            );
        }
    }

    /// New mail: the owner reads it first, then walks over to the sender
    fn queue_owner_reads(&mut self, element_id: &str, from: &str) {
        let Some(owner) = self
            .elements
            .get(element_id)
            .and_then(|e| e.owner_agent_id())
            .map(str::to_string)
        else {
            return;
        };
        let sender = self.instances_of(from).into_iter().next();
        for id in self.instances_of(&owner) {
            self.enqueue_action(
                &id,
                AgentAction::ReadElement {
                    element_id: element_id.to_string(),
                    priority: ReadPriority::High,
                },
            );
            if let Some(sender) = sender.as_ref().filter(|sender| **sender != id) {
                self.enqueue_action(
                    &id,
                    AgentAction::ApproachAgent {
                        target_instance_id: sender.clone(),
                    },
                );
            }
        }
        debug!("Queued reads of {} for {}", element_id, owner);
    }

    fn refresh_badge(&self, element_id: &str) {
        let Some(element) = self.elements.get(element_id) else {
            return;
        };
        let count = match element.kind {
            ElementKind::Inbox => element.unread_count(),
            ElementKind::Pinboard => element.pin_items().len(),
            _ => return,
        };
        self.renderer.update_badge(element_id, count);
    }

    // ---- relationships --------------------------------------------------

    pub fn add_relationship(&mut self, from: &str, to: &str, label: &str) -> Option<String> {
        let (Some(a), Some(b)) = (self.instances.get(from), self.instances.get(to)) else {
            warn!("Cannot relate {} -> {}: instance missing", from, to);
            return None;
        };
        let (from_pos, to_pos) = (a.position, b.position);
        let relationship = Relationship::new(from, to, label);
        let id = relationship.id.clone();
        self.physics.add_spring(&id, from, to, SpringDesc::default());
        self.renderer.create_rope(&id, from_pos, to_pos);
        self.relationships.push(relationship);
        self.mark_dirty();
        Some(id)
    }

    pub fn remove_relationship(&mut self, relationship_id: &str) -> bool {
        let before = self.relationships.len();
        self.relationships.retain(|r| r.id != relationship_id);
        if self.relationships.len() == before {
            return false;
        }
        self.physics.remove_spring(relationship_id);
        self.renderer.remove_rope(relationship_id);
        self.rope_hot.remove(relationship_id);
        self.mark_dirty();
        true
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Whether a cable was drawn hot on the last render update
    pub fn is_rope_hot(&self, relationship_id: &str) -> bool {
        self.rope_hot.get(relationship_id).copied().unwrap_or(false)
    }

    /// Recompute cable "flow" and push endpoints to the renderer
    pub fn update_ropes(&mut self) {
        for relationship in &self.relationships {
            let (Some(a), Some(b)) = (
                self.instances.get(&relationship.from_instance_id),
                self.instances.get(&relationship.to_instance_id),
            ) else {
                continue;
            };
            let hot = self.conversations.active().any(|c| {
                c.has_participant(&relationship.from_instance_id)
                    && c.has_participant(&relationship.to_instance_id)
            });
            self.renderer
                .update_rope(&relationship.id, a.position, b.position, hot);
            self.rope_hot.insert(relationship.id.clone(), hot);
        }
    }

    // ---- FSM ------------------------------------------------------------

    /// Send an FSM event and dispatch its entry effects
    pub fn send_event(&mut self, instance_id: &str, event: FsmEvent) -> Option<AgentState> {
        let transition = self.fsms.send(instance_id, event)?;
        let to = transition.to;
        self.apply_transition(instance_id, transition);
        Some(to)
    }

    /// Advance debounced transitions by `dt_ms`
    pub fn advance_fsms(&mut self, dt_ms: f64) {
        for (id, transition) in self.fsms.advance_all(dt_ms) {
            self.apply_transition(&id, transition);
        }
    }

    fn apply_transition(&mut self, instance_id: &str, transition: Transition) {
        debug!(
            "{}: {:?} --{:?}--> {:?}",
            instance_id, transition.from, transition.event, transition.to
        );
        if let Some(motion) = self.motion.get_mut(instance_id) {
            if transition.to != AgentState::Wandering {
                motion.wander_target = None;
                motion.walk_to = None;
            }
            if transition.to == AgentState::Patrolling {
                motion.return_to = None;
                if let Some(angle) = self.instances.get(instance_id).and_then(orbit_angle) {
                    motion.patrol_angle = angle;
                }
            }
        }
        for effect in transition.effects {
            match effect {
                FsmEffect::SetGlow(color) => self.renderer.set_glow_color(instance_id, color),
                FsmEffect::Pulse => self.renderer.trigger_pulse(instance_id),
                FsmEffect::AwarenessScan => self.run_awareness_scan(instance_id),
            }
        }
    }

    fn run_awareness_scan(&mut self, instance_id: &str) {
        let Some(scan) = self.awareness_scan.clone() else {
            return;
        };
        if let Some(target) = scan(self, instance_id) {
            debug!("{} noticed something at ({:.0}, {:.0})", instance_id, target.x, target.y);
            self.send_event(instance_id, FsmEvent::Wander);
            self.set_wander_target(instance_id, target);
        }
    }

    // ---- motion ---------------------------------------------------------

    pub fn motion(&self, instance_id: &str) -> Option<&MotionState> {
        self.motion.get(instance_id)
    }

    pub fn motion_mut(&mut self, instance_id: &str) -> Option<&mut MotionState> {
        self.motion.get_mut(instance_id)
    }

    /// Point a wandering agent somewhere and hold off the next retarget
    pub fn set_wander_target(&mut self, instance_id: &str, target: Position) {
        let retarget = self.settings.simulation.wander_retarget_ms;
        if let Some(motion) = self.motion.get_mut(instance_id) {
            motion.wander_target = Some(target);
            motion.retarget_ms = retarget;
        }
    }

    // ---- action queues --------------------------------------------------

    pub fn enqueue_action(&mut self, instance_id: &str, action: AgentAction) -> bool {
        if !self.instances.contains_key(instance_id) {
            return false;
        }
        self.queues.enqueue(instance_id, action)
    }

    pub fn queues(&self) -> &ActionQueues {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut ActionQueues {
        &mut self.queues
    }

    /// Claim the single async action slot of an instance
    pub fn begin_action(&mut self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id) && self.executing.insert(instance_id.to_string())
    }

    pub fn finish_action(&mut self, instance_id: &str) {
        self.executing.remove(instance_id);
    }

    pub fn is_executing(&self, instance_id: &str) -> bool {
        self.executing.contains(instance_id)
    }

    pub fn reaction_cooldowns_mut(&mut self) -> &mut HashMap<(String, String), f64> {
        &mut self.reaction_cooldowns
    }

    // ---- drag -----------------------------------------------------------

    pub fn pick_up(&mut self, instance_id: &str) -> bool {
        if self.send_event(instance_id, FsmEvent::PickUp).is_none() {
            return false;
        }
        if let Some(motion) = self.motion.get_mut(instance_id) {
            motion.tether_ms = None;
        }
        self.physics.set_body_type(instance_id, BodyType::Kinematic);
        true
    }

    pub fn drag_to(&mut self, instance_id: &str, position: Position) -> bool {
        if self.agent_state(instance_id) != Some(AgentState::Dragged) {
            return false;
        }
        self.set_instance_position(instance_id, position)
    }

    /// Drop a dragged agent; the drop point becomes its new home
    pub fn put_down(&mut self, instance_id: &str) -> bool {
        if self.send_event(instance_id, FsmEvent::PutDown).is_none() {
            return false;
        }
        if let Some(instance) = self.instances.get_mut(instance_id) {
            instance.home_position = instance.position;
        }
        self.mark_dirty();
        true
    }

    // ---- conversations --------------------------------------------------

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    pub fn conversations_mut(&mut self) -> &mut ConversationManager {
        &mut self.conversations
    }

    /// Agent ids for a list of instances; `None` if any is gone
    pub fn resolve_agent_ids(&self, instance_ids: &[String]) -> Option<Vec<String>> {
        instance_ids
            .iter()
            .map(|id| self.instances.get(id).map(|i| i.agent_id.clone()))
            .collect()
    }

    /// Admit and register a conversation, moving participants into
    /// `conversing`. Returns the conversation id.
    pub fn start_conversation(
        &mut self,
        kind: ConversationKind,
        instance_ids: &[String],
        session_key: &str,
        title: Option<String>,
    ) -> Option<String> {
        let Some(agent_ids) = self.resolve_agent_ids(instance_ids) else {
            warn!("Cannot start conversation {}: participant missing", session_key);
            return None;
        };
        let admitted = self.conversations.start_conversation(
            kind,
            instance_ids.to_vec(),
            agent_ids,
            session_key,
            title,
        )?;
        for id in &admitted.notify {
            self.send_event(id, FsmEvent::ConversationStart);
        }
        if admitted.created {
            self.mark_dirty();
        }
        Some(admitted.conversation_id)
    }

    /// Related pairs eligible for banter, in relationship order
    pub fn banter_candidates(&mut self) -> Vec<(String, String)> {
        let radius = self.settings.simulation.proximity_radius;
        self.conversations.find_banter_candidates(
            &self.relationships,
            &self.instances,
            &self.fsms,
            radius,
        )
    }

    /// Session key used for banter between a group of agents
    pub fn banter_session_key(&self, instance_ids: &[String]) -> Option<String> {
        let agent_ids = self.resolve_agent_ids(instance_ids)?;
        Some(format!("banter:{}", group_key(&agent_ids)))
    }

    pub fn end_conversation(&mut self, conversation_id: &str) -> bool {
        let Some(participants) = self.conversations.end_conversation(conversation_id) else {
            return false;
        };
        for id in &participants {
            self.send_event(id, FsmEvent::ConversationEnd);
        }
        self.mark_dirty();
        true
    }

    pub fn resume_conversation(&mut self, conversation_id: &str) -> bool {
        let Some(participants) = self.conversations.resume_conversation(conversation_id) else {
            return false;
        };
        for id in &participants {
            self.send_event(id, FsmEvent::ConversationStart);
        }
        self.mark_dirty();
        true
    }

    /// Run the proximity gate over every active conversation
    pub fn check_proximity_gates(&mut self) -> Vec<GateOutcome> {
        let radius = self.settings.simulation.proximity_radius;
        let outcomes = self.conversations.check_proximity_gates(&self.instances, radius);
        for outcome in &outcomes {
            self.deliver_gate_outcome(outcome);
        }
        if !outcomes.is_empty() {
            self.mark_dirty();
        }
        outcomes
    }

    fn deliver_gate_outcome(&mut self, outcome: &GateOutcome) {
        let remaining = self
            .conversations
            .get(&outcome.conversation_id)
            .map(|c| c.participant_instance_ids.clone())
            .unwrap_or_default();
        for id in outcome.to_notify(&remaining) {
            self.send_event(&id, FsmEvent::ConversationEnd);
        }
    }

    // ---- memory ---------------------------------------------------------

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn memory_mut(&mut self, instance_id: &str) -> &mut AgentMemory {
        self.memory.get_or_create(instance_id)
    }

    /// Record what an agent learned from an element
    pub fn record_element_read(&mut self, instance_id: &str, element_id: &str, summary: &str) -> bool {
        if !self.instances.contains_key(instance_id) {
            return false;
        }
        let now = self.now();
        let element = self.elements.get(element_id);
        let kind = element.map(|e| e.kind);
        let label = element.map(|e| e.label.clone()).unwrap_or_default();
        let pins: Vec<String> = element
            .map(|e| e.pin_items().iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default();

        let memory = self.memory.get_or_create(instance_id);
        memory.record_read(element_id, summary, now);
        match kind {
            Some(ElementKind::Pinboard) => {
                for pin in pins {
                    memory.pin_item(pin);
                }
            }
            Some(ElementKind::Messageboard | ElementKind::Rulebook) => {
                memory.add_note(format!("{}: {}", label, truncate_string(summary, MAX_NOTE_CHARS)));
            }
            _ => {}
        }
        true
    }

    // ---- physics sync ---------------------------------------------------

    /// Copy post-step body positions into shared state and the renderer
    pub fn sync_positions(&mut self) {
        for (id, position) in self.physics.positions() {
            if let Some(instance) = self.instances.get_mut(&id) {
                instance.position = position;
            } else if let Some(element) = self.elements.get_mut(&id) {
                element.position = position;
            } else {
                continue;
            }
            self.renderer.update_sprite_position(&id, position);
        }
    }

    // ---- snapshot -------------------------------------------------------

    pub fn snapshot(&self) -> WorkshopSnapshot {
        let mut profiles: Vec<AgentProfile> = self.profiles.values().cloned().collect();
        profiles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        WorkshopSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: self.now(),
            settings: self.settings.clone(),
            instances: self.instances.values().cloned().collect(),
            profiles,
            elements: self.elements.values().cloned().collect(),
            relationships: self.relationships.clone(),
            conversations: self.conversations.all().cloned().collect(),
        }
    }

    /// Replace the whole workshop with a snapshot. Conversations that were
    /// active when it was taken come back interrupted.
    pub fn restore(&mut self, snapshot: WorkshopSnapshot) {
        self.reset();
        self.settings = snapshot.settings;
        self.fsms = FsmRegistry::new(FsmTimings::from(&self.settings.simulation));
        self.conversations
            .update_settings(self.settings.conversation.clone());

        for profile in snapshot.profiles {
            self.profiles.insert(profile.agent_id.clone(), profile);
        }
        for instance in snapshot.instances {
            self.add_instance(instance);
        }
        for element in snapshot.elements {
            self.add_element(element);
        }
        for relationship in snapshot.relationships {
            let (Some(a), Some(b)) = (
                self.instances.get(&relationship.from_instance_id),
                self.instances.get(&relationship.to_instance_id),
            ) else {
                warn!("Skipping dangling relationship {}", relationship.id);
                continue;
            };
            let (from_pos, to_pos) = (a.position, b.position);
            self.physics.add_spring(
                &relationship.id,
                &relationship.from_instance_id,
                &relationship.to_instance_id,
                SpringDesc::default(),
            );
            self.renderer.create_rope(&relationship.id, from_pos, to_pos);
            self.relationships.push(relationship);
        }

        self.conversations.restore(snapshot.conversations);
        let interrupted = self.conversations.mark_active_interrupted();
        info!(
            "Restored workshop: {} instances, {} elements, {} interrupted conversations",
            self.instances.len(),
            self.elements.len(),
            interrupted.len()
        );
        self.mark_dirty();
    }

    /// Tear everything down (workshop unmount)
    pub fn reset(&mut self) {
        for id in self.instances.keys() {
            self.physics.remove_body(id);
            self.renderer.remove_sprite(id);
        }
        for id in self.elements.keys() {
            self.physics.remove_body(id);
            self.renderer.remove_sprite(id);
        }
        for relationship in &self.relationships {
            self.physics.remove_spring(&relationship.id);
            self.renderer.remove_rope(&relationship.id);
        }
        self.instances.clear();
        self.profiles.clear();
        self.elements.clear();
        self.relationships.clear();
        self.fsms.clear();
        self.queues.clear_all();
        self.conversations.clear();
        self.motion.clear();
        self.executing.clear();
        self.reaction_cooldowns.clear();
        self.rope_hot.clear();
    }
}
