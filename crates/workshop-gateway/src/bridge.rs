//! Gateway bridge: turn-based multi-agent conversations over single-agent sessions
//!
//! Each participant talks through a dedicated session
//! (`agent:{agentId}:workshop:{conversationId}`). The bridge drives a strictly
//! sequential turn loop: send a prompt to one agent, poll its session history
//! for the reply, emit it to listeners, then hand the next prompt to the next
//! participant in round-robin order.

use crate::prompts;
use crate::rpc::{ChatRpc, ChatSendRequest, latest_reply};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use workshop_common::constants::memory::MAX_ENVIRONMENT_SUMMARY_CHARS;
use workshop_common::{
    GatewaySettings, WorkshopError, generate_id, generate_prefixed_id, truncate_string,
};
use workshop_core::memory::Interaction;
use workshop_core::{
    AgentTasks, BanterCallback, ConversationKind, ConversationStatus, SharedContext,
    agent_session_key, parse_agent_session_key,
};

/// Conversation id used for an agent's reads outside any conversation
const AMBIENT_SESSION: &str = "ambient";

const TITLE_CHARS: usize = 60;

/// One agent reply produced by a turn loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkshopMessage {
    pub id: String,
    pub conversation_id: String,
    pub instance_id: String,
    pub agent_id: String,
    pub speaker: String,
    pub text: String,
    /// 1-based turn number within the conversation
    pub turn: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Message(WorkshopMessage),
    ConversationEnded { conversation_id: String, turns: u32 },
}

pub type Listener = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

/// How a turn loop finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub conversation_id: String,
    pub turns: u32,
    pub aborted: bool,
}

#[derive(Debug, Clone)]
struct Participant {
    instance_id: String,
    agent_id: String,
    name: String,
}

#[derive(Debug, Clone)]
enum Opening {
    Task(String),
    Solo(String),
    Resume(Option<String>),
    Banter,
}

#[derive(Debug, Clone, Default)]
struct LoopHandle {
    abort: Arc<AtomicBool>,
    turns: Arc<AtomicU32>,
}

struct TurnLoop {
    conversation_id: String,
    participants: Vec<Participant>,
    opening: Opening,
    max_turns: u32,
    handle: LoopHandle,
}

pub struct GatewayBridge {
    ctx: SharedContext,
    rpc: Arc<dyn ChatRpc>,
    settings: GatewaySettings,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    loops: Mutex<HashMap<String, LoopHandle>>,
    session_turns: Mutex<HashMap<String, u32>>,
}

impl GatewayBridge {
    pub fn new(ctx: SharedContext, rpc: Arc<dyn ChatRpc>, settings: GatewaySettings) -> Self {
        Self {
            ctx,
            rpc,
            settings,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            loops: Mutex::new(HashMap::new()),
            session_turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.rpc.is_connected()
    }

    // ---- listeners ------------------------------------------------------

    /// Register a listener; returns an id for `remove_listener`
    pub fn add_listener(&self, listener: impl Fn(&BridgeEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: &BridgeEvent) {
        let listeners: Vec<Listener> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }

    // ---- conversations --------------------------------------------------

    /// Run a task conversation between two or more instances to completion.
    ///
    /// Fails up front when the gateway is down, a participant cannot be
    /// resolved, or admission is denied. Once the loop starts, gateway
    /// failures only end it early.
    pub async fn start_multi_agent_conversation(
        &self,
        instance_ids: &[String],
        task: &str,
        max_turns: Option<u32>,
    ) -> anyhow::Result<LoopOutcome> {
        self.ensure_connected()?;
        let participants = self.resolve_participants(instance_ids)?;
        if participants.len() < 2 {
            bail!("a multi-agent conversation needs at least 2 participants");
        }
        let session_key = format!("workshop:task:{}", generate_id());
        let conversation_id = self.register(
            ConversationKind::Task,
            instance_ids,
            &session_key,
            Some(truncate_string(task, TITLE_CHARS)),
        )?;
        let max_turns = max_turns.unwrap_or(self.settings.default_max_turns);
        Ok(self
            .run_loop(conversation_id, participants, Opening::Task(task.to_string()), max_turns)
            .await)
    }

    /// Give one agent a task: a single send/poll/emit turn
    pub async fn assign_task(&self, instance_id: &str, task: &str) -> anyhow::Result<LoopOutcome> {
        self.ensure_connected()?;
        let ids = [instance_id.to_string()];
        let participants = self.resolve_participants(&ids)?;
        let session_key = format!("workshop:assign:{}", generate_id());
        let conversation_id = self.register(
            ConversationKind::Task,
            &ids,
            &session_key,
            Some(truncate_string(task, TITLE_CHARS)),
        )?;
        Ok(self
            .run_loop(conversation_id, participants, Opening::Solo(task.to_string()), 1)
            .await)
    }

    /// Unprompted chat between two idle agents
    pub async fn start_banter(&self, a: &str, b: &str) -> anyhow::Result<LoopOutcome> {
        self.ensure_connected()?;
        let ids = [a.to_string(), b.to_string()];
        let participants = self.resolve_participants(&ids)?;
        let (session_key, max_turns) = {
            let ctx = self.ctx.lock();
            let key = ctx
                .banter_session_key(&ids)
                .ok_or_else(|| WorkshopError::NotFound("banter participant".to_string()))?;
            (key, ctx.settings().conversation.banter_max_turns)
        };
        let conversation_id = self.register(ConversationKind::Banter, &ids, &session_key, None)?;
        Ok(self
            .run_loop(conversation_id, participants, Opening::Banter, max_turns)
            .await)
    }

    /// Restart the turn loop of an interrupted conversation
    pub async fn resume_conversation(&self, conversation_id: &str) -> anyhow::Result<LoopOutcome> {
        self.ensure_connected()?;
        if self.loops.lock().contains_key(conversation_id) {
            bail!("conversation {} already has a running loop", conversation_id);
        }
        let (instance_ids, title) = {
            let ctx = self.ctx.lock();
            let conversation = ctx
                .conversations()
                .get(conversation_id)
                .ok_or_else(|| WorkshopError::NotFound(format!("conversation {}", conversation_id)))?;
            if conversation.status != ConversationStatus::Interrupted {
                bail!("conversation {} is not interrupted", conversation_id);
            }
            (conversation.participant_instance_ids.clone(), conversation.title.clone())
        };
        let participants = self.resolve_participants(&instance_ids)?;
        if !self.ctx.lock().resume_conversation(conversation_id) {
            bail!("conversation {} could not be resumed", conversation_id);
        }
        Ok(self
            .run_loop(
                conversation_id.to_string(),
                participants,
                Opening::Resume(title),
                self.settings.default_max_turns,
            )
            .await)
    }

    /// Ask a running loop to stop. The in-flight poll still runs out, but
    /// its result is discarded and no further turns are taken.
    pub fn abort(&self, conversation_id: &str) -> bool {
        match self.loops.lock().get(conversation_id) {
            Some(handle) => {
                handle.abort.store(true, Ordering::SeqCst);
                info!("Abort requested for conversation {}", conversation_id);
                true
            }
            None => false,
        }
    }

    pub fn active_loop_count(&self) -> usize {
        self.loops.lock().len()
    }

    /// Turns completed so far by a running loop
    pub fn loop_turn_count(&self, conversation_id: &str) -> Option<u32> {
        self.loops
            .lock()
            .get(conversation_id)
            .map(|h| h.turns.load(Ordering::SeqCst))
    }

    /// Callback for the simulation's idle-banter check; spawns a banter loop
    pub fn banter_callback(self: &Arc<Self>) -> BanterCallback {
        let bridge = Arc::downgrade(self);
        Arc::new(move |a: String, b: String| {
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!("No runtime to start banter between {} and {}", a, b);
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = bridge.start_banter(&a, &b).await {
                    debug!("Banter between {} and {} not started: {:#}", a, b, e);
                }
            });
        })
    }

    fn ensure_connected(&self) -> anyhow::Result<()> {
        if !self.rpc.is_connected() {
            return Err(WorkshopError::Gateway("chat gateway is not connected".to_string()).into());
        }
        Ok(())
    }

    fn resolve_participants(&self, instance_ids: &[String]) -> anyhow::Result<Vec<Participant>> {
        let ctx = self.ctx.lock();
        instance_ids
            .iter()
            .map(|id| -> anyhow::Result<Participant> {
                let instance = ctx
                    .instance(id)
                    .ok_or_else(|| WorkshopError::NotFound(format!("instance {}", id)))?;
                Ok(Participant {
                    instance_id: id.clone(),
                    agent_id: instance.agent_id.clone(),
                    name: ctx.display_name(&instance.agent_id),
                })
            })
            .collect()
    }

    fn register(
        &self,
        kind: ConversationKind,
        instance_ids: &[String],
        session_key: &str,
        title: Option<String>,
    ) -> anyhow::Result<String> {
        let conversation_id = self
            .ctx
            .lock()
            .start_conversation(kind, instance_ids, session_key, title)
            .ok_or_else(|| anyhow!("admission denied for {:?} conversation", kind))?;
        if self.loops.lock().contains_key(&conversation_id) {
            bail!("conversation {} already has a running loop", conversation_id);
        }
        Ok(conversation_id)
    }

    // ---- turn loop ------------------------------------------------------

    async fn run_loop(
        &self,
        conversation_id: String,
        participants: Vec<Participant>,
        opening: Opening,
        max_turns: u32,
    ) -> LoopOutcome {
        let plan = TurnLoop {
            conversation_id,
            participants,
            opening,
            max_turns,
            handle: LoopHandle::default(),
        };
        self.loops
            .lock()
            .insert(plan.conversation_id.clone(), plan.handle.clone());
        info!(
            "Starting turn loop for {} ({} participants, {} turns)",
            plan.conversation_id,
            plan.participants.len(),
            plan.max_turns
        );

        let mut transcript = Vec::new();
        let driven = AssertUnwindSafe(self.drive_turns(&plan, &mut transcript))
            .catch_unwind()
            .await;
        if driven.is_err() {
            error!("Turn loop for {} panicked", plan.conversation_id);
        }
        self.finish_loop(&plan, &transcript)
    }

    async fn drive_turns(&self, plan: &TurnLoop, transcript: &mut Vec<WorkshopMessage>) {
        let mut participants = plan.participants.clone();
        let mut previous: Option<(String, String)> = None;

        loop {
            let turn = plan.handle.turns.load(Ordering::SeqCst);
            if turn >= plan.max_turns {
                break;
            }
            if plan.handle.abort.load(Ordering::SeqCst) {
                debug!("Loop {} aborted before turn {}", plan.conversation_id, turn + 1);
                break;
            }
            {
                let ctx = self.ctx.lock();
                let Some(conversation) = ctx
                    .conversations()
                    .get(&plan.conversation_id)
                    .filter(|c| c.is_active())
                else {
                    info!("Conversation {} ended outside its loop", plan.conversation_id);
                    break;
                };
                participants.retain(|p| conversation.has_participant(&p.instance_id));
            }
            if participants.is_empty() {
                break;
            }

            let speaker = participants[turn as usize % participants.len()].clone();
            let others: Vec<String> = participants
                .iter()
                .filter(|p| p.instance_id != speaker.instance_id)
                .map(|p| p.name.clone())
                .collect();
            let prompt = build_prompt(plan, &speaker, &others, turn, previous.as_ref());
            let session_key = agent_session_key(&speaker.agent_id, &plan.conversation_id);

            let reply = self
                .send_and_wait_for_response(&session_key, &prompt, self.settings.response_timeout())
                .await;
            if plan.handle.abort.load(Ordering::SeqCst) {
                debug!("Discarding reply for aborted loop {}", plan.conversation_id);
                break;
            }
            let Some(text) = reply else {
                warn!(
                    "No response from {} on turn {} of {}",
                    speaker.name,
                    turn + 1,
                    plan.conversation_id
                );
                break;
            };

            let timestamp = {
                let ctx = self.ctx.lock();
                if !ctx.has_instance(&speaker.instance_id)
                    || !ctx.conversations().is_active(&plan.conversation_id)
                {
                    debug!("Dropping reply from {}: conversation moved on", speaker.name);
                    break;
                }
                ctx.now()
            };

            let turn = turn + 1;
            plan.handle.turns.store(turn, Ordering::SeqCst);
            self.increment_session_turns(&session_key);

            let message = WorkshopMessage {
                id: generate_prefixed_id("msg"),
                conversation_id: plan.conversation_id.clone(),
                instance_id: speaker.instance_id.clone(),
                agent_id: speaker.agent_id.clone(),
                speaker: speaker.name.clone(),
                text: text.clone(),
                turn,
                timestamp,
            };
            transcript.push(message.clone());
            self.emit(&BridgeEvent::Message(message));
            previous = Some((speaker.name, text));
        }
    }

    /// Loop exit: end the conversation, deregister, remember the exchange
    fn finish_loop(&self, plan: &TurnLoop, transcript: &[WorkshopMessage]) -> LoopOutcome {
        self.loops.lock().remove(&plan.conversation_id);
        let turns = plan.handle.turns.load(Ordering::SeqCst);
        {
            let mut ctx = self.ctx.lock();
            if !ctx.end_conversation(&plan.conversation_id) {
                debug!("Conversation {} was already closed", plan.conversation_id);
            }
            if let Some(last) = transcript.last() {
                let now = ctx.now();
                let summary = truncate_string(&last.text, MAX_ENVIRONMENT_SUMMARY_CHARS);
                for participant in &plan.participants {
                    if !ctx.has_instance(&participant.instance_id) {
                        continue;
                    }
                    let with_agent_ids = plan
                        .participants
                        .iter()
                        .filter(|p| p.instance_id != participant.instance_id)
                        .map(|p| p.agent_id.clone())
                        .collect();
                    ctx.memory_mut(&participant.instance_id)
                        .record_interaction(Interaction {
                            conversation_id: plan.conversation_id.clone(),
                            with_agent_ids,
                            summary: summary.clone(),
                            at: now,
                        });
                }
            }
        }
        info!("Turn loop for {} finished after {} turns", plan.conversation_id, turns);
        self.emit(&BridgeEvent::ConversationEnded {
            conversation_id: plan.conversation_id.clone(),
            turns,
        });
        LoopOutcome {
            conversation_id: plan.conversation_id.clone(),
            turns,
            aborted: plan.handle.abort.load(Ordering::SeqCst),
        }
    }

    // ---- gateway calls --------------------------------------------------

    /// Post a message and poll the session history for the reply.
    ///
    /// Returns `None` on a send failure or when no reply shows up within
    /// `timeout`. History failures are retried on the next poll.
    pub async fn send_and_wait_for_response(
        &self,
        session_key: &str,
        message: &str,
        timeout: Duration,
    ) -> Option<String> {
        if !self.rpc.is_connected() {
            warn!("Gateway disconnected, not sending to {}", session_key);
            return None;
        }
        let request = ChatSendRequest {
            session_key: session_key.to_string(),
            message: message.to_string(),
            deliver: false,
            idempotency_key: generate_id(),
        };
        if let Err(e) = self.rpc.send(request).await {
            warn!("chat.send to {} failed: {:#}", session_key, e);
            return None;
        }

        let deadline = Instant::now() + timeout;
        sleep(self.settings.initial_poll_delay().min(timeout)).await;
        loop {
            match self.rpc.history(session_key, self.settings.history_limit).await {
                Ok(messages) => {
                    if let Some(text) = latest_reply(&messages, message) {
                        return Some(text);
                    }
                }
                Err(e) => debug!("chat.history for {} failed: {:#}", session_key, e),
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.settings.poll_interval().min(deadline - now)).await;
        }
        warn!("Timed out waiting for a reply on {}", session_key);
        None
    }

    /// Have an agent read an element; the reply becomes its memory of it
    pub async fn read_element_for_agent(&self, instance_id: &str, element_id: &str) -> anyhow::Result<String> {
        let (agent_id, prompt) = {
            let ctx = self.ctx.lock();
            let instance = ctx
                .instance(instance_id)
                .ok_or_else(|| WorkshopError::NotFound(format!("instance {}", instance_id)))?;
            let element = ctx
                .element(element_id)
                .ok_or_else(|| WorkshopError::NotFound(format!("element {}", element_id)))?;
            let name = ctx.display_name(&instance.agent_id);
            (
                instance.agent_id.clone(),
                prompts::read_element_prompt(&name, &element.describe()),
            )
        };
        let session_key = agent_session_key(&agent_id, AMBIENT_SESSION);
        let reply = self
            .send_and_wait_for_response(&session_key, &prompt, self.settings.response_timeout())
            .await
            .ok_or_else(|| {
                WorkshopError::Gateway(format!("{} did not respond while reading {}", instance_id, element_id))
            })?;
        self.increment_session_turns(&session_key);

        let summary = truncate_string(&reply, MAX_ENVIRONMENT_SUMMARY_CHARS);
        if !self
            .ctx
            .lock()
            .record_element_read(instance_id, element_id, &summary)
        {
            debug!("{} was removed before its read of {} landed", instance_id, element_id);
        }
        Ok(summary)
    }

    /// Ask a session to compact its context and reset its turn counter
    pub async fn compact_agent_context(&self, session_key: &str) -> anyhow::Result<String> {
        self.ensure_connected()?;
        let summary = self
            .send_and_wait_for_response(
                session_key,
                &prompts::compaction_prompt(),
                self.settings.compaction_timeout(),
            )
            .await
            .ok_or_else(|| WorkshopError::Gateway(format!("compaction of {} got no response", session_key)))?;
        self.reset_session_turns(session_key);

        if let Some((agent_id, conversation_id)) = parse_agent_session_key(session_key) {
            let mut ctx = self.ctx.lock();
            let owners: Vec<String> = ctx
                .conversations()
                .get(conversation_id)
                .map(|c| {
                    c.participant_instance_ids
                        .iter()
                        .zip(&c.participant_agent_ids)
                        .filter(|(_, agent)| agent.as_str() == agent_id)
                        .map(|(instance, _)| instance.clone())
                        .collect()
                })
                .unwrap_or_default();
            for instance_id in owners {
                if ctx.has_instance(&instance_id) {
                    ctx.memory_mut(&instance_id).set_context_summary(summary.clone());
                }
            }
        }
        info!("Compacted {}", session_key);
        Ok(summary)
    }

    pub fn session_turns(&self, session_key: &str) -> u32 {
        self.session_turns.lock().get(session_key).copied().unwrap_or(0)
    }

    pub fn reset_session_turns(&self, session_key: &str) {
        self.session_turns.lock().remove(session_key);
    }

    fn increment_session_turns(&self, session_key: &str) {
        *self
            .session_turns
            .lock()
            .entry(session_key.to_string())
            .or_insert(0) += 1;
    }
}

fn build_prompt(
    plan: &TurnLoop,
    speaker: &Participant,
    others: &[String],
    turn: u32,
    previous: Option<&(String, String)>,
) -> String {
    let Some((previous_speaker, previous_text)) = previous else {
        return match &plan.opening {
            Opening::Task(task) => prompts::initial_prompt(task, &speaker.name, others, plan.max_turns),
            Opening::Solo(task) => prompts::task_prompt(task, &speaker.name),
            Opening::Resume(title) => prompts::resume_prompt(&speaker.name, others, title.as_deref()),
            Opening::Banter => prompts::banter_prompt(&speaker.name, others),
        };
    };
    if turn + 1 >= plan.max_turns {
        prompts::final_prompt(&speaker.name, previous_speaker, previous_text)
    } else {
        prompts::turn_prompt(&speaker.name, previous_speaker, previous_text, plan.max_turns - turn - 1)
    }
}

#[async_trait]
impl AgentTasks for GatewayBridge {
    async fn read_element(&self, instance_id: &str, element_id: &str) -> anyhow::Result<()> {
        self.read_element_for_agent(instance_id, element_id).await.map(|_| ())
    }

    async fn compact_context(&self, session_key: &str) -> anyhow::Result<()> {
        self.compact_agent_context(session_key).await.map(|_| ())
    }

    fn session_turn_count(&self, session_key: &str) -> u32 {
        self.session_turns(session_key)
    }

    fn reset_session_turn_count(&self, session_key: &str) {
        self.reset_session_turns(session_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedGateway;
    use workshop_common::{Position, WorkshopSettings};
    use workshop_core::{AgentState, Behavior, ElementKind, SimulationContext, WorkshopElement};

    fn fast_settings() -> GatewaySettings {
        GatewaySettings {
            poll_interval_ms: 1,
            initial_poll_delay_ms: 1,
            response_timeout_ms: 500,
            compaction_timeout_ms: 500,
            default_max_turns: 2,
            ..GatewaySettings::default()
        }
    }

    /// Two named agents standing next to each other
    fn workshop(settings: WorkshopSettings) -> (SharedContext, String, String) {
        let mut ctx = SimulationContext::headless(settings);
        ctx.upsert_profile("agent-a", "Ada");
        ctx.upsert_profile("agent-b", "Bo");
        let a = ctx.place_agent("agent-a", Position::new(0.0, 0.0), Behavior::Stationary);
        let b = ctx.place_agent("agent-b", Position::new(60.0, 0.0), Behavior::Stationary);
        (ctx.into_shared(), a, b)
    }

    fn greeter() -> ScriptedGateway {
        ScriptedGateway::new(|session, _| {
            if session.starts_with("agent:agent-a:") {
                Some("Hello".to_string())
            } else if session.starts_with("agent:agent-b:") {
                Some("Hi back".to_string())
            } else {
                None
            }
        })
    }

    fn bridge_with(ctx: SharedContext, gateway: Arc<ScriptedGateway>, settings: GatewaySettings) -> Arc<GatewayBridge> {
        Arc::new(GatewayBridge::new(ctx, gateway, settings))
    }

    fn record_events(bridge: &GatewayBridge) -> Arc<Mutex<Vec<BridgeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bridge.add_listener(move |event| sink.lock().push(event.clone()));
        events
    }

    fn texts(events: &[BridgeEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Message(m) => Some(m.text.clone()),
                _ => None,
            })
            .collect()
    }

    fn ended_count(events: &[BridgeEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::ConversationEnded { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_two_agent_conversation_takes_turns() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let gateway = Arc::new(greeter());
        let bridge = bridge_with(ctx.clone(), gateway.clone(), fast_settings());
        let events = record_events(&bridge);

        let outcome = bridge
            .start_multi_agent_conversation(&[a.clone(), b.clone()], "Plan the launch", Some(2))
            .await
            .unwrap();

        assert_eq!(outcome.turns, 2);
        assert!(!outcome.aborted);
        let events = events.lock().clone();
        assert_eq!(texts(&events), vec!["Hello", "Hi back"]);
        assert_eq!(ended_count(&events), 1);

        let sent = gateway.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].session_key, agent_session_key("agent-a", &outcome.conversation_id));
        assert!(sent[0].message.contains("Task: Plan the launch"));
        assert!(sent[0].message.contains("Bo"));
        assert!(sent[1].message.contains("\"Hello\""));
        assert!(sent[1].message.contains("final turn"));

        let ctx = ctx.lock();
        let conversation = ctx.conversations().get(&outcome.conversation_id).unwrap();
        assert_eq!(conversation.status, ConversationStatus::Completed);
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Cooldown));
        assert_eq!(ctx.memory().get(&b).unwrap().recent_interactions.len(), 1);
        assert_eq!(bridge.active_loop_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_reply_ends_loop_early() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let gateway = Arc::new(ScriptedGateway::new(|session, _| {
            session.starts_with("agent:agent-a:").then(|| "Anyone there?".to_string())
        }));
        let settings = GatewaySettings {
            response_timeout_ms: 20,
            ..fast_settings()
        };
        let bridge = bridge_with(ctx.clone(), gateway, settings);
        let events = record_events(&bridge);

        let outcome = bridge
            .start_multi_agent_conversation(&[a, b], "Chat", Some(4))
            .await
            .unwrap();

        assert_eq!(outcome.turns, 1);
        assert_eq!(ended_count(&events.lock()), 1);
        assert!(!ctx.lock().conversations().is_active(&outcome.conversation_id));
    }

    #[tokio::test]
    async fn test_gateway_failure_is_no_response() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let gateway = Arc::new(greeter());
        gateway.set_failing(true);
        let bridge = bridge_with(ctx.clone(), gateway, fast_settings());

        let outcome = bridge
            .start_multi_agent_conversation(&[a, b], "Chat", None)
            .await
            .unwrap();
        assert_eq!(outcome.turns, 0);
        assert_eq!(ctx.lock().conversations().active_count(), 0);
    }

    #[tokio::test]
    async fn test_preconditions_reject_start() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let gateway = Arc::new(greeter());
        let bridge = bridge_with(ctx.clone(), gateway.clone(), fast_settings());

        assert!(
            bridge
                .start_multi_agent_conversation(&[a.clone()], "Solo", None)
                .await
                .is_err()
        );
        let missing = bridge
            .start_multi_agent_conversation(&[a.clone(), "ghost".to_string()], "Chat", None)
            .await
            .unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<WorkshopError>(),
            Some(WorkshopError::NotFound(_))
        ));
        gateway.set_connected(false);
        let offline = bridge
            .start_multi_agent_conversation(&[a, b], "Chat", None)
            .await
            .unwrap_err();
        assert!(matches!(
            offline.downcast_ref::<WorkshopError>(),
            Some(WorkshopError::Gateway(_))
        ));
        assert_eq!(ctx.lock().conversations().all().count(), 0);
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_admission_denied_fails_start() {
        let mut settings = WorkshopSettings::default();
        settings.conversation.max_concurrent_conversations = 0;
        let (ctx, a, b) = workshop(settings);
        let gateway = Arc::new(greeter());
        let bridge = bridge_with(ctx, gateway.clone(), fast_settings());

        let result = bridge.start_multi_agent_conversation(&[a, b], "Chat", None).await;
        assert!(result.is_err());
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_abort_stops_after_current_turn() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let bridge = bridge_with(ctx.clone(), Arc::new(greeter()), fast_settings());
        let events = record_events(&bridge);
        let weak = Arc::downgrade(&bridge);
        bridge.add_listener(move |event| {
            if let (BridgeEvent::Message(m), Some(bridge)) = (event, weak.upgrade()) {
                assert!(bridge.abort(&m.conversation_id));
            }
        });

        let outcome = bridge
            .start_multi_agent_conversation(&[a, b], "Chat", Some(6))
            .await
            .unwrap();

        assert!(outcome.aborted);
        assert_eq!(outcome.turns, 1);
        assert_eq!(texts(&events.lock()), vec!["Hello"]);
        assert!(!bridge.abort(&outcome.conversation_id));
        assert_eq!(
            ctx.lock().conversations().get(&outcome.conversation_id).map(|c| c.status),
            Some(ConversationStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_proximity_gate_ends_running_loop() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let bridge = bridge_with(ctx.clone(), Arc::new(greeter()), fast_settings());
        let events = record_events(&bridge);
        let gate_ctx = ctx.clone();
        let walker = b.clone();
        bridge.add_listener(move |event| {
            if matches!(event, BridgeEvent::Message(_)) {
                let mut ctx = gate_ctx.lock();
                ctx.set_instance_position(&walker, Position::new(2_000.0, 0.0));
                ctx.check_proximity_gates();
            }
        });

        let outcome = bridge
            .start_multi_agent_conversation(&[a.clone(), b.clone()], "Chat", Some(6))
            .await
            .unwrap();

        assert_eq!(outcome.turns, 1);
        assert_eq!(ended_count(&events.lock()), 1);
        let ctx = ctx.lock();
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Cooldown));
        assert_eq!(ctx.agent_state(&b), Some(AgentState::Cooldown));
    }

    #[tokio::test]
    async fn test_assign_task_runs_one_turn() {
        let (ctx, a, _) = workshop(WorkshopSettings::default());
        let gateway = Arc::new(greeter());
        let bridge = bridge_with(ctx.clone(), gateway.clone(), fast_settings());
        let events = record_events(&bridge);

        let outcome = bridge.assign_task(&a, "Write the notes").await.unwrap();

        assert_eq!(outcome.turns, 1);
        assert_eq!(texts(&events.lock()), vec!["Hello"]);
        assert!(gateway.sent()[0].message.contains("Task: Write the notes"));
        let ctx = ctx.lock();
        let conversation = ctx.conversations().get(&outcome.conversation_id).unwrap();
        assert_eq!(conversation.participant_instance_ids, vec![a]);
        assert_eq!(conversation.status, ConversationStatus::Completed);
    }

    #[tokio::test]
    async fn test_read_element_updates_memory() {
        let (ctx, a, _) = workshop(WorkshopSettings::default());
        let board = {
            let mut ctx = ctx.lock();
            let board = ctx.add_element(WorkshopElement::new(
                ElementKind::Pinboard,
                "ideas",
                Position::new(30.0, 0.0),
            ));
            ctx.add_pin(&board, "agent-b", "ship on friday");
            board
        };
        let gateway = Arc::new(ScriptedGateway::new(|_, prompt| {
            prompt.contains("ship on friday").then(|| "Friday ship date noted".to_string())
        }));
        let bridge = bridge_with(ctx.clone(), gateway, fast_settings());

        bridge.read_element(&a, &board).await.unwrap();

        let ambient = agent_session_key("agent-a", AMBIENT_SESSION);
        assert_eq!(bridge.session_turn_count(&ambient), 1);
        let ctx = ctx.lock();
        let entry = &ctx.memory().get(&a).unwrap().environment_state[&board];
        assert_eq!(entry.summary, "Friday ship date noted");
    }

    #[tokio::test]
    async fn test_read_missing_element_fails() {
        let (ctx, a, _) = workshop(WorkshopSettings::default());
        let bridge = bridge_with(ctx, Arc::new(greeter()), fast_settings());
        let err = bridge.read_element_for_agent(&a, "nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkshopError>(),
            Some(WorkshopError::NotFound(what)) if what == "element nope"
        ));
    }

    #[tokio::test]
    async fn test_compaction_resets_turns_and_summarizes() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let gateway = Arc::new(ScriptedGateway::new(|_, prompt| {
            if prompt.starts_with("Summarize this conversation") {
                Some("We agreed on Friday".to_string())
            } else {
                Some("ok".to_string())
            }
        }));
        let bridge = bridge_with(ctx.clone(), gateway, fast_settings());
        let outcome = bridge
            .start_multi_agent_conversation(&[a.clone(), b], "Plan", Some(2))
            .await
            .unwrap();
        let session = agent_session_key("agent-a", &outcome.conversation_id);
        assert_eq!(bridge.session_turns(&session), 1);

        let summary = bridge.compact_agent_context(&session).await.unwrap();

        assert_eq!(summary, "We agreed on Friday");
        assert_eq!(bridge.session_turns(&session), 0);
        assert_eq!(
            ctx.lock().memory().get(&a).unwrap().context_summary,
            "We agreed on Friday"
        );
    }

    #[tokio::test]
    async fn test_resume_interrupted_conversation() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let conversation_id = {
            let mut ctx = ctx.lock();
            let id = ctx
                .start_conversation(
                    ConversationKind::Task,
                    &[a.clone(), b.clone()],
                    "task:resume",
                    Some("Roadmap".to_string()),
                )
                .unwrap();
            let snapshot = ctx.snapshot();
            ctx.restore(snapshot);
            id
        };
        let gateway = Arc::new(greeter());
        let bridge = bridge_with(ctx.clone(), gateway.clone(), fast_settings());

        let outcome = bridge.resume_conversation(&conversation_id).await.unwrap();

        assert_eq!(outcome.conversation_id, conversation_id);
        assert_eq!(outcome.turns, 2);
        let first = &gateway.sent()[0].message;
        assert!(first.contains("interrupted"));
        assert!(first.contains("Roadmap"));
        assert!(bridge.resume_conversation(&conversation_id).await.is_err());
    }

    #[tokio::test]
    async fn test_banter_callback_spawns_loop() {
        let (ctx, a, b) = workshop(WorkshopSettings::default());
        let bridge = bridge_with(ctx.clone(), Arc::new(greeter()), fast_settings());
        let events = record_events(&bridge);

        let callback = bridge.banter_callback();
        callback(a.clone(), b.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while ended_count(&events.lock()) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let max_turns = ctx.lock().settings().conversation.banter_max_turns as usize;
        assert_eq!(texts(&events.lock()).len(), max_turns);
        let ctx = ctx.lock();
        let conversation = ctx.conversations().all().next().unwrap();
        assert_eq!(conversation.kind, ConversationKind::Banter);
        assert!(conversation.session_key.starts_with("banter:"));
    }

    #[test]
    fn test_listener_removal() {
        let (ctx, _, _) = workshop(WorkshopSettings::default());
        let bridge = GatewayBridge::new(ctx, Arc::new(greeter()), fast_settings());
        let id = bridge.add_listener(|_| {});
        assert!(bridge.remove_listener(id));
        assert!(!bridge.remove_listener(id));
    }
}
