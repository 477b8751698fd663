//! Per-agent finite-state machine
//!
//! An explicit `(state, event) -> next state` table. Entering a state
//! produces side effects (glow color, pulse, awareness scan) for the caller
//! to dispatch, and may arm one debounced self-transition. The pending
//! transition carries the generation it was armed in; any later transition
//! bumps the generation and drops it.

use crate::model::Behavior;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};
use workshop_common::SimulationSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Wandering,
    Patrolling,
    Conversing,
    Cooldown,
    Dragged,
    Heartbeat,
    Reading,
}

impl AgentState {
    pub fn from_behavior(behavior: Behavior) -> Self {
        match behavior {
            Behavior::Wander => AgentState::Wandering,
            Behavior::Patrol => AgentState::Patrolling,
            Behavior::Stationary => AgentState::Idle,
        }
    }

    /// Glow color shown by the renderer while in this state (0xRRGGBB)
    pub fn glow_color(&self) -> u32 {
        match self {
            AgentState::Idle => 0x9CA3AF,
            AgentState::Wandering => 0x34D399,
            AgentState::Patrolling => 0x60A5FA,
            AgentState::Conversing => 0xFBBF24,
            AgentState::Cooldown => 0xA78BFA,
            AgentState::Dragged => 0xFFFFFF,
            AgentState::Heartbeat => 0x22D3EE,
            AgentState::Reading => 0xF472B6,
        }
    }

    /// States a conversation can start from
    pub fn is_movement(&self) -> bool {
        matches!(
            self,
            AgentState::Idle | AgentState::Wandering | AgentState::Patrolling | AgentState::Heartbeat
        )
    }

    /// States that exclude an agent from idle banter
    pub fn is_engaged(&self) -> bool {
        matches!(
            self,
            AgentState::Conversing | AgentState::Cooldown | AgentState::Dragged | AgentState::Reading
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FsmEvent {
    PickUp,
    PutDown,
    StartReading,
    StopReading,
    ConversationStart,
    ConversationEnd,
    CooldownExpired,
    HeartbeatTrigger,
    HeartbeatEnd,
    Wander,
    Patrol,
    Stop,
}

/// Side effect requested by a state entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEffect {
    SetGlow(u32),
    Pulse,
    AwarenessScan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
    pub event: FsmEvent,
    pub effects: Vec<FsmEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FsmTimings {
    pub cooldown_ms: f64,
    pub heartbeat_ms: f64,
}

impl From<&SimulationSettings> for FsmTimings {
    fn from(settings: &SimulationSettings) -> Self {
        Self {
            cooldown_ms: settings.cooldown_ms,
            heartbeat_ms: settings.heartbeat_duration_ms,
        }
    }
}

impl Default for FsmTimings {
    fn default() -> Self {
        Self::from(&SimulationSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PendingTransition {
    event: FsmEvent,
    remaining_ms: f64,
    generation: u64,
}

/// One agent's state machine together with its prior-state bookkeeping
#[derive(Debug, Clone)]
pub struct AgentFsm {
    state: AgentState,
    generation: u64,
    pending: Option<PendingTransition>,
    drag_prior: Option<AgentState>,
    reading_prior: Option<AgentState>,
    movement_prior: Option<AgentState>,
    timings: FsmTimings,
}

impl AgentFsm {
    pub fn new(behavior: Behavior, timings: FsmTimings) -> Self {
        Self {
            state: AgentState::from_behavior(behavior),
            generation: 0,
            pending: None,
            drag_prior: None,
            reading_prior: None,
            movement_prior: None,
            timings,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Event and remaining time of the armed debounced transition
    pub fn pending(&self) -> Option<(FsmEvent, f64)> {
        self.pending.as_ref().map(|p| (p.event, p.remaining_ms))
    }

    /// Apply an event. `None` means the event does not apply in this state.
    pub fn send(&mut self, event: FsmEvent) -> Option<Transition> {
        let from = self.state;
        let to = self.next_state(event)?;

        self.generation += 1;
        self.pending = None;
        self.state = to;
        let effects = self.enter(to);
        trace!("fsm {:?} --{:?}--> {:?}", from, event, to);

        Some(Transition {
            from,
            to,
            event,
            effects,
        })
    }

    /// Advance the debounce timer, firing the pending transition when due
    pub fn advance(&mut self, dt_ms: f64) -> Option<Transition> {
        let pending = self.pending.as_mut()?;
        pending.remaining_ms -= dt_ms;
        if pending.remaining_ms > 0.0 {
            return None;
        }
        let fired = self.pending.take()?;
        if fired.generation != self.generation {
            return None;
        }
        self.send(fired.event)
    }

    fn next_state(&mut self, event: FsmEvent) -> Option<AgentState> {
        use AgentState::*;
        use FsmEvent::*;

        let state = self.state;
        match (state, event) {
            (Dragged, PickUp) => None,
            (_, PickUp) => {
                self.drag_prior = (state != Heartbeat).then_some(state);
                Some(Dragged)
            }
            (Reading, StartReading) => None,
            (_, StartReading) => {
                self.reading_prior = (state != Dragged).then_some(state);
                Some(Reading)
            }
            (Dragged, PutDown) => Some(self.drag_prior.take().unwrap_or(Idle)),
            (Reading, StopReading) => Some(self.reading_prior.take().unwrap_or(Idle)),
            (Dragged, StopReading) => {
                // the read finished mid-drag: put-down restores the pre-read state
                let before_read = self.reading_prior.take().unwrap_or(Idle);
                if self.drag_prior == Some(Reading) {
                    self.drag_prior = Some(before_read);
                }
                None
            }

            (Cooldown, ConversationStart) => {
                // keep the pre-cooldown movement state
                Some(Conversing)
            }
            (s, ConversationStart) if s.is_movement() => {
                self.movement_prior = Some(if s == Heartbeat { Idle } else { s });
                Some(Conversing)
            }
            (Conversing, ConversationEnd) => Some(Cooldown),
            (Dragged, ConversationEnd) => {
                Self::settle_prior(&mut self.drag_prior, &mut self.movement_prior);
                None
            }
            (Reading, ConversationEnd) => {
                Self::settle_prior(&mut self.reading_prior, &mut self.movement_prior);
                None
            }
            (Cooldown, CooldownExpired) => Some(self.movement_prior.take().unwrap_or(Idle)),

            (Idle, HeartbeatTrigger) => Some(Heartbeat),
            (Heartbeat, HeartbeatEnd) => Some(Idle),

            (Idle | Patrolling | Heartbeat, Wander) => Some(Wandering),
            (Idle | Wandering | Heartbeat, Patrol) => Some(Patrolling),
            (Wandering | Patrolling | Heartbeat, Stop) => Some(Idle),
            _ => None,
        }
    }

    /// A conversation ended while the agent was held or reading: the state
    /// to restore afterwards is no longer the conversation.
    fn settle_prior(prior: &mut Option<AgentState>, movement_prior: &mut Option<AgentState>) {
        if matches!(*prior, Some(AgentState::Conversing | AgentState::Cooldown)) {
            *prior = Some(movement_prior.take().unwrap_or(AgentState::Idle));
        }
    }

    fn enter(&mut self, state: AgentState) -> Vec<FsmEffect> {
        let mut effects = vec![FsmEffect::SetGlow(state.glow_color())];
        match state {
            AgentState::Cooldown => {
                self.arm(FsmEvent::CooldownExpired, self.timings.cooldown_ms);
            }
            AgentState::Heartbeat => {
                effects.push(FsmEffect::Pulse);
                effects.push(FsmEffect::AwarenessScan);
                self.arm(FsmEvent::HeartbeatEnd, self.timings.heartbeat_ms);
            }
            _ => {}
        }
        effects
    }

    fn arm(&mut self, event: FsmEvent, delay_ms: f64) {
        self.pending = Some(PendingTransition {
            event,
            remaining_ms: delay_ms,
            generation: self.generation,
        });
    }
}

/// Every live agent's FSM, keyed by instance id
#[derive(Debug, Clone, Default)]
pub struct FsmRegistry {
    machines: HashMap<String, AgentFsm>,
    timings: FsmTimings,
}

impl FsmRegistry {
    pub fn new(timings: FsmTimings) -> Self {
        Self {
            machines: HashMap::new(),
            timings,
        }
    }

    /// Create (or replace) the FSM for an instance; returns its initial state
    pub fn create(&mut self, instance_id: &str, behavior: Behavior) -> AgentState {
        let fsm = AgentFsm::new(behavior, self.timings);
        let state = fsm.state();
        if self.machines.insert(instance_id.to_string(), fsm).is_some() {
            debug!("Replaced existing FSM for {}", instance_id);
        }
        state
    }

    /// Remove an FSM and all of its bookkeeping
    pub fn destroy(&mut self, instance_id: &str) -> bool {
        self.machines.remove(instance_id).is_some()
    }

    pub fn send(&mut self, instance_id: &str, event: FsmEvent) -> Option<Transition> {
        self.machines.get_mut(instance_id)?.send(event)
    }

    /// Advance every debounce timer, returning the transitions that fired
    pub fn advance_all(&mut self, dt_ms: f64) -> Vec<(String, Transition)> {
        self.machines
            .iter_mut()
            .filter_map(|(id, fsm)| fsm.advance(dt_ms).map(|t| (id.clone(), t)))
            .collect()
    }

    pub fn state(&self, instance_id: &str) -> Option<AgentState> {
        self.machines.get(instance_id).map(AgentFsm::state)
    }

    pub fn get(&self, instance_id: &str) -> Option<&AgentFsm> {
        self.machines.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.machines.contains_key(instance_id)
    }

    /// True for conversing, cooldown, dragged and reading
    pub fn is_conversing(&self, instance_id: &str) -> bool {
        self.state(instance_id).is_some_and(|s| s.is_engaged())
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn clear(&mut self) {
        self.machines.clear();
    }
}
