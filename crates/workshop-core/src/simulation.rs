//! The frame loop
//!
//! `Simulation::tick` runs every per-frame phase in a fixed order:
//! timers, idle queue drain, moving queue drain, wander retarget,
//! kinematic movement, physics step, position sync, proximity gate, rope
//! update, banter check, reaction cooldowns, reactions.
//!
//! The tick itself is synchronous. Element reads and compactions are
//! spawned onto the tokio runtime and re-validate the agent when they
//! finish. The banter callback runs after the context lock is released.

use crate::context::{AwarenessScan, SharedContext, SimulationContext};
use crate::conversation::{ConversationKind, agent_session_key};
use crate::elements::ElementKind;
use crate::fsm::{AgentState, FsmEvent};
use crate::physics::BodyType;
use crate::proximity;
use crate::queue::AgentAction;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workshop_common::constants::movement::{HOME_IMPULSE, TETHER_MS};
use workshop_common::{Position, SimulationSettings};

/// Async work the loop hands off to the gateway integration
#[async_trait]
pub trait AgentTasks: Send + Sync {
    /// Have an agent read an element and remember what it saw
    async fn read_element(&self, instance_id: &str, element_id: &str) -> anyhow::Result<()>;

    /// Compact the context of one gateway session
    async fn compact_context(&self, session_key: &str) -> anyhow::Result<()>;

    fn session_turn_count(&self, session_key: &str) -> u32;

    fn reset_session_turn_count(&self, session_key: &str);
}

/// Receives the pair chosen by the idle-banter check
pub type BanterCallback = Arc<dyn Fn(String, String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
enum ActionTask {
    Read {
        instance_id: String,
        element_id: String,
        wrapped: bool,
    },
    Compact {
        instance_id: String,
        session_key: String,
        wrapped: bool,
    },
}

impl ActionTask {
    fn instance_id(&self) -> &str {
        match self {
            ActionTask::Read { instance_id, .. } | ActionTask::Compact { instance_id, .. } => {
                instance_id
            }
        }
    }

    /// Whether the agent was put into `reading` for the duration
    fn wrapped(&self) -> bool {
        match self {
            ActionTask::Read { wrapped, .. } | ActionTask::Compact { wrapped, .. } => *wrapped,
        }
    }
}

pub struct Simulation {
    ctx: SharedContext,
    tasks: Arc<dyn AgentTasks>,
    rng: StdRng,
    banter_elapsed_ms: f64,
    gate_elapsed_ms: f64,
    on_banter: Option<BanterCallback>,
    frames: u64,
}

impl Simulation {
    pub fn new(ctx: SharedContext, tasks: Arc<dyn AgentTasks>) -> Self {
        let seed = ctx.lock().settings().simulation.seed;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let simulation = Self {
            ctx,
            tasks,
            rng,
            banter_elapsed_ms: 0.0,
            gate_elapsed_ms: 0.0,
            on_banter: None,
            frames: 0,
        };
        simulation.install_awareness_scan();
        simulation
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn set_banter_callback(&mut self, callback: Option<BanterCallback>) {
        self.on_banter = callback;
    }

    /// Register the heartbeat awareness scan on the context
    pub fn install_awareness_scan(&self) {
        let scan: AwarenessScan = Arc::new(|ctx: &SimulationContext, instance_id: &str| {
            let sim = &ctx.settings().simulation;
            nearest_interest(ctx, instance_id, sim.interaction_radius, sim.interest_radius)
        });
        self.ctx.lock().set_awareness_scan(Some(scan));
    }

    /// Advance the whole simulation by `dt_ms`
    pub fn tick(&mut self, dt_ms: f64) {
        let shared = Arc::clone(&self.ctx);
        let mut spawned = Vec::new();

        let banter_pair = {
            let mut ctx = shared.lock();
            let sim = ctx.settings().simulation.clone();

            ctx.advance_fsms(dt_ms);
            self.update_heartbeats(&mut ctx, &sim, dt_ms);
            update_seek_info(&mut ctx, &sim, dt_ms);
            self.check_compaction(&mut ctx);
            self.drain_idle_queues(&mut ctx, &mut spawned);
            self.drain_moving_queues(&mut ctx, &mut spawned);
            self.retarget_wanderers(&mut ctx, &sim, dt_ms);
            move_agents(&mut ctx, &sim, dt_ms, &mut spawned);
            ctx.physics_mut().step(dt_ms);
            ctx.sync_positions();
            self.gate_proximity(&mut ctx, &sim, dt_ms);
            ctx.update_ropes();
            let pair = self.check_banter(&mut ctx, dt_ms);
            update_reaction_cooldowns(&mut ctx, dt_ms);
            trigger_reactions(&mut ctx, &sim);
            pair
        };

        self.frames += 1;
        for task in spawned {
            self.spawn_action(task);
        }
        if let (Some((a, b)), Some(callback)) = (banter_pair, &self.on_banter) {
            debug!("Idle banter between {} and {}", a, b);
            callback(a, b);
        }
    }

    fn update_heartbeats(&mut self, ctx: &mut SimulationContext, sim: &SimulationSettings, dt_ms: f64) {
        for id in ctx.instance_ids() {
            let idle = ctx.agent_state(&id) == Some(AgentState::Idle);
            let Some(motion) = ctx.motion_mut(&id) else {
                continue;
            };
            if !idle {
                motion.heartbeat_ms = None;
                continue;
            }
            let fire = match motion.heartbeat_ms {
                None => {
                    motion.heartbeat_ms = Some(random_between(
                        &mut self.rng,
                        sim.heartbeat_min_ms,
                        sim.heartbeat_max_ms,
                    ));
                    false
                }
                Some(remaining) => {
                    let left = remaining - dt_ms;
                    motion.heartbeat_ms = Some(left);
                    left <= 0.0
                }
            };
            if fire {
                // the next idle stretch starts a fresh window
                motion.heartbeat_ms = None;
                ctx.send_event(&id, FsmEvent::HeartbeatTrigger);
            }
        }
    }

    fn check_compaction(&self, ctx: &mut SimulationContext) {
        let threshold = ctx.settings().gateway.compaction_turn_threshold;
        if threshold == 0 {
            return;
        }
        for id in ctx.instance_ids() {
            if ctx.is_executing(&id) {
                continue;
            }
            let Some(session_key) = latest_session_key(ctx, &id) else {
                continue;
            };
            if self.tasks.session_turn_count(&session_key) >= threshold {
                ctx.enqueue_action(&id, AgentAction::CompactContext);
            }
        }
    }

    /// Session to compact, if it is still over the threshold
    fn compaction_session(&self, ctx: &SimulationContext, instance_id: &str) -> Option<String> {
        let threshold = ctx.settings().gateway.compaction_turn_threshold;
        let session_key = latest_session_key(ctx, instance_id)?;
        (self.tasks.session_turn_count(&session_key) >= threshold).then_some(session_key)
    }

    fn drain_idle_queues(&mut self, ctx: &mut SimulationContext, spawned: &mut Vec<ActionTask>) {
        for id in ctx.instance_ids() {
            if ctx.agent_state(&id) != Some(AgentState::Idle) || ctx.is_executing(&id) {
                continue;
            }
            let Some(action) = ctx.queues_mut().dequeue(&id) else {
                continue;
            };
            match action {
                AgentAction::ReadElement { element_id, .. } | AgentAction::SeekInfo { element_id } => {
                    if ctx.element(&element_id).is_none() {
                        warn!("{} cannot read missing element {}", id, element_id);
                        continue;
                    }
                    let task = ActionTask::Read {
                        instance_id: id.clone(),
                        element_id,
                        wrapped: true,
                    };
                    spawned.extend(begin_action(ctx, task));
                }
                AgentAction::CompactContext => {
                    let Some(session_key) = self.compaction_session(ctx, &id) else {
                        continue;
                    };
                    let task = ActionTask::Compact {
                        instance_id: id.clone(),
                        session_key,
                        wrapped: true,
                    };
                    spawned.extend(begin_action(ctx, task));
                }
                AgentAction::ApproachAgent { target_instance_id } => {
                    let Some(target) = ctx.instance(&target_instance_id).map(|i| i.position) else {
                        warn!("{} cannot approach missing {}", id, target_instance_id);
                        continue;
                    };
                    ctx.send_event(&id, FsmEvent::Wander);
                    ctx.set_wander_target(&id, target);
                }
            }
        }
    }

    fn drain_moving_queues(&mut self, ctx: &mut SimulationContext, spawned: &mut Vec<ActionTask>) {
        for id in ctx.instance_ids() {
            let Some(state) = ctx.agent_state(&id) else {
                continue;
            };
            if resume_patrol(ctx, &id, state) {
                continue;
            }
            if !matches!(state, AgentState::Wandering | AgentState::Patrolling) || ctx.is_executing(&id) {
                continue;
            }
            if ctx.motion(&id).is_some_and(|m| m.walk_to.is_some()) {
                continue;
            }
            let Some(action) = ctx.queues_mut().dequeue(&id) else {
                continue;
            };

            let target = match &action {
                AgentAction::CompactContext => {
                    if let Some(session_key) = self.compaction_session(ctx, &id) {
                        let task = ActionTask::Compact {
                            instance_id: id.clone(),
                            session_key,
                            wrapped: false,
                        };
                        spawned.extend(begin_action(ctx, task));
                    }
                    continue;
                }
                AgentAction::ReadElement { element_id, .. } | AgentAction::SeekInfo { element_id } => {
                    ctx.element(element_id).map(|e| e.position)
                }
                AgentAction::ApproachAgent { target_instance_id } => {
                    ctx.instance(target_instance_id).map(|i| i.position)
                }
            };
            let Some(target) = target else {
                warn!("{} dropped {:?}: target missing", id, action);
                continue;
            };

            if state == AgentState::Patrolling {
                ctx.send_event(&id, FsmEvent::Wander);
            }
            ctx.set_wander_target(&id, target);
            if action.element_id().is_some() {
                if let Some(motion) = ctx.motion_mut(&id) {
                    motion.walk_to = Some(action);
                    if state == AgentState::Patrolling {
                        motion.return_to = Some(AgentState::Patrolling);
                    }
                }
            }
        }
    }

    fn retarget_wanderers(&mut self, ctx: &mut SimulationContext, sim: &SimulationSettings, dt_ms: f64) {
        for id in ctx.instance_ids() {
            if ctx.agent_state(&id) != Some(AgentState::Wandering) {
                continue;
            }
            let Some(motion) = ctx.motion_mut(&id) else {
                continue;
            };
            if motion.walk_to.is_some() || motion.tether_ms.is_some() {
                continue;
            }
            motion.retarget_ms -= dt_ms;
            if motion.retarget_ms > 0.0 && motion.wander_target.is_some() {
                continue;
            }
            if let Some(target) = self.pick_wander_target(ctx, &id, sim) {
                ctx.set_wander_target(&id, target);
            }
        }
    }

    /// Biased toward something interesting nearby, else a random point
    /// in the annulus around home
    fn pick_wander_target(
        &mut self,
        ctx: &SimulationContext,
        instance_id: &str,
        sim: &SimulationSettings,
    ) -> Option<Position> {
        let home = ctx.instance(instance_id)?.home_position;
        if self.rng.gen_bool(sim.interest_bias.clamp(0.0, 1.0)) {
            if let Some(point) = nearest_interest(ctx, instance_id, 0.0, sim.interest_radius) {
                let jitter = sim.interest_jitter;
                return Some(point.offset(
                    random_between(&mut self.rng, -jitter, jitter),
                    random_between(&mut self.rng, -jitter, jitter),
                ));
            }
        }
        let angle = self.rng.gen_range(0.0..TAU);
        let radius = random_between(&mut self.rng, sim.wander_min_radius, sim.wander_max_radius);
        Some(home.offset(angle.cos() * radius, angle.sin() * radius))
    }

    fn gate_proximity(&mut self, ctx: &mut SimulationContext, sim: &SimulationSettings, dt_ms: f64) {
        self.gate_elapsed_ms += dt_ms;
        if self.gate_elapsed_ms < sim.proximity_gate_interval_ms {
            return;
        }
        self.gate_elapsed_ms = 0.0;
        let outcomes = ctx.check_proximity_gates();
        if !outcomes.is_empty() {
            debug!("Proximity gate touched {} conversations", outcomes.len());
        }
    }

    fn check_banter(&mut self, ctx: &mut SimulationContext, dt_ms: f64) -> Option<(String, String)> {
        self.banter_elapsed_ms += dt_ms;
        if self.banter_elapsed_ms < ctx.conversations().settings().banter_check_interval_ms {
            return None;
        }
        self.banter_elapsed_ms = 0.0;
        if self.on_banter.is_none() {
            return None;
        }
        let cap = ctx.conversations().settings().max_concurrent_conversations;
        if ctx.conversations().active_count() >= cap
            || !ctx.conversations_mut().can_start(ConversationKind::Banter)
        {
            return None;
        }
        find_banter_pair(ctx)
    }

    fn spawn_action(&self, task: ActionTask) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, dropping action for {}", task.instance_id());
            release_action(&self.ctx, &task);
            return;
        };
        let ctx = Arc::clone(&self.ctx);
        let tasks = Arc::clone(&self.tasks);
        runtime.spawn(run_action(ctx, tasks, task));
    }

    /// Drive the loop on the tokio runtime at a fixed frame interval
    pub fn start(mut self, frame: Duration) -> RunningSimulation {
        let ctx = Arc::clone(&self.ctx);
        self.install_awareness_scan();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = Instant::now();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let dt_ms = now.duration_since(last).as_secs_f64() * 1000.0;
                        last = now;
                        self.tick(dt_ms);
                    }
                }
            }
            self
        });

        info!("Simulation started at {:?} per frame", frame);
        RunningSimulation {
            ctx,
            stop_tx: Some(stop_tx),
            handle,
        }
    }
}

/// Handle to a loop started with `Simulation::start`
pub struct RunningSimulation {
    ctx: SharedContext,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Simulation>,
}

impl RunningSimulation {
    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    /// Stop ticking and unregister the awareness scan. In-flight reads
    /// keep running and still re-check the context when they finish.
    pub async fn stop(mut self) -> Option<Simulation> {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        let simulation = match self.handle.await {
            Ok(simulation) => Some(simulation),
            Err(e) => {
                warn!("Simulation task ended abnormally: {}", e);
                None
            }
        };
        self.ctx.lock().set_awareness_scan(None);
        info!("Simulation stopped");
        simulation
    }
}

fn begin_action(ctx: &mut SimulationContext, task: ActionTask) -> Option<ActionTask> {
    let id = task.instance_id().to_string();
    if !ctx.begin_action(&id) {
        return None;
    }
    if task.wrapped() {
        ctx.send_event(&id, FsmEvent::StartReading);
    }
    Some(task)
}

async fn run_action(ctx: SharedContext, tasks: Arc<dyn AgentTasks>, task: ActionTask) {
    let result = match &task {
        ActionTask::Read {
            instance_id,
            element_id,
            ..
        } => tasks.read_element(instance_id, element_id).await,
        ActionTask::Compact { session_key, .. } => tasks.compact_context(session_key).await,
    };
    match result {
        Ok(()) => {
            if let ActionTask::Compact { session_key, .. } = &task {
                tasks.reset_session_turn_count(session_key);
            }
        }
        Err(e) => warn!("Action for {} failed: {:#}", task.instance_id(), e),
    }
    release_action(&ctx, &task);
}

fn release_action(ctx: &SharedContext, task: &ActionTask) {
    let mut ctx = ctx.lock();
    let id = task.instance_id();
    if !ctx.has_instance(id) {
        debug!("{} was removed while its action was in flight", id);
        return;
    }
    ctx.finish_action(id);
    if task.wrapped() {
        // also delivered mid-drag so the drop does not restore `reading`
        ctx.send_event(id, FsmEvent::StopReading);
    }
}

/// A patroller that walked off to read something goes back to its orbit
/// once the read is over or the walk was abandoned
fn resume_patrol(ctx: &mut SimulationContext, instance_id: &str, state: AgentState) -> bool {
    if state != AgentState::Wandering || ctx.is_executing(instance_id) {
        return false;
    }
    let Some(motion) = ctx.motion_mut(instance_id) else {
        return false;
    };
    if motion.walk_to.is_some() || motion.return_to != Some(AgentState::Patrolling) {
        return false;
    }
    motion.return_to = None;
    ctx.send_event(instance_id, FsmEvent::Patrol);
    true
}

fn latest_session_key(ctx: &SimulationContext, instance_id: &str) -> Option<String> {
    let agent_id = &ctx.instance(instance_id)?.agent_id;
    let conversation = ctx.conversations().most_recent_for(instance_id)?;
    Some(agent_session_key(agent_id, &conversation.id))
}

fn update_seek_info(ctx: &mut SimulationContext, sim: &SimulationSettings, dt_ms: f64) {
    let now = ctx.now();
    for id in ctx.instance_ids() {
        let Some(state) = ctx.agent_state(&id) else {
            continue;
        };
        if matches!(
            state,
            AgentState::Dragged | AgentState::Conversing | AgentState::Reading
        ) {
            continue;
        }
        let Some(motion) = ctx.motion_mut(&id) else {
            continue;
        };
        motion.seek_elapsed_ms += dt_ms;
        if motion.seek_elapsed_ms < sim.seek_info_interval_ms {
            continue;
        }
        motion.seek_elapsed_ms = 0.0;

        let Some(origin) = ctx.instance(&id).map(|i| i.position) else {
            continue;
        };
        let mut nearby: Vec<(f64, String)> = ctx
            .elements()
            .map(|e| (origin.distance_to(e.position), e.id.clone()))
            .filter(|(d, _)| *d <= sim.seek_info_radius)
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));

        let memory = ctx.memory().get(&id);
        let stale = nearby.into_iter().map(|(_, element_id)| element_id).find(|element_id| {
            memory.is_none_or(|m| m.is_stale(element_id, now, sim.stale_read_ms))
        });
        if let Some(element_id) = stale {
            debug!("{} wants to check {}", id, element_id);
            ctx.enqueue_action(&id, AgentAction::SeekInfo { element_id });
        }
    }
}

fn move_agents(
    ctx: &mut SimulationContext,
    sim: &SimulationSettings,
    dt_ms: f64,
    spawned: &mut Vec<ActionTask>,
) {
    for id in ctx.instance_ids() {
        let tethered = update_tether(ctx, &id, dt_ms);
        match ctx.agent_state(&id) {
            Some(AgentState::Wandering) if !tethered => step_wanderer(ctx, &id, sim, dt_ms, spawned),
            Some(AgentState::Patrolling) => step_patroller(ctx, &id, sim, dt_ms),
            _ => {}
        }
    }
}

/// Count down an over-extension impulse; returns true while still dynamic
fn update_tether(ctx: &mut SimulationContext, instance_id: &str, dt_ms: f64) -> bool {
    let Some(motion) = ctx.motion_mut(instance_id) else {
        return false;
    };
    let Some(remaining) = motion.tether_ms.as_mut() else {
        return false;
    };
    *remaining -= dt_ms;
    if *remaining > 0.0 {
        return true;
    }
    motion.tether_ms = None;
    ctx.physics_mut().set_body_type(instance_id, BodyType::Kinematic);
    false
}

fn step_wanderer(
    ctx: &mut SimulationContext,
    instance_id: &str,
    sim: &SimulationSettings,
    dt_ms: f64,
    spawned: &mut Vec<ActionTask>,
) {
    let Some(instance) = ctx.instance(instance_id) else {
        return;
    };
    let (position, home) = (instance.position, instance.home_position);
    let Some(motion) = ctx.motion(instance_id) else {
        return;
    };
    let (target, walk_to) = (motion.wander_target, motion.walk_to.clone());

    let offset = position.distance_to(home);
    if walk_to.is_none() && offset > sim.max_wander_extent {
        let toward_home = (home - position) * (HOME_IMPULSE / offset);
        ctx.physics_mut().set_body_type(instance_id, BodyType::Dynamic);
        ctx.physics_mut().apply_impulse(instance_id, toward_home);
        if let Some(motion) = ctx.motion_mut(instance_id) {
            motion.tether_ms = Some(TETHER_MS);
            motion.wander_target = None;
        }
        debug!("{} strayed {:.0}px from home, pulling back", instance_id, offset);
        return;
    }

    let Some(target) = target else {
        return;
    };
    let next = position.step_toward(target, sim.wander_speed * dt_ms / 1000.0);
    ctx.set_instance_position(instance_id, next);

    let Some(action) = walk_to else {
        return;
    };
    let Some(element_id) = action.element_id().map(str::to_string) else {
        return;
    };
    let arrived = match ctx.element(&element_id) {
        Some(element) => next.distance_to(element.position) < sim.interaction_radius,
        None => {
            if let Some(motion) = ctx.motion_mut(instance_id) {
                motion.walk_to = None;
            }
            return;
        }
    };
    if arrived {
        if let Some(motion) = ctx.motion_mut(instance_id) {
            motion.walk_to = None;
        }
        let task = ActionTask::Read {
            instance_id: instance_id.to_string(),
            element_id,
            wrapped: true,
        };
        spawned.extend(begin_action(ctx, task));
    }
}

/// Follow the orbit point around home. An agent that is off the orbit
/// walks onto it at wander speed instead of jumping.
fn step_patroller(ctx: &mut SimulationContext, instance_id: &str, sim: &SimulationSettings, dt_ms: f64) {
    let Some((position, home)) = ctx.instance(instance_id).map(|i| (i.position, i.home_position)) else {
        return;
    };
    let Some(motion) = ctx.motion_mut(instance_id) else {
        return;
    };
    motion.patrol_angle = (motion.patrol_angle + sim.patrol_angular_speed * dt_ms) % TAU;
    let angle = motion.patrol_angle;
    let point = home.offset(angle.cos() * sim.patrol_radius, angle.sin() * sim.patrol_radius);
    let next = position.step_toward(point, sim.wander_speed * dt_ms / 1000.0);
    ctx.set_instance_position(instance_id, next);
}

/// First idle pair to banter: related pairs first, then any proximate pair
pub fn find_banter_pair(ctx: &mut SimulationContext) -> Option<(String, String)> {
    let related = ctx.banter_candidates();
    let ctx: &SimulationContext = ctx;
    if let Some(pair) = related
        .into_iter()
        .find(|(a, b)| is_free(ctx, a) && is_free(ctx, b))
    {
        return Some(pair);
    }

    let radius = ctx.settings().simulation.proximity_radius;
    proximity::all_pairs_within(ctx.instances(), radius)
        .into_iter()
        .find(|(a, b, _)| is_idle(ctx, a) && is_idle(ctx, b))
        .map(|(a, b, _)| (a, b))
}

fn is_free(ctx: &SimulationContext, instance_id: &str) -> bool {
    !ctx.conversations().in_active_conversation(instance_id) && !ctx.is_executing(instance_id)
}

fn is_idle(ctx: &SimulationContext, instance_id: &str) -> bool {
    ctx.agent_state(instance_id) == Some(AgentState::Idle) && is_free(ctx, instance_id)
}

/// Nearest other agent or element between `min` and `max` away
pub fn nearest_interest(
    ctx: &SimulationContext,
    instance_id: &str,
    min: f64,
    max: f64,
) -> Option<Position> {
    let origin = ctx.instance(instance_id)?.position;
    let agents = ctx
        .instances()
        .values()
        .filter(|i| i.instance_id != instance_id)
        .map(|i| i.position);
    let elements = ctx.elements().map(|e| e.position);
    agents
        .chain(elements)
        .map(|p| (origin.distance_to(p), p))
        .filter(|(d, _)| *d > min && *d <= max)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, p)| p)
}

fn update_reaction_cooldowns(ctx: &mut SimulationContext, dt_ms: f64) {
    let cooldowns = ctx.reaction_cooldowns_mut();
    for remaining in cooldowns.values_mut() {
        *remaining -= dt_ms;
    }
    cooldowns.retain(|_, remaining| *remaining > 0.0);
}

fn trigger_reactions(ctx: &mut SimulationContext, sim: &SimulationSettings) {
    let mut reactions = Vec::new();
    let mut inboxes = Vec::new();
    for instance in ctx.instances().values() {
        let moving = matches!(
            ctx.agent_state(&instance.instance_id),
            Some(AgentState::Wandering | AgentState::Patrolling | AgentState::Heartbeat)
        );
        if !moving {
            continue;
        }
        for element in ctx.elements() {
            if instance.position.distance_to(element.position) >= sim.interaction_radius {
                continue;
            }
            reactions.push((
                instance.instance_id.clone(),
                element.id.clone(),
                element.kind.reaction_emoji(),
            ));
            if element.kind == ElementKind::Inbox
                && element.owner_agent_id() == Some(instance.agent_id.as_str())
                && element.unread_count() > 0
            {
                inboxes.push(element.id.clone());
            }
        }
    }

    for (instance_id, element_id, emoji) in reactions {
        let key = (instance_id, element_id);
        if ctx.reaction_cooldowns_mut().contains_key(&key) {
            continue;
        }
        ctx.renderer().show_reaction_emoji(&key.0, emoji);
        ctx.reaction_cooldowns_mut()
            .insert(key, sim.reaction_cooldown_ms);
    }
    for element_id in inboxes {
        let read = ctx.mark_inbox_read(&element_id);
        if read > 0 {
            debug!("Owner skimmed {} unread in {}", read, element_id);
        }
    }
}

fn random_between(rng: &mut StdRng, min: f64, max: f64) -> f64 {
    if max > min { rng.gen_range(min..max) } else { min }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationStatus;
    use crate::elements::WorkshopElement;
    use crate::model::{AgentInstance, Behavior};
    use crate::physics::RapierWorld;
    use crate::queue::ReadPriority;
    use crate::renderer::{RecordingRenderer, RenderCall};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use workshop_common::{ManualClock, WorkshopSettings};

    #[derive(Default)]
    struct MockTasks {
        reads: Mutex<Vec<(String, String)>>,
        compactions: Mutex<Vec<String>>,
        turns: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl AgentTasks for MockTasks {
        async fn read_element(&self, instance_id: &str, element_id: &str) -> anyhow::Result<()> {
            self.reads
                .lock()
                .push((instance_id.to_string(), element_id.to_string()));
            Ok(())
        }

        async fn compact_context(&self, session_key: &str) -> anyhow::Result<()> {
            self.compactions.lock().push(session_key.to_string());
            Ok(())
        }

        fn session_turn_count(&self, session_key: &str) -> u32 {
            self.turns.lock().get(session_key).copied().unwrap_or(0)
        }

        fn reset_session_turn_count(&self, session_key: &str) {
            self.turns.lock().remove(session_key);
        }
    }

    struct Harness {
        ctx: SharedContext,
        renderer: Arc<RecordingRenderer>,
        tasks: Arc<MockTasks>,
        sim: Simulation,
    }

    fn settings() -> WorkshopSettings {
        let mut settings = WorkshopSettings::default();
        settings.simulation.seed = Some(7);
        settings
    }

    fn harness(settings: WorkshopSettings) -> Harness {
        let renderer = Arc::new(RecordingRenderer::new());
        let ctx = SimulationContext::new(
            settings,
            Arc::new(ManualClock::new(1_000_000)),
            Box::new(RapierWorld::new()),
            renderer.clone(),
        )
        .into_shared();
        let tasks = Arc::new(MockTasks::default());
        let sim = Simulation::new(Arc::clone(&ctx), tasks.clone());
        Harness {
            ctx,
            renderer,
            tasks,
            sim,
        }
    }

    fn place(h: &Harness, agent: &str, x: f64, y: f64, behavior: Behavior) -> String {
        h.ctx.lock().place_agent(agent, Position::new(x, y), behavior)
    }

    fn element(h: &Harness, kind: ElementKind, x: f64, y: f64) -> String {
        h.ctx
            .lock()
            .add_element(WorkshopElement::new(kind, "board", Position::new(x, y)))
    }

    fn state(h: &Harness, id: &str) -> Option<AgentState> {
        h.ctx.lock().agent_state(id)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_heartbeat_fires_after_idle_window() {
        let mut settings = settings();
        settings.simulation.heartbeat_min_ms = 1000.0;
        settings.simulation.heartbeat_max_ms = 1000.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);

        h.sim.tick(16.0);
        h.sim.tick(600.0);
        assert_eq!(state(&h, &a), Some(AgentState::Idle));
        h.sim.tick(600.0);
        assert_eq!(state(&h, &a), Some(AgentState::Heartbeat));
        assert_eq!(h.renderer.count(|c| matches!(c, RenderCall::Pulse(_))), 1);

        h.sim.tick(2000.0);
        assert_eq!(state(&h, &a), Some(AgentState::Idle));
    }

    #[test]
    fn test_heartbeat_scan_sends_agent_toward_interest() {
        let mut settings = settings();
        settings.simulation.heartbeat_min_ms = 500.0;
        settings.simulation.heartbeat_max_ms = 500.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        element(&h, ElementKind::Pinboard, 150.0, 0.0);

        h.sim.tick(16.0);
        h.sim.tick(600.0);

        let ctx = h.ctx.lock();
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Wandering));
        assert_eq!(
            ctx.motion(&a).and_then(|m| m.wander_target),
            Some(Position::new(150.0, 0.0))
        );
        assert!(ctx.instance(&a).unwrap().position.x > 0.0);
    }

    #[tokio::test]
    async fn test_idle_agent_reads_queued_element() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let board = element(&h, ElementKind::Rulebook, 500.0, 500.0);
        h.ctx.lock().enqueue_action(
            &a,
            AgentAction::ReadElement {
                element_id: board.clone(),
                priority: ReadPriority::High,
            },
        );

        h.sim.tick(16.0);
        {
            let ctx = h.ctx.lock();
            assert_eq!(ctx.agent_state(&a), Some(AgentState::Reading));
            assert!(ctx.is_executing(&a));
        }

        settle().await;
        assert_eq!(h.tasks.reads.lock().clone(), vec![(a.clone(), board)]);
        let ctx = h.ctx.lock();
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Idle));
        assert!(!ctx.is_executing(&a));
    }

    #[tokio::test]
    async fn test_compaction_after_turn_threshold() {
        let mut settings = settings();
        settings.simulation.cooldown_ms = 10.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let b = place(&h, "agent-b", 50.0, 0.0, Behavior::Stationary);

        let conversation = {
            let mut ctx = h.ctx.lock();
            let id = ctx
                .start_conversation(ConversationKind::Task, &[a.clone(), b.clone()], "task:1", None)
                .unwrap();
            ctx.end_conversation(&id);
            id
        };
        let session = agent_session_key("agent-a", &conversation);
        h.tasks.turns.lock().insert(session.clone(), 8);

        h.sim.tick(20.0);
        assert_eq!(state(&h, &a), Some(AgentState::Reading));
        assert_eq!(state(&h, &b), Some(AgentState::Idle));

        settle().await;
        assert_eq!(h.tasks.compactions.lock().clone(), vec![session.clone()]);
        assert_eq!(h.tasks.session_turn_count(&session), 0);
        assert_eq!(state(&h, &a), Some(AgentState::Idle));

        h.sim.tick(16.0);
        assert!(h.ctx.lock().queues().is_empty(&a));
    }

    #[tokio::test]
    async fn test_wanderer_walks_to_element_then_reads() {
        let mut settings = settings();
        settings.simulation.interest_bias = 0.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Wander);
        let board = element(&h, ElementKind::Messageboard, 200.0, 0.0);
        h.ctx.lock().enqueue_action(
            &a,
            AgentAction::ReadElement {
                element_id: board.clone(),
                priority: ReadPriority::Normal,
            },
        );

        let mut reached = false;
        for _ in 0..40 {
            h.sim.tick(100.0);
            if state(&h, &a) == Some(AgentState::Reading) {
                reached = true;
                break;
            }
        }
        assert!(reached);
        let x = h.ctx.lock().instance(&a).unwrap().position.x;
        assert!(x > 130.0 && x < 200.0);

        settle().await;
        assert_eq!(h.tasks.reads.lock().clone(), vec![(a.clone(), board)]);
        assert_eq!(state(&h, &a), Some(AgentState::Wandering));
    }

    #[tokio::test]
    async fn test_seek_info_picks_unread_element() {
        let mut settings = settings();
        settings.simulation.seek_info_interval_ms = 100.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let near = element(&h, ElementKind::Pinboard, 100.0, 0.0);
        element(&h, ElementKind::Pinboard, 1000.0, 0.0);

        h.sim.tick(150.0);
        assert_eq!(state(&h, &a), Some(AgentState::Reading));
        settle().await;
        assert_eq!(h.tasks.reads.lock().clone(), vec![(a, near)]);
    }

    #[test]
    fn test_patrol_orbits_home_smoothly() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Patrol);

        h.sim.tick(16.0);
        let first = h.ctx.lock().instance(&a).unwrap().position;
        assert!(first.length() <= 80.0 * 0.016 + 1e-9);

        for _ in 0..100 {
            h.sim.tick(100.0);
        }
        let (on_orbit, angle) = {
            let ctx = h.ctx.lock();
            (ctx.instance(&a).unwrap().position, ctx.motion(&a).unwrap().patrol_angle)
        };
        assert!((on_orbit.length() - 100.0).abs() < 1e-6);

        h.sim.tick(100.0);
        let next = h.ctx.lock().instance(&a).unwrap().position;
        assert!((next.x - (angle + 0.06).cos() * 100.0).abs() < 1e-6);
        assert!((next.y - (angle + 0.06).sin() * 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_patroller_placed_off_home_keeps_its_phase() {
        let mut h = harness(settings());
        let mut instance = AgentInstance::new("agent-a", Position::new(0.0, 100.0), Behavior::Patrol);
        instance.home_position = Position::default();
        let a = h.ctx.lock().add_instance(instance);

        h.sim.tick(100.0);
        let moved = h.ctx.lock().instance(&a).unwrap().position;
        assert!(moved.distance_to(Position::new(0.0, 100.0)) < 8.0);
        assert!((moved.length() - 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_patroller_resumes_patrol_after_detour_read() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Patrol);
        let rules = element(&h, ElementKind::Rulebook, 150.0, 0.0);
        h.ctx.lock().enqueue_action(
            &a,
            AgentAction::SeekInfo {
                element_id: rules.clone(),
            },
        );

        let mut reading = false;
        for _ in 0..40 {
            h.sim.tick(100.0);
            if state(&h, &a) == Some(AgentState::Reading) {
                reading = true;
                break;
            }
        }
        assert!(reading);

        settle().await;
        assert_eq!(h.tasks.reads.lock().clone(), vec![(a.clone(), rules)]);
        for _ in 0..5 {
            h.sim.tick(100.0);
        }
        let ctx = h.ctx.lock();
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Patrolling));
        assert!(ctx.motion(&a).unwrap().return_to.is_none());
    }

    #[tokio::test]
    async fn test_read_ending_mid_drag_does_not_strand_agent() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let board = element(&h, ElementKind::Rulebook, 2000.0, 2000.0);
        h.ctx.lock().enqueue_action(
            &a,
            AgentAction::ReadElement {
                element_id: board,
                priority: ReadPriority::High,
            },
        );

        h.sim.tick(100.0);
        assert_eq!(state(&h, &a), Some(AgentState::Reading));
        assert!(h.ctx.lock().pick_up(&a));

        settle().await;
        {
            let ctx = h.ctx.lock();
            assert_eq!(ctx.agent_state(&a), Some(AgentState::Dragged));
            assert!(!ctx.is_executing(&a));
        }

        assert!(h.ctx.lock().put_down(&a));
        assert_eq!(state(&h, &a), Some(AgentState::Idle));
        for _ in 0..50 {
            h.sim.tick(100.0);
            assert_ne!(state(&h, &a), Some(AgentState::Reading));
        }
    }

    #[test]
    fn test_idle_agent_walks_to_approach_target() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let b = place(&h, "agent-b", 200.0, 0.0, Behavior::Stationary);
        h.ctx.lock().enqueue_action(
            &a,
            AgentAction::ApproachAgent {
                target_instance_id: b,
            },
        );

        h.sim.tick(100.0);
        let ctx = h.ctx.lock();
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Wandering));
        assert_eq!(
            ctx.motion(&a).and_then(|m| m.wander_target),
            Some(Position::new(200.0, 0.0))
        );
        assert!(ctx.instance(&a).unwrap().position.x > 0.0);
        assert!(ctx.queues().is_empty(&a));
    }

    #[tokio::test]
    async fn test_compaction_runs_in_place_while_wandering() {
        let mut settings = settings();
        settings.simulation.cooldown_ms = 10.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Wander);
        let b = place(&h, "agent-b", 50.0, 0.0, Behavior::Stationary);

        let conversation = {
            let mut ctx = h.ctx.lock();
            let id = ctx
                .start_conversation(ConversationKind::Task, &[a.clone(), b.clone()], "task:2", None)
                .unwrap();
            ctx.end_conversation(&id);
            id
        };
        let session = agent_session_key("agent-a", &conversation);
        h.tasks.turns.lock().insert(session.clone(), 8);

        h.sim.tick(20.0);
        {
            let ctx = h.ctx.lock();
            assert_eq!(ctx.agent_state(&a), Some(AgentState::Wandering));
            assert!(ctx.is_executing(&a));
        }

        settle().await;
        assert_eq!(h.tasks.compactions.lock().clone(), vec![session.clone()]);
        assert_eq!(h.tasks.session_turn_count(&session), 0);
        let ctx = h.ctx.lock();
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Wandering));
        assert!(!ctx.is_executing(&a));
    }

    #[test]
    fn test_conversation_restarts_heartbeat_window() {
        let mut settings = settings();
        settings.simulation.heartbeat_min_ms = 1000.0;
        settings.simulation.heartbeat_max_ms = 1000.0;
        settings.simulation.cooldown_ms = 10.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let b = place(&h, "agent-b", 50.0, 0.0, Behavior::Stationary);

        h.sim.tick(16.0);
        h.sim.tick(600.0);
        let conversation = h
            .ctx
            .lock()
            .start_conversation(ConversationKind::Task, &[a.clone(), b], "task:3", None)
            .unwrap();
        h.sim.tick(16.0);
        assert_eq!(state(&h, &a), Some(AgentState::Conversing));
        h.ctx.lock().end_conversation(&conversation);
        h.sim.tick(20.0);
        assert_eq!(state(&h, &a), Some(AgentState::Idle));

        // 600ms of idle before the talk no longer count
        h.sim.tick(600.0);
        assert_eq!(state(&h, &a), Some(AgentState::Idle));
        h.sim.tick(600.0);
        assert_eq!(state(&h, &a), Some(AgentState::Heartbeat));
    }

    #[test]
    fn test_wander_targets_favor_nearby_interest() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Wander);
        element(&h, ElementKind::Pinboard, 250.0, 0.0);

        let ctx = h.ctx.lock();
        let sim = ctx.settings().simulation.clone();
        let toward_interest = (0..1000)
            .filter_map(|_| h.sim.pick_wander_target(&ctx, &a, &sim))
            .filter(|target| target.x > 200.0)
            .count();
        let share = toward_interest as f64 / 1000.0;
        assert!(share > 0.5 && share < 0.7, "share was {}", share);
    }

    #[tokio::test]
    async fn test_new_mail_sends_owner_to_read_then_to_sender() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let b = place(&h, "agent-b", 200.0, 0.0, Behavior::Stationary);
        let mut inbox = WorkshopElement::new(ElementKind::Inbox, "mail", Position::new(500.0, 0.0));
        inbox.set_owner("agent-a");
        let inbox = h.ctx.lock().add_element(inbox);

        assert!(h.ctx.lock().deliver_message(&inbox, "agent-b", "hi", "lunch?"));
        h.sim.tick(16.0);
        assert_eq!(state(&h, &a), Some(AgentState::Reading));
        assert_eq!(state(&h, &b), Some(AgentState::Idle));

        settle().await;
        assert_eq!(h.tasks.reads.lock().clone(), vec![(a.clone(), inbox)]);
        h.sim.tick(16.0);
        let ctx = h.ctx.lock();
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Wandering));
        assert_eq!(
            ctx.motion(&a).and_then(|m| m.wander_target),
            Some(Position::new(200.0, 0.0))
        );
    }

    #[tokio::test]
    async fn test_new_pin_is_read_by_agent_at_the_board() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 30.0, 0.0, Behavior::Stationary);
        let far = place(&h, "agent-b", 600.0, 0.0, Behavior::Stationary);
        let board = element(&h, ElementKind::Pinboard, 0.0, 0.0);

        assert!(h.ctx.lock().add_pin(&board, "agent-z", "ship small").is_some());
        h.sim.tick(16.0);
        assert_eq!(state(&h, &a), Some(AgentState::Reading));
        assert_eq!(state(&h, &far), Some(AgentState::Idle));

        settle().await;
        assert_eq!(h.tasks.reads.lock().clone(), vec![(a.clone(), board)]);
        assert_eq!(state(&h, &a), Some(AgentState::Idle));
    }

    #[test]
    fn test_banter_prefers_related_pair() {
        let mut settings = settings();
        settings.conversation.banter_check_interval_ms = 100.0;
        let mut h = harness(settings);
        place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let b = place(&h, "agent-b", 40.0, 0.0, Behavior::Stationary);
        let c = place(&h, "agent-c", 80.0, 0.0, Behavior::Stationary);
        h.ctx.lock().add_relationship(&b, &c, "pairs with");

        let pairs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pairs);
        h.sim
            .set_banter_callback(Some(Arc::new(move |x: String, y: String| sink.lock().push((x, y)))));

        h.sim.tick(50.0);
        assert!(pairs.lock().is_empty());
        h.sim.tick(60.0);
        assert_eq!(pairs.lock().clone(), vec![(b, c)]);
    }

    #[test]
    fn test_banter_falls_back_to_any_idle_pair() {
        let mut settings = settings();
        settings.conversation.banter_check_interval_ms = 100.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let b = place(&h, "agent-b", 40.0, 0.0, Behavior::Stationary);
        place(&h, "agent-c", 900.0, 0.0, Behavior::Stationary);

        let pairs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pairs);
        h.sim
            .set_banter_callback(Some(Arc::new(move |x: String, y: String| sink.lock().push((x, y)))));
        h.sim.tick(100.0);

        let recorded = pairs.lock().clone();
        assert_eq!(recorded.len(), 1);
        let (x, y) = &recorded[0];
        let mut got = vec![x.clone(), y.clone()];
        got.sort();
        let mut want = vec![a, b];
        want.sort();
        assert_eq!(got, want);
    }

    #[test]
    fn test_proximity_gate_ends_conversation_in_loop() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let b = place(&h, "agent-b", 50.0, 0.0, Behavior::Stationary);
        let conversation = h
            .ctx
            .lock()
            .start_conversation(ConversationKind::Task, &[a.clone(), b.clone()], "task:gate", None)
            .unwrap();
        h.ctx
            .lock()
            .set_instance_position(&b, Position::new(1000.0, 0.0));

        h.sim.tick(1000.0);
        let ctx = h.ctx.lock();
        assert_eq!(
            ctx.conversations().get(&conversation).unwrap().status,
            ConversationStatus::Completed
        );
        assert_eq!(ctx.agent_state(&a), Some(AgentState::Cooldown));
        assert_eq!(ctx.agent_state(&b), Some(AgentState::Cooldown));
    }

    #[test]
    fn test_overextended_wanderer_is_pulled_home() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Wander);
        h.ctx
            .lock()
            .set_instance_position(&a, Position::new(260.0, 0.0));

        h.sim.tick(100.0);
        {
            let ctx = h.ctx.lock();
            assert_eq!(ctx.physics().body_type(&a), Some(BodyType::Dynamic));
            assert!(ctx.instance(&a).unwrap().position.x < 260.0);
        }

        for _ in 0..7 {
            h.sim.tick(100.0);
        }
        let ctx = h.ctx.lock();
        assert_eq!(ctx.physics().body_type(&a), Some(BodyType::Kinematic));
        assert!(ctx.instance(&a).unwrap().position.x < 250.0);
    }

    #[test]
    fn test_reaction_once_per_cooldown_and_inbox_read() {
        let mut settings = settings();
        settings.simulation.interest_bias = 0.0;
        let mut h = harness(settings);
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Wander);

        let mut inbox = WorkshopElement::new(ElementKind::Inbox, "mail", Position::new(10.0, 0.0));
        inbox.set_owner("agent-a");
        inbox.deliver("agent-b", "hi", "lunch?", 1);
        let inbox_id = h.ctx.lock().add_element(inbox);

        h.sim.tick(16.0);
        h.sim.tick(16.0);

        let reactions = h.renderer.count(|c| {
            matches!(c, RenderCall::Reaction { instance_id, .. } if instance_id == &a)
        });
        assert_eq!(reactions, 1);
        assert_eq!(h.ctx.lock().element(&inbox_id).unwrap().unread_count(), 0);
    }

    #[tokio::test]
    async fn test_removed_agent_ignored_by_late_completion() {
        let mut h = harness(settings());
        let a = place(&h, "agent-a", 0.0, 0.0, Behavior::Stationary);
        let board = element(&h, ElementKind::Rulebook, 300.0, 300.0);
        h.ctx.lock().enqueue_action(
            &a,
            AgentAction::SeekInfo {
                element_id: board,
            },
        );

        h.sim.tick(16.0);
        assert!(h.ctx.lock().remove_instance(&a));
        settle().await;

        let ctx = h.ctx.lock();
        assert!(!ctx.has_instance(&a));
        assert!(!ctx.is_executing(&a));
        assert!(ctx.agent_state(&a).is_none());
        assert_eq!(h.tasks.reads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = harness(settings());
        place(&h, "agent-a", 0.0, 0.0, Behavior::Wander);

        let running = h.sim.start(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(40)).await;
        let sim = running.stop().await.unwrap();

        assert!(sim.frames() > 0);
        assert!(!h.ctx.lock().has_awareness_scan());
    }
}
