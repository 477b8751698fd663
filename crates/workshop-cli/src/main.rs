use anyhow::Result;
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use workshop_common::WorkshopSettings;
use workshop_core::{
    AutoSaver, ConversationStatus, LocalCache, MemoryStore, Simulation, SimulationContext,
};
use workshop_gateway::{BridgeEvent, GatewayBridge, ScriptedGateway};

mod roster;

/// Command-line arguments for the Workshop runner
#[derive(Parser)]
#[command(
    name = "workshop",
    about = "Workshop - a spatial multi-agent simulation, run headless against a scripted gateway"
)]
pub struct Args {
    /// Path to the settings file
    #[clap(short, long, default_value = "workshop.toml")]
    config: PathBuf,

    /// Number of agents to place on a fresh canvas
    #[clap(short, long, default_value_t = 4)]
    agents: usize,

    /// How long to run, in seconds
    #[clap(short, long, default_value_t = 60)]
    seconds: u64,

    /// Simulation frames per second
    #[clap(long, default_value_t = 30)]
    fps: u32,

    /// Fixed RNG seed for reproducible runs
    #[clap(long)]
    seed: Option<u64>,

    /// Path to the data directory (overrides the settings file)
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Start a task conversation between the first two agents
    #[clap(long)]
    task: Option<String>,

    /// Ignore the cached workshop and start fresh
    #[clap(long)]
    fresh: bool,

    /// Enable debug mode
    #[clap(short, long)]
    debug: bool,
}

fn print_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::Message(message) => println!(
            "{} {} {}",
            format!("[turn {}]", message.turn).bright_black(),
            format!("{}:", message.speaker).bright_green().bold(),
            message.text
        ),
        BridgeEvent::ConversationEnded {
            conversation_id,
            turns,
        } => println!(
            "{}",
            format!("* conversation {} ended after {} turns", conversation_id, turns).bright_yellow()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup tracing
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = WorkshopSettings::load(&args.config)?;
    if args.seed.is_some() {
        settings.simulation.seed = args.seed;
    }
    if let Some(data_dir) = &args.data_dir {
        settings.persistence.data_dir = data_dir.clone();
    }

    // Ensure data directory exists
    let data_dir = settings.persistence.data_dir.clone();
    std::fs::create_dir_all(&data_dir)?;
    let host = settings.persistence.active_host.clone();

    info!("Starting Workshop");
    info!("Data directory: {:?}", data_dir);

    let cache = LocalCache::new(&data_dir, &host);
    let mut ctx = SimulationContext::headless(settings.clone());
    ctx.set_memory_store(MemoryStore::open(&data_dir, &host)?);

    let cached = if args.fresh {
        None
    } else {
        cache.load().unwrap_or_else(|e| {
            warn!("Ignoring unreadable workshop cache: {}", e);
            None
        })
    };
    match cached {
        Some(snapshot) => {
            println!("{}", "♻️  Restoring cached workshop...".bright_cyan());
            ctx.restore(snapshot);
        }
        None => {
            println!(
                "{}",
                format!("🛠️  Setting up a fresh workshop with {} agents", args.agents).bright_cyan()
            );
            roster::seed_workshop(&mut ctx, args.agents);
        }
    }
    let interrupted: Vec<String> = ctx
        .conversations()
        .all()
        .filter(|c| c.status == ConversationStatus::Interrupted)
        .map(|c| c.id.clone())
        .collect();
    let instance_ids = ctx.instance_ids();

    let shared = ctx.into_shared();
    let saver = AutoSaver::attach(
        &shared,
        cache,
        Duration::from_millis(settings.persistence.auto_save_debounce_ms),
    );

    let counter = AtomicUsize::new(0);
    let gateway = Arc::new(ScriptedGateway::new(move |_, prompt| {
        roster::scripted_reply(&counter, prompt)
    }));
    let bridge = Arc::new(GatewayBridge::new(
        shared.clone(),
        gateway,
        settings.gateway.clone(),
    ));
    bridge.add_listener(print_event);

    for conversation_id in interrupted {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            if let Err(e) = bridge.resume_conversation(&conversation_id).await {
                warn!("Could not resume {}: {:#}", conversation_id, e);
            }
        });
    }

    if let (Some(task), [first, second, ..]) = (args.task.clone(), instance_ids.as_slice()) {
        let bridge = Arc::clone(&bridge);
        let participants = vec![first.clone(), second.clone()];
        tokio::spawn(async move {
            match bridge
                .start_multi_agent_conversation(&participants, &task, None)
                .await
            {
                Ok(outcome) => info!("Task finished after {} turns", outcome.turns),
                Err(e) => error!("Task conversation failed: {:#}", e),
            }
        });
    }

    let mut simulation = Simulation::new(shared.clone(), bridge.clone());
    simulation.set_banter_callback(Some(bridge.banter_callback()));
    let frame = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
    let running = simulation.start(frame);

    println!(
        "{}",
        format!("💬 Running for {}s. Press Ctrl-C to stop early.", args.seconds).bright_green()
    );
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.seconds)) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        }
    }

    let frames = running
        .stop()
        .await
        .map(|simulation| simulation.frames())
        .unwrap_or(0);
    saver.stop();
    if let Err(e) = saver.flush() {
        error!("Failed to save workshop: {}", e);
    }

    let ctx = shared.lock();
    let conversations = ctx.conversations().all().count();
    println!();
    println!("{}", "📊 Summary".bright_cyan().bold());
    println!("{} {}", "Frames:".bright_yellow(), frames);
    println!("{} {}", "Agents:".bright_yellow(), ctx.instances().len());
    println!("{} {}", "Conversations:".bright_yellow(), conversations);
    println!("{} {}", "Still running:".bright_yellow(), bridge.active_loop_count());
    println!("{}", "👋 Goodbye!".bright_green());

    Ok(())
}
