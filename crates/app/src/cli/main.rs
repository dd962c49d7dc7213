//! eq8comp CLI Application

mod console;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::{element_ids, ConsoleLine};
use eq8comp_core::domain::config::ConfigManager;
use eq8comp_core::domain::{
    EffectState, Eq8Config, PageEvent, PageProcessor, StateHandle, StateService, StateStorage,
    Subscriber, TelemetryFrame, WireMessage, STORAGE_KEY,
};
use eq8comp_infra::audio::{GraphProbe, VirtualBackend};
use eq8comp_infra::storage::JsonFileStorage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Frames between two printed telemetry summaries
const TELEMETRY_PRINT_EVERY: u64 = 25;

#[derive(Parser)]
#[command(name = "eq8comp")]
#[command(about = "Equalizer and compressor pipeline control plane", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: <config dir>/eq8comp/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the state owner and a simulated page, reading JSON commands from stdin
    Run {
        /// State file (overrides the config)
        #[arg(long)]
        state: Option<PathBuf>,

        /// Number of media elements present at start
        #[arg(long, default_value_t = 1)]
        elements: usize,

        /// Connect a telemetry consumer
        #[arg(long)]
        telemetry: bool,

        /// Start audio contexts suspended
        #[arg(long)]
        suspended: bool,
    },
    /// Print the persisted state
    State {
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Print the factory default state
    Defaults,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetrySummary {
    #[serde(rename = "type")]
    kind: &'static str,
    frame: u64,
    gain_reduction: f32,
    peak: f32,
    loudest_bin: usize,
}

impl TelemetrySummary {
    fn new(frame: u64, data: &TelemetryFrame) -> Self {
        let peak = data
            .time_domain_data
            .iter()
            .fold(0.0f32, |peak, s| peak.max(s.abs()));
        let loudest_bin = data
            .frequency_data
            .iter()
            .enumerate()
            .max_by_key(|(_, b)| **b)
            .map(|(i, _)| i)
            .unwrap_or(0);
        Self {
            kind: "TELEMETRY",
            frame,
            gain_reduction: data.gain_reduction,
            peak,
            loudest_bin,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries the JSON line protocol
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<(ConfigManager, Eq8Config)> {
    let manager = match path {
        Some(path) => ConfigManager::for_file(path),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };
    let config = manager.load().await;
    Ok((manager, config))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to encode output line"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Defaults => {
            println!(
                "{}",
                serde_json::to_string_pretty(&EffectState::factory_default())?
            );
        }
        Command::State { state } => {
            let (manager, config) = load_config(cli.config).await?;
            let path = state.unwrap_or_else(|| manager.state_path(&config));
            let storage = JsonFileStorage::new(&path);

            match storage.get(STORAGE_KEY).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => info!(path = %path.display(), "No persisted state"),
            }
        }
        Command::Run {
            state,
            elements,
            telemetry,
            suspended,
        } => {
            let (manager, config) = load_config(cli.config).await?;
            let path = state.unwrap_or_else(|| manager.state_path(&config));
            run(config, path, elements, telemetry, suspended).await?;
        }
    }

    Ok(())
}

async fn run(
    config: Eq8Config,
    state_path: PathBuf,
    elements: usize,
    telemetry: bool,
    suspended: bool,
) -> anyhow::Result<()> {
    info!(path = %state_path.display(), "eq8comp starting");

    let storage = Arc::new(JsonFileStorage::new(&state_path));
    let service = StateService::open(storage, &config.store)
        .await
        .context("failed to load persisted state")?;
    let (store, service_task) = service.spawn();

    let printer = spawn_broadcast_printer(&store);
    let indicator = spawn_indicator_logger(&store);

    let mut backend = VirtualBackend::new(config.pipeline.fft_size);
    if suspended {
        backend = backend.suspended(2);
    }
    let probe = backend.probe();

    let processor = PageProcessor::start(store.clone(), backend, &config).await?;
    let (events, rx) = mpsc::channel(32);
    let page_task = tokio::spawn(processor.run(rx));

    events.send(PageEvent::Present(element_ids(elements))).await?;

    let consumer = if telemetry {
        let (subscriber, frames) = Subscriber::channel(config.telemetry.channel_capacity);
        events.send(PageEvent::ConsumerConnected(subscriber)).await?;
        Some(spawn_telemetry_printer(frames))
    } else {
        None
    };

    read_console(&store, &events, &probe).await?;

    // Shut down in dependency order: page, then the state owner (flushes)
    drop(events);
    let processor = page_task.await?;
    debug!(pipelines = processor.manager().len(), "Page closed");
    drop(processor);
    drop(store);
    service_task.await?;

    if let Some(consumer) = consumer {
        consumer.await?;
    }
    printer.await?;
    indicator.await?;

    info!("eq8comp stopped");
    Ok(())
}

async fn read_console(
    store: &StateHandle,
    events: &mpsc::Sender<PageEvent>,
    probe: &GraphProbe,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match ConsoleLine::parse(&line) {
            ConsoleLine::Empty => {}
            ConsoleLine::Command(raw) => match store.dispatch_json(&raw).await {
                Ok(reply) => print_json(&reply.into_wire()),
                Err(e) => print_json(&WireMessage::Error {
                    message: e.to_string(),
                }),
            },
            ConsoleLine::Graph => {
                for graph in probe.open() {
                    print_json(&graph);
                }
            }
            ConsoleLine::Add(element) => events.send(PageEvent::Discovered(element)).await?,
            ConsoleLine::Remove(element) => events.send(PageEvent::Removed(element)).await?,
            ConsoleLine::Play(element) => events.send(PageEvent::Playing(element)).await?,
            ConsoleLine::Scan(elements) => events.send(PageEvent::Present(elements)).await?,
            ConsoleLine::Quit => break,
            ConsoleLine::Unknown(line) => warn!(line = %line, "Unknown directive"),
        }
    }

    Ok(())
}

fn spawn_broadcast_printer(store: &StateHandle) -> JoinHandle<()> {
    let mut updates = store.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(state) => print_json(&WireMessage::SetState {
                    state: EffectState::clone(&state),
                }),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Broadcast printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_indicator_logger(store: &StateHandle) -> JoinHandle<()> {
    let mut indicator = store.active_indicator();
    tokio::spawn(async move {
        while indicator.changed().await.is_ok() {
            let active = *indicator.borrow_and_update();
            info!(active, "Effects indicator changed");
        }
    })
}

fn spawn_telemetry_printer(mut frames: mpsc::Receiver<TelemetryFrame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut count: u64 = 0;
        while let Some(frame) = frames.recv().await {
            count += 1;
            if count % TELEMETRY_PRINT_EVERY == 1 {
                print_json(&TelemetrySummary::new(count, &frame));
            }
        }
        debug!(frames = count, "Telemetry consumer closed");
    })
}
