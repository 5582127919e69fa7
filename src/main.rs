use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use stagehand::audio::RodioBackend;
use stagehand::composition::{Catalog, CatalogError, MediaProbe};
use stagehand::config::{ConfigError, Settings};
use stagehand::console::Console;
use stagehand::control::{CommandHandler, DeviceInputRouter, MidiActionReceiver, RemoteCommandSender};
use stagehand::designer::LightingDesignEngine;
use stagehand::director::Director;
use stagehand::dmx_output::{DmxOutput, LegacyDmxOutput, UniverseSink};
use stagehand::dmx_types::Project;
use stagehand::midi_device::{DeviceBus, DeviceKind, DeviceListener, MidiDeviceIn, MidiDeviceOut};
use stagehand::midi_routing::{MidiOutPort, MidiReceiver, MidiRoutingEngine, RemoteSender};
use stagehand::notify::{LogNotifier, NotificationSink};
use stagehand::player::PlayerContext;
use stagehand::remote::{self, OscMidiListener, OscRemoteSender};
use stagehand::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "stagehand", about = "Live show playback, lighting and MIDI control")]
struct Args {
    /// Settings file (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Composition and set list catalog, created on first save
    #[arg(short, long, default_value = "catalog.json")]
    catalog: PathBuf,

    /// Lighting projects (JSON array)
    #[arg(short, long)]
    projects: Option<PathBuf>,

    /// Set list to load at startup
    #[arg(long)]
    set_list: Option<String>,
}

#[derive(Error, Debug)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("Could not load projects from {}: {reason}", path.display())]
    Projects { path: PathBuf, reason: String },
    #[error(transparent)]
    Remote(#[from] remote::Error),
    #[error("Console stopped unexpectedly: {0}")]
    Console(#[from] tokio::task::JoinError),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_projects(path: &Path) -> Result<Vec<Project>, StartupError> {
    let error = |reason: String| StartupError::Projects {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| error(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| error(e.to_string()))
}

fn run_console(console: Arc<Mutex<Console>>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        match console.lock().execute_line(line) {
            Ok(reply) => println!("{reply}"),
            Err(e) => println!("{e}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    init_tracing();
    let args = Args::parse();

    let settings = Arc::new(match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    });
    let scheduler = Arc::new(Scheduler::from_handle(tokio::runtime::Handle::current()));
    let notifier: Arc<dyn NotificationSink> = Arc::new(LogNotifier);

    let dmx: Arc<dyn UniverseSink> = Arc::new(DmxOutput::open(&settings.dmx_serial_port));
    let legacy_dmx = Arc::new(LegacyDmxOutput::new(Arc::clone(&dmx)));

    let bus = Arc::new(DeviceBus::default());
    let midi_out = MidiDeviceOut::new(
        settings.midi_out_device.clone(),
        Arc::clone(&scheduler),
        settings.reconnect_delay(),
        Arc::clone(&bus),
    );
    let midi_in = MidiDeviceIn::new(
        settings.midi_in_device.clone(),
        Arc::clone(&scheduler),
        settings.reconnect_delay(),
        Arc::clone(&bus),
    );
    let osc_sender = Arc::new(OscRemoteSender::new(&settings.remote_devices)?);
    let remote_sender: Arc<dyn RemoteSender> = osc_sender.clone();
    let command_sender: Arc<dyn RemoteCommandSender> = osc_sender;
    let out_port: Arc<dyn MidiOutPort> = midi_out.clone();
    let routing = Arc::new(
        MidiRoutingEngine::new(Arc::clone(&notifier))
            .with_out_device(out_port)
            .with_dmx(legacy_dmx)
            .with_remote(remote_sender),
    );

    let designer = LightingDesignEngine::new(
        Arc::clone(&dmx),
        Arc::clone(&scheduler),
        settings.designer_frequency_hertz,
        settings.designer_master_dimmer,
    );
    if let Some(path) = &args.projects {
        let projects = load_projects(path)?;
        tracing::info!(count = projects.len(), "Lighting projects loaded");
        designer.set_projects(projects);
    }

    let probe = Arc::new(MediaProbe::new(Arc::clone(&settings)));
    let catalog = Arc::new(Catalog::open(&args.catalog, probe, settings.probe_workers)?);
    let context = PlayerContext {
        backend: Some(Arc::new(RodioBackend)),
        settings: Arc::clone(&settings),
        notifier,
        routing: Arc::clone(&routing),
        scheduler,
        designer: Some(Arc::clone(&designer)),
    };
    let director = Director::new(context, catalog);
    if let Some(name) = &args.set_list {
        if let Err(e) = director.load_set_list(name) {
            tracing::warn!(set_list = name.as_str(), error = %e, "Set list not loaded");
        }
    }
    if let Err(e) = director.play_default_composition() {
        tracing::warn!(error = %e, "Default composition not started");
    }

    let console = Arc::new(Mutex::new(Console::new(
        Arc::clone(&director),
        Some(Arc::clone(&designer)),
        settings.designer_master_dimmer,
    )));
    let command_handler: Arc<dyn CommandHandler> = console.clone();

    let actions: Option<Arc<dyn MidiReceiver>> = (!settings.midi_action_mapping.is_empty())
        .then(|| {
            Arc::new(MidiActionReceiver::new(
                settings.midi_action_mapping.clone(),
                Some(Arc::clone(&command_handler)),
                Some(command_sender),
            )) as Arc<dyn MidiReceiver>
        });
    let input_router: Arc<dyn DeviceListener> = Arc::new(DeviceInputRouter::new(
        Arc::clone(&routing),
        midi_in.clone(),
        settings.device_in_routings.clone(),
        actions,
    ));
    bus.subscribe(DeviceKind::MidiIn, &input_router);
    midi_out.connect();
    midi_in.connect();

    let remote_listener = match &settings.remote_listen_address {
        Some(address) => {
            let listener = OscMidiListener::bind(address, &tokio::runtime::Handle::current())?;
            routing.connect_transmitter(&listener, &settings.remote_routings);
            listener.set_command_handler(Some(command_handler));
            Some(listener)
        }
        None => None,
    };
    tracing::info!("Ready, type commands (quit to exit)");
    tokio::task::spawn_blocking(move || run_console(console)).await?;

    director.current_player().stop();
    director.stop_default_composition();
    designer.close();
    midi_in.close();
    midi_out.close();
    drop(remote_listener);
    tracing::info!("Bye");
    Ok(())
}
