// Console front end: wires the engine to the device capabilities and a
// line-based control surface on stdin.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::core::{
    alerts::{
        AlertEngine, AlertState, AlertStateMachine, AlertView, EngineHandle, HttpCallChannel, MachineConfig, SessionMode,
    },
    config::{ConfigManager, MotionSettings, Settings},
    connectivity::{ConnectivityMonitor, TcpProbe},
    contacts::{store::ContactStore, ContactRegistry, NewContact, SharedContacts},
    location::{self, CoordinateGeocoder, LocationHandle, LocationTracker, TrackerConfig},
    error::ValidationError,
    model::{ContactId, EmergencyType, TriggerSource},
    motion::{self, IioAccelerometer, MotionConfig, MotionSensor, MotionTriggerDetector, UnsupportedMotionSensor},
};

const APP_DIR: &str = "shield-alert";

/// ShieldHer emergency alert engine.
#[derive(Parser, Debug)]
#[command(name = "shield-alert")]
#[command(about = "Emergency alert engine with countdown, shake trigger and contact dispatch")]
struct Args {
    /// Directory holding settings.json
    #[arg(long, env = "SHIELD_ALERT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory holding contacts.json
    #[arg(long, env = "SHIELD_ALERT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(serve(args))
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Also installs the log -> tracing bridge for the core's log:: records
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn resolve_dir(explicit: Option<PathBuf>, platform: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| platform.map(|dir| dir.join(APP_DIR)))
        .unwrap_or_else(|| PathBuf::from("."))
}

struct Console {
    engine: EngineHandle,
    contacts: SharedContacts,
    store: ContactStore,
    location: LocationHandle,
    monitor: Arc<ConnectivityMonitor>,
    settings: Settings,
}

async fn serve(args: Args) -> Result<()> {
    let config_dir = resolve_dir(args.config_dir, dirs::config_dir());
    let data_dir = resolve_dir(args.data_dir, dirs::data_dir());
    log::info!("Config directory: {:?}, data directory: {:?}", config_dir, data_dir);

    let config_manager = ConfigManager::new(config_dir);
    let settings = config_manager.load();

    let store = ContactStore::new(&data_dir);
    let contacts = store
        .load()
        .with_context(|| format!("loading contacts from {:?}", store.path()))?
        .into_shared();

    let (tracker, location) = LocationTracker::new(
        location::provider_from_settings(&settings.location),
        Arc::new(CoordinateGeocoder),
        TrackerConfig::from(&settings.location),
    );
    let tracker_task = tracker.spawn();

    let monitor = Arc::new(ConnectivityMonitor::new(true));
    let probe_task = TcpProbe::from_settings(&settings.connectivity).map(|probe| probe.spawn(Arc::clone(&monitor)));

    let channel = HttpCallChannel::from_settings(&settings.dispatch).context("building HTTP delivery channel")?;
    log::info!("Delivering alerts through {}", channel.endpoint());
    let machine = AlertStateMachine::new(
        MachineConfig::from(&settings),
        Arc::clone(&contacts),
        location.subscribe(),
        monitor.is_online(),
    );
    let (engine, handle) = AlertEngine::new(
        machine,
        Arc::new(channel),
        Duration::from_secs(settings.dispatch.request_timeout_seconds.max(1)),
    );
    let engine_task = engine.spawn();
    handle.watch_contacts(&contacts);
    let connectivity_task = handle.watch_connectivity(&monitor);

    let motion_task = if settings.motion.enabled {
        let sensor = motion_sensor(&settings.motion);
        motion::spawn_motion_bridge(
            sensor.as_ref(),
            MotionTriggerDetector::new(MotionConfig::from(&settings.motion)),
            handle.clone(),
            settings.alert.default_type,
            settings.alert.default_message.clone(),
        )
    } else {
        log::info!("Shake trigger disabled in settings");
        None
    };

    let printer_task = spawn_view_printer(handle.subscribe());

    let console = Console {
        engine: handle.clone(),
        contacts,
        store,
        location,
        monitor,
        settings,
    };
    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match Command::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => console.execute(command)?,
            Err(message) => println!("{}", message),
        }
    }

    let _ = handle.shutdown();
    let _ = engine_task.await;
    for task in [Some(tracker_task), probe_task, Some(connectivity_task), motion_task, Some(printer_task)]
        .into_iter()
        .flatten()
    {
        task.abort();
    }
    Ok(())
}

fn motion_sensor(settings: &MotionSettings) -> Box<dyn MotionSensor> {
    let Some(device) = &settings.iio_device else {
        return Box::new(UnsupportedMotionSensor);
    };
    match IioAccelerometer::probe(device, Duration::from_millis(settings.poll_interval_ms.max(1))) {
        Ok(sensor) => Box::new(sensor),
        Err(e) => {
            log::warn!("Accelerometer at {:?} unusable: {}", device, e);
            Box::new(UnsupportedMotionSensor)
        }
    }
}

fn spawn_view_printer(mut views: watch::Receiver<AlertView>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            println!("{}", render_view(&view));
        }
    })
}

fn render_view(view: &AlertView) -> String {
    let mut out = format!("[{}]", view.state.display_name());
    if let Some(emergency_type) = view.emergency_type {
        out.push_str(&format!(" {}", emergency_type.display_name()));
    }
    if view.mode == Some(SessionMode::Practice) {
        out.push_str(" (practice)");
    }
    if let (AlertState::CountingDown, Some(remaining)) = (view.state, view.countdown_remaining) {
        out.push_str(&format!(" - {} (type 'cancel' to stop)", remaining));
    }
    for delivery in &view.deliveries {
        out.push_str(&format!("\n  {} {}: {:?}", delivery.contact_id, delivery.name, delivery.status));
    }
    out
}

const HELP: &str = "Commands:
  tap [personal|medical|safety] [message]   start the alert countdown
  cancel                                    stop a running countdown
  practice [type]                           rehearse without contacting anyone
  status                                    show alert state and location
  contacts                                  list emergency contacts
  add <name> <phone>                        add a contact (E.164, e.g. +15551234567)
  remove <id>                               remove a contact
  primary <id> [on|off]                     mark a contact as primary
  refresh                                   request a new location fix
  online | offline                          override connectivity
  quit";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Tap {
        emergency_type: Option<EmergencyType>,
        message: Option<String>,
    },
    Cancel,
    Practice(Option<EmergencyType>),
    Status,
    Contacts,
    Add {
        name: String,
        phone: String,
    },
    Remove(ContactId),
    Primary {
        id: ContactId,
        primary: bool,
    },
    Refresh,
    Online(bool),
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(Self::Help);
        };
        let rest: Vec<&str> = words.collect();
        match verb.to_ascii_lowercase().as_str() {
            "tap" | "sos" => {
                let emergency_type = rest.first().and_then(|w| EmergencyType::parse(w));
                let message_words = if emergency_type.is_some() { &rest[1..] } else { &rest[..] };
                let message = (!message_words.is_empty()).then(|| message_words.join(" "));
                Ok(Self::Tap {
                    emergency_type,
                    message,
                })
            }
            "cancel" => Ok(Self::Cancel),
            "practice" => Ok(Self::Practice(rest.first().and_then(|w| EmergencyType::parse(w)))),
            "status" => Ok(Self::Status),
            "contacts" | "list" => Ok(Self::Contacts),
            "add" => match rest.split_last() {
                Some((phone, name)) if !name.is_empty() => Ok(Self::Add {
                    name: name.join(" "),
                    phone: phone.to_string(),
                }),
                _ => Err("usage: add <name> <phone>".to_string()),
            },
            "remove" | "rm" => parse_id(rest.first()).map(Self::Remove),
            "primary" => {
                let id = parse_id(rest.first())?;
                let primary = !matches!(rest.get(1).copied(), Some("off") | Some("no") | Some("false"));
                Ok(Self::Primary { id, primary })
            }
            "refresh" => Ok(Self::Refresh),
            "online" => Ok(Self::Online(true)),
            "offline" => Ok(Self::Online(false)),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command {:?}, type 'help'", other)),
        }
    }
}

fn parse_id(word: Option<&&str>) -> Result<ContactId, String> {
    word.map(|w| w.trim_start_matches('#'))
        .and_then(|w| w.parse().ok())
        .map(ContactId)
        .ok_or_else(|| "expected a contact id, e.g. 2 or #2".to_string())
}

impl Console {
    fn execute(&self, command: Command) -> Result<()> {
        let alert = &self.settings.alert;
        match command {
            Command::Tap {
                emergency_type,
                message,
            } => self.engine.trigger(
                TriggerSource::Manual,
                emergency_type.unwrap_or(alert.default_type),
                message.unwrap_or_else(|| alert.default_message.clone()),
            )?,
            Command::Cancel => self.engine.cancel()?,
            Command::Practice(emergency_type) => self
                .engine
                .run_practice_alert(emergency_type.unwrap_or(alert.default_type), alert.default_message.clone())?,
            Command::Status => {
                println!("{}", render_view(&self.engine.view()));
                println!(
                    "Location: {}{}",
                    self.location.current().describe(),
                    if self.location.is_refreshing() { " (refreshing)" } else { "" }
                );
                println!("Connectivity: {}", if self.monitor.is_online() { "online" } else { "offline" });
            }
            Command::Contacts => {
                let contacts = self.contacts.read().unwrap_or_else(PoisonError::into_inner).snapshot();
                if contacts.is_empty() {
                    println!("No emergency contacts. Add one with: add <name> <phone>");
                }
                for contact in contacts {
                    println!(
                        "  {} {} {}{}",
                        contact.id,
                        contact.name,
                        contact.phone,
                        if contact.primary { " (primary)" } else { "" }
                    );
                }
            }
            Command::Add { name, phone } => self.edit_contacts(|registry| {
                registry
                    .add(NewContact::new(name, phone))
                    .map(|id| format!("Added contact {}", id))
            })?,
            Command::Remove(id) => self.edit_contacts(|registry| {
                registry.remove(id).map(|c| format!("Removed {}", c.name))
            })?,
            Command::Primary { id, primary } => self.edit_contacts(|registry| {
                registry
                    .set_primary(id, primary)
                    .map(|()| format!("Contact {} primary: {}", id, primary))
            })?,
            Command::Refresh => {
                if !self.location.request_refresh() {
                    println!("Location refresh already in progress");
                }
            }
            Command::Online(online) => {
                self.monitor.set_online(online);
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    /// Apply one registry mutation and persist it when it succeeds.
    fn edit_contacts<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ContactRegistry) -> Result<String, ValidationError>,
    {
        let mut registry = self.contacts.write().unwrap_or_else(PoisonError::into_inner);
        match edit(&mut *registry) {
            Ok(summary) => {
                self.store
                    .save(&registry)
                    .with_context(|| format!("saving contacts to {:?}", self.store.path()))?;
                println!("{}", summary);
            }
            Err(e) => println!("{}", e),
        }
        Ok(())
    }
}
