//! CANaerospace Node CLI Application
//!
//! Hosts a node from a TOML configuration and offers maintenance commands
//! for the node's registry:
//! - `run`: start the node, publish configured values, print watched updates
//! - `get` / `set`: read and write single settings
//! - `dump`: print the settings tree as JSON

use anyhow::{Context, Result};
use canas_node::{
    CanDriver, HandlerResult, MemoryStore, Node, ParameterUpdate, ParameterValue, Registry,
    SettingValue, Settings, SlcanDriver, VirtualBus,
};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod config;

use config::{AppConfig, DriverKind};

/// CANaerospace node host
#[derive(Parser, Debug)]
#[command(name = "canas")]
#[command(about = "Run a CANaerospace node and manage its registry", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Registry file (overrides [registry] path)
    #[arg(short, long, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Erase the registry before use
    #[arg(long)]
    factory_reset: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node
    Run {
        /// Stop after this many seconds (default: wait for Enter)
        #[arg(short, long, value_name = "SECS")]
        duration: Option<u64>,

        /// Use an in-process virtual bus regardless of configuration
        #[arg(long)]
        simulate: bool,
    },
    /// Print one setting
    Get {
        /// Setting path, e.g. `node-id` or `bus/bitrate`
        path: String,
    },
    /// Store one setting
    Set {
        path: String,
        /// One of u8, u16, u32, i16, i32, f32, bool, str
        #[arg(value_name = "TYPE")]
        type_name: String,
        value: String,
    },
    /// Print the settings tree as JSON
    Dump,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Cannot parse '{text}' as {type_name}")]
    InvalidValue { type_name: String, text: String },

    #[error("Unknown CAN driver '{0}' in registry")]
    UnknownDriver(String),

    #[error("The slcan driver needs a device ([bus] device)")]
    MissingDevice,

    #[error("Value {value} does not fit parameter {id}")]
    ValueOutOfRange { id: u16, value: f64 },
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::debug!("CANaerospace node CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using node library v{}", canas_node::VERSION);

    match execute(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("canas: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn execute(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    let registry = open_registry(args, &config)?;

    match &args.command {
        Command::Run { duration, simulate } => {
            run_node(&config, registry, duration.map(Duration::from_secs), *simulate)
        }
        Command::Get { path } => {
            let settings = Settings::new(registry)?;
            match settings.get(path)? {
                Some(value) => println!("{} = {} ({})", path, value, value.type_name()),
                None => println!("{} is not set", path),
            }
            Ok(())
        }
        Command::Set {
            path,
            type_name,
            value,
        } => {
            let parsed = SettingValue::parse(type_name, value).ok_or_else(|| {
                CliError::InvalidValue {
                    type_name: type_name.clone(),
                    text: value.clone(),
                }
            })?;
            let settings = Settings::new(registry.clone())?;
            settings.set(path, parsed)?;
            registry.sync()?;
            log::info!("Stored {} = {} ({})", path, value, type_name);
            Ok(())
        }
        Command::Dump => {
            let settings = Settings::new(registry.clone())?;
            let dump = serde_json::json!({
                "registry": {
                    "capacity": registry.capacity(),
                    "row_size": registry.row_size(),
                },
                "settings": settings.tree()?,
            });
            println!("{}", serde_json::to_string_pretty(&dump)?);
            Ok(())
        }
    }
}

fn open_registry(args: &Args, config: &AppConfig) -> Result<Arc<Registry>> {
    let options = config.registry.options(args.factory_reset);
    let path = args.registry.as_ref().or(config.registry.path.as_ref());

    let registry = match path {
        Some(path) => Registry::open_file(path, options)
            .with_context(|| format!("Failed to open registry: {:?}", path))?,
        None => {
            log::warn!("No registry file given, settings will not persist");
            Registry::open_memory(MemoryStore::new(), options)?
        }
    };
    Ok(Arc::new(registry))
}

fn select_driver(
    config: &AppConfig,
    registry: &Arc<Registry>,
    simulate: bool,
) -> Result<(Arc<dyn CanDriver>, Option<VirtualBus>)> {
    let kind = if simulate {
        DriverKind::Virtual
    } else {
        let settings = Settings::new(registry.clone())?;
        match settings.get_str("can-driver")? {
            Some(name) => DriverKind::from_name(&name).ok_or(CliError::UnknownDriver(name))?,
            None => config.bus.driver,
        }
    };

    match kind {
        DriverKind::Virtual => {
            log::info!("Using virtual bus");
            let bus = VirtualBus::new();
            let port: Arc<dyn CanDriver> = bus.attach();
            Ok((port, Some(bus)))
        }
        DriverKind::Slcan => {
            let device = config.bus.device.as_ref().ok_or(CliError::MissingDevice)?;
            let driver = SlcanDriver::open(device)
                .with_context(|| format!("Failed to open CAN device: {:?}", device))?;
            Ok((Arc::new(driver), None))
        }
    }
}

fn run_node(
    config: &AppConfig,
    registry: Arc<Registry>,
    duration: Option<Duration>,
    simulate: bool,
) -> Result<()> {
    let (driver, _bus) = select_driver(config, &registry, simulate)?;
    let node = Node::start(config.node_config()?, registry, driver)
        .context("Failed to start node")?;

    for watch in &config.watch {
        let definition = config.resolve(&watch.parameter)?;
        let name = definition.name.clone();
        node.register(
            definition.id,
            "canas-cli",
            Arc::new(move |update: &ParameterUpdate| -> HandlerResult {
                println!("{}", format_update(&name, update, &Local));
                Ok(())
            }),
        );
    }

    for publish in &config.publish {
        let definition = config.resolve(&publish.parameter)?;
        let value = ParameterValue::from_number(definition.datatype, publish.value).ok_or(
            CliError::ValueOutOfRange {
                id: definition.id,
                value: publish.value,
            },
        )?;
        node.publish_local(definition.id, value)?;
        log::info!("Publishing {} = {}", definition.name, value);
    }

    match duration {
        Some(duration) => std::thread::sleep(duration),
        None => {
            println!("Node {} running, press Enter to stop", node.node_id());
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
        }
    }

    let stats = node.stats();
    let peers = node.peers();
    if let Err(e) = node.check_identity() {
        log::warn!("{}", e);
    }
    node.shutdown().context("Node shutdown failed")?;

    let summary = serde_json::json!({
        "stats": stats,
        "peers": peers,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// One line per watched update, time shown in `zone`
fn format_update<Tz: TimeZone>(name: &str, update: &ParameterUpdate, zone: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{} {:<24} node {:>3} #{:<3} {}",
        update.timestamp().with_timezone(zone).format("%H:%M:%S%.3f"),
        name,
        update.node_id,
        update.message_code,
        update.value
    )
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
