//! Smart heating gateway.
//!
//! Run with: `cargo run -p smartheat-gateway`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use time::UtcOffset;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use smartheat_core::UdpTransport;
use smartheat_gateway::config::default_config_path;
use smartheat_gateway::{
    Config, CycleReport, CycleSettings, FileThermostatConfig, HttpServer, StepOutcome,
    SyncOrchestrator, SyncReport, ThermostatConfig, refresh,
};
use smartheat_store::{RecordQuery, Store};
use smartheat_types::TelemetryKind;

type Gateway = SyncOrchestrator<UdpTransport, HttpServer, FileThermostatConfig>;

/// Smart heating gateway - polls thermostats and applies heating schedules.
#[derive(Parser, Debug)]
#[command(name = "smartheat-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a cycle every `cycle.interval_secs` until interrupted (default).
    Run,

    /// Run a single cycle and print what it did.
    Cycle,

    /// Upload pending telemetry without contacting any thermostat.
    Upload,

    /// Fetch the linked thermostats and their heating tables from the server.
    Refresh,

    /// Write a configuration file with every setting at its default.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Show queue statistics and the configured thermostats.
    Status {
        /// Also list the most recent records of this thermostat.
        #[arg(long)]
        mac: Option<String>,

        /// Number of records to list.
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Must run while the process is still single-threaded.
    let offset = UtcOffset::current_local_offset().ok();

    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    let offset = offset.unwrap_or_else(|| {
        warn!("Could not determine the local UTC offset, schedules use UTC");
        UtcOffset::UTC
    });

    let Args {
        command,
        config,
        database,
        ..
    } = args;
    let load = || load_config(config.as_deref(), database.clone());

    match command.unwrap_or(Command::Run) {
        Command::InitConfig { force } => {
            let path = config.clone().unwrap_or_else(default_config_path);
            init_config(&path, force)
        }
        Command::Run => run(&load()?, offset).await,
        Command::Cycle => {
            let gateway = gateway(&load()?, offset)?;
            print_cycle(&gateway.run_cycle().await);
            Ok(())
        }
        Command::Upload => {
            let gateway = gateway(&load()?, offset)?;
            for report in gateway.upload_pending().await {
                print_upload(&report);
            }
            Ok(())
        }
        Command::Refresh => refresh_thermostats(&load()?).await,
        Command::Status { mac, limit } => status(&load()?, mac.as_deref(), limit),
    }
}

fn load_config(path: Option<&std::path::Path>, database: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_validated(path)?,
        None => {
            let config = Config::load_default()?;
            config.validate()?;
            config
        }
    };
    if let Some(db_path) = database {
        config.storage.path = db_path;
    }
    Ok(config)
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn init_logging(log_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("smartheat_gateway=info".parse()?)
        .add_directive("smartheat_core=info".parse()?)
        .add_directive("smartheat_store=info".parse()?);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn gateway(config: &Config, offset: UtcOffset) -> anyhow::Result<Gateway> {
    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;
    let server = HttpServer::new(&config.server.url, config.server.timeout())?;
    let thermostats = FileThermostatConfig::new(&config.thermostats_path);
    let settings = CycleSettings::new(&config.devices, &config.cycle).with_utc_offset(offset);

    Ok(SyncOrchestrator::new(
        UdpTransport::new(config.devices.transport()),
        Arc::new(Mutex::new(store)),
        server,
        thermostats,
        settings,
    ))
}

async fn run(config: &Config, offset: UtcOffset) -> anyhow::Result<()> {
    let gateway = gateway(config, offset)?;
    let mut ticker = tokio::time::interval(config.cycle.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Running a cycle every {:?}", config.cycle.interval());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
            _ = ticker.tick() => {
                gateway.run_cycle().await;
            }
        }
    }
    Ok(())
}

async fn refresh_thermostats(config: &Config) -> anyhow::Result<()> {
    let gateway_mac = config
        .gateway
        .mac
        .as_deref()
        .context("gateway.mac must be set to refresh thermostats")?;
    let server = HttpServer::new(&config.server.url, config.server.timeout())?;
    let thermostats = FileThermostatConfig::new(&config.thermostats_path);

    let report = refresh(&server, &thermostats, gateway_mac).await?;
    println!(
        "{} thermostat(s): {} table(s) updated, {} unchanged, {} failed",
        report.thermostats, report.tables_updated, report.tables_unchanged, report.tables_failed
    );
    Ok(())
}

fn status(config: &Config, mac: Option<&str>, limit: u32) -> anyhow::Result<()> {
    let store = Store::open(&config.storage.path)?;
    for kind in TelemetryKind::ALL {
        println!("{}", store.stats(kind)?);
    }

    let thermostats = FileThermostatConfig::new(&config.thermostats_path);
    match thermostats.thermostat_macs()? {
        Some(macs) => {
            println!("\n{} thermostat(s):", macs.len());
            for mac in macs {
                match thermostats.heating_table(&mac) {
                    Ok(table) => println!("  {} ({} schedule entries)", mac, table.len()),
                    Err(e) => println!("  {} (invalid heating table: {})", mac, e),
                }
            }
        }
        None => println!("\nNo thermostats configured"),
    }

    if let Some(mac) = mac {
        for kind in TelemetryKind::ALL {
            println!("\nLatest {} records of {}:", kind, mac);
            for record in store.query(&RecordQuery::new(kind).mac(mac).limit(limit))? {
                println!(
                    "  {}  {:>7.1}  {:<5}  attempts {}",
                    record.timestamp, record.value, record.status, record.attempts
                );
            }
        }
    }
    Ok(())
}

fn print_cycle(report: &CycleReport) {
    println!("Cycle at {}", report.started_at);
    for device in &report.devices {
        let reading = |value: Option<f32>| match value {
            Some(value) => format!("{:.1}", value),
            None => "-".to_string(),
        };
        println!(
            "  {}  temp {:>5}  rssi {:>6}  scheduled {:>5}  mode {}  target {}",
            device.mac,
            reading(device.temperature),
            reading(device.rssi),
            reading(device.scheduled),
            outcome(&device.mode),
            outcome(&device.target),
        );
    }
    println!("Stored {} record(s)", report.stored);
    for upload in &report.uploads {
        print_upload(upload);
    }
}

fn outcome(step: &StepOutcome) -> String {
    match step {
        StepOutcome::Unchanged => "unchanged".to_string(),
        StepOutcome::Updated => "updated".to_string(),
        StepOutcome::Failed(reason) => format!("failed ({})", reason),
        StepOutcome::Skipped(reason) => format!("skipped ({})", reason),
    }
}

fn print_upload(report: &SyncReport) {
    let kind = report
        .kind
        .map(|kind| kind.to_string())
        .unwrap_or_default();
    if report.offline {
        println!("{} upload: server unreachable", kind);
    } else {
        println!(
            "{} upload: {} sent, {} retried, {} failed",
            kind, report.sent, report.retried, report.failed
        );
    }
}
