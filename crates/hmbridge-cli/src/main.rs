//! Command-line entry point for the hmbridge battery/inverter bridge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use hmbridge_core::config::env_vars;
use hmbridge_core::{BridgeConfig, Device, MemoryTransport, MqttConfig};
use hmbridge_devices::{DeviceManager, SchemaRegistry};

/// Interval at which dry-run mode logs what would have been published.
const DRY_RUN_FLUSH: Duration = Duration::from_secs(5);

/// hmbridge - bridge Hame/Marstek storage systems to MQTT.
#[derive(Parser, Debug)]
#[command(name = "hmbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker URL, e.g. mqtt://localhost:1883 (overrides MQTT_BROKER_URL).
    #[arg(short, long)]
    broker: Option<String>,

    /// Device as <familyId>:<deviceId>; repeatable (replaces DEVICE_n).
    #[arg(short, long = "device")]
    devices: Vec<String>,

    /// Operator topic prefix (overrides MQTT_TOPIC_PREFIX).
    #[arg(long)]
    topic_prefix: Option<String>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON.
    #[arg(long)]
    log_json: bool,

    /// Log outbound messages instead of connecting to a broker.
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(args: &Args) {
    let json_logging = args.log_json
        || std::env::var(env_vars::LOG_JSON)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

    let default_level = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "hmbridge={0},hmbridge_core={0},hmbridge_devices={0},warn",
            default_level
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

/// Environment configuration with command-line overrides applied.
fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::from_env().context("Invalid configuration")?;

    if let Some(url) = &args.broker {
        let mut mqtt = MqttConfig::from_url(url)?;
        mqtt.client_id = config.mqtt.client_id.take();
        mqtt.username = config.mqtt.username.take();
        mqtt.password = config.mqtt.password.take();
        mqtt.keep_alive = config.mqtt.keep_alive;
        config.mqtt = mqtt;
    }
    if let Some(prefix) = &args.topic_prefix {
        config.topic_prefix = prefix.clone();
    }
    if !args.devices.is_empty() {
        config.devices = args
            .devices
            .iter()
            .map(|spec| spec.parse::<Device>())
            .collect::<Result<_, _>>()?;
    }
    config.validate()?;
    Ok(config)
}

async fn run_dry(manager: Arc<DeviceManager>, transport: Arc<MemoryTransport>) {
    let tasks = manager.start().await;
    let mut flush = tokio::time::interval(DRY_RUN_FLUSH);
    loop {
        tokio::select! {
            _ = flush.tick() => {
                for message in transport.take_published() {
                    info!(
                        topic = %message.topic,
                        retain = message.options.retain,
                        "{}",
                        message.payload
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    for task in tasks {
        task.abort();
    }
}

#[cfg(feature = "mqtt")]
async fn run_mqtt(config: &BridgeConfig, registry: Arc<SchemaRegistry>) -> Result<()> {
    use hmbridge_devices::{run_event_loop, MqttTransport};

    let (transport, eventloop) = MqttTransport::connect(&config.mqtt);
    let manager = Arc::new(DeviceManager::new(config, registry, Arc::new(transport)));
    manager
        .add_devices(&config.devices)
        .context("No configured device could be resolved")?;

    let event_loop = tokio::spawn(run_event_loop(eventloop, manager.clone()));
    let tasks = manager.start().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    event_loop.abort();
    for task in tasks {
        task.abort();
    }
    Ok(())
}

#[cfg(not(feature = "mqtt"))]
async fn run_mqtt(_config: &BridgeConfig, _registry: Arc<SchemaRegistry>) -> Result<()> {
    anyhow::bail!("Built without MQTT support; use --dry-run")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    let registry = SchemaRegistry::builtin();
    info!(
        "hmbridge {} starting: {} device(s), families {:?}",
        env!("CARGO_PKG_VERSION"),
        config.devices.len(),
        registry.families()
    );
    if config.devices.is_empty() {
        warn!("No devices configured; set DEVICE_0=<familyId>:<deviceId> or pass --device");
    }

    if args.dry_run {
        let transport = Arc::new(MemoryTransport::new());
        let manager = Arc::new(DeviceManager::new(&config, registry, transport.clone()));
        manager
            .add_devices(&config.devices)
            .context("No configured device could be resolved")?;
        info!("Dry run: nothing is sent to a broker");
        run_dry(manager, transport).await;
        return Ok(());
    }

    run_mqtt(&config, registry).await
}
