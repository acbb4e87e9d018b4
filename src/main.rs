use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use btleplug::api::Manager as _;
use btleplug::platform::Manager as BtManager;
use clap::Parser;
use log::{LevelFilter, error, info};
use tokio::sync::{Notify, mpsc, watch};

mod advertisement;
mod beacon;
mod config;
mod distance;
mod heartbeat;
mod link;
mod manager;
mod messages;
mod mqtt;
mod power;
mod publisher;
mod scanner;
mod supervisor;
mod update;

const TICK: Duration = Duration::from_secs(1);
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(15);

/// BLE room presence node: scans for beacons and reports them over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level regardless of the configuration.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)
        .with_context(|| format!("parsing {}", args.config.display()))?;

    let mut logger = pretty_env_logger::formatted_timed_builder();
    logger.filter_level(if args.debug || config.node.debug() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    info!(
        "Starting {} in room {}",
        config.node.hostname, config.node.room
    );

    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config);
    info!("Reporting presence on {}", mqtt_client.topics().presence);

    let bt_manager = BtManager::new().await?;

    // get the first bluetooth adapter
    let central = bt_manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;

    let network = Arc::new(link::HostNetwork::new(&config));
    let (session_tx, session_rx) = mpsc::channel(8);
    let manager = manager::Manager::new(
        network.clone(),
        mqtt_client.clone(),
        session_tx,
        supervisor::RetryPolicy {
            max_retries: config.connectivity.max_retries(),
            suppress_restart: config.connectivity.suppress_restart(),
        },
        config.connectivity.retry_delay(),
    );
    let events = manager.events();
    let connection = manager.connection();

    tokio::spawn(mqtt::MqttClient::drive_session(
        eventloop,
        session_rx,
        events.clone(),
    ));
    tokio::spawn(link::watch_link(
        network,
        connection.clone(),
        events.clone(),
        config.network.probe_interval(),
    ));
    let update_events = events.clone();
    tokio::spawn(async move {
        if let Err(err) = update::listen_for_signals(update_events).await {
            error!("Update signals unavailable: {:#}", err);
        }
    });

    let watchdog = heartbeat::Watchdog::new(WATCHDOG_TIMEOUT);
    tokio::spawn(heartbeat::heartbeat(watchdog.clone(), TICK));

    let (inactive_tx, inactive_rx) = watch::channel(false);
    let wake = Arc::new(Notify::new());
    tokio::spawn(power::wake_after(
        inactive_rx,
        wake.clone(),
        config.power.sleep_duration(),
    ));

    let publisher = publisher::Publisher::new(
        mqtt_client,
        config.scan.max_distance(),
        config.scan.default_tx_power(),
        connection.clone(),
    );
    let sleep = config.power.enabled().then(|| {
        power::SleepPolicy::new(
            config.power.power_on_threshold(),
            tokio::time::Instant::now(),
        )
    });
    let scan_cycle = scanner::ScanCycle::new(
        scanner::BtleScanner::new(central),
        publisher,
        connection,
        scanner::CycleSettings {
            room: config.node.room.clone(),
            hostname: config.node.hostname.clone(),
            duration: config.scan.duration(),
            interval: config.scan.interval(),
            max_distance: config.scan.max_distance(),
            debug: config.node.debug(),
        },
        power::AnalogReadings::new(&config.power),
        sleep,
    );
    tokio::spawn(scan_cycle.run(TICK, inactive_tx, wake));

    tokio::select! {
        result = manager.run_loop() => result,
        result = heartbeat::monitor(watchdog) => result,
    }
}
