use std::path::PathBuf;
use std::time::Duration;

use serde_derive::Deserialize;

pub const DEFAULT_TX_POWER: i32 = -72;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub power: PowerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub hostname: String,
    pub room: String,
    pub debug: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct NetworkConfig {
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub probe_interval_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub channel: Option<String>,
    pub node_topic_prefix: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub duration_seconds: Option<u64>,
    pub interval_seconds: Option<u64>,
    /// Presence reports at or beyond this distance are dropped. `0` disables the filter.
    pub max_distance: Option<f64>,
    pub default_tx_power: Option<i32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ConnectivityConfig {
    /// Keep retrying forever instead of restarting once retries are exhausted.
    pub suppress_restart: Option<bool>,
    pub retry_delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PowerConfig {
    pub enabled: Option<bool>,
    pub voltage_path: Option<PathBuf>,
    pub power_path: Option<PathBuf>,
    pub power_on_threshold: Option<i32>,
    pub sleep_hours: Option<u64>,
}

impl NodeConfig {
    pub fn debug(&self) -> bool {
        self.debug.unwrap_or(false)
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds.unwrap_or(30))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.unwrap_or(10))
    }
}

impl MqttConfig {
    pub fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or("room_presence")
    }

    pub fn node_topic_prefix(&self) -> &str {
        self.node_topic_prefix.as_deref().unwrap_or("presence_nodes")
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds.unwrap_or(3))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(3))
    }

    pub fn max_distance(&self) -> f64 {
        self.max_distance.unwrap_or(0.0)
    }

    pub fn default_tx_power(&self) -> i32 {
        self.default_tx_power.unwrap_or(DEFAULT_TX_POWER)
    }
}

impl ConnectivityConfig {
    pub fn suppress_restart(&self) -> bool {
        self.suppress_restart.unwrap_or(false)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(2000))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(10)
    }
}

impl PowerConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn power_on_threshold(&self) -> i32 {
        self.power_on_threshold.unwrap_or(300)
    }

    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep_hours.unwrap_or(6) * 3600)
    }
}
