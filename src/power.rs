use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::config::PowerConfig;

const CONNECTED_GRACE: Duration = Duration::from_secs(60);
const DISCONNECTED_GRACE: Duration = Duration::from_secs(120);

/// Integer reading from a sysfs-style file, e.g. an IIO `in_voltage0_raw`.
#[derive(Debug, Clone)]
pub struct AnalogInput {
    path: PathBuf,
}

impl AnalogInput {
    pub fn new(path: PathBuf) -> Self {
        AnalogInput { path }
    }

    pub fn read(&self) -> Option<i32> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("Error reading {}: {}", self.path.display(), err);
                return None;
            }
        };
        contents.trim().parse().ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalogReadings {
    pub voltage: Option<AnalogInput>,
    pub power: Option<AnalogInput>,
}

impl AnalogReadings {
    pub fn new(config: &PowerConfig) -> Self {
        AnalogReadings {
            voltage: config.voltage_path.clone().map(AnalogInput::new),
            power: config.power_path.clone().map(AnalogInput::new),
        }
    }

    pub fn voltage(&self) -> Option<i32> {
        self.voltage.as_ref().and_then(AnalogInput::read)
    }

    pub fn power_on(&self) -> Option<i32> {
        self.power.as_ref().and_then(AnalogInput::read)
    }
}

/// Decides when a node on external power loss should go inactive.
#[derive(Debug, Clone)]
pub struct SleepPolicy {
    threshold: i32,
    last_active: Instant,
}

impl SleepPolicy {
    pub fn new(threshold: i32, now: Instant) -> Self {
        SleepPolicy {
            threshold,
            last_active: now,
        }
    }

    /// Returns true when the node should announce itself as sleeping.
    pub fn should_sleep(
        &mut self,
        now: Instant,
        power_on: Option<i32>,
        update_in_progress: bool,
        connected: bool,
    ) -> bool {
        let powered = power_on.is_none_or(|level| level >= self.threshold);
        if powered || update_in_progress {
            self.last_active = now;
            return false;
        }

        let idle = now.duration_since(self.last_active);
        (idle > CONNECTED_GRACE && connected) || idle > DISCONNECTED_GRACE
    }

    pub fn wake(&mut self, now: Instant) {
        self.last_active = now;
    }
}

/// External wake trigger: once the node reports itself inactive, wake it
/// again after `sleep_for`.
pub async fn wake_after(
    mut inactive: watch::Receiver<bool>,
    wake: Arc<Notify>,
    sleep_for: Duration,
) {
    while inactive.changed().await.is_ok() {
        if !*inactive.borrow_and_update() {
            continue;
        }
        info!("Node inactive, waking in {:?}", sleep_for);
        tokio::time::sleep(sleep_for).await;
        wake.notify_one();
    }
}
