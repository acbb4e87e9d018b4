use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Central as _, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::PeripheralId;
use futures::{Stream, StreamExt as _, future};
use log::{debug, error, info, warn};
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::advertisement::RawAdvertisement;
use crate::beacon::{self, BeaconRecord};
use crate::messages::{Availability, Telemetry};
use crate::mqtt::Uplink;
use crate::power::{AnalogReadings, SleepPolicy};
use crate::publisher::Publisher;
use crate::supervisor::ConnectionState;

/// Produces the advertisements heard during one scan window, in discovery order.
pub trait AdvertisementSource {
    fn scan(
        &mut self,
        duration: Duration,
        connection: watch::Receiver<ConnectionState>,
    ) -> impl Future<Output = anyhow::Result<Vec<RawAdvertisement>>> + Send;
}

pub struct BtleScanner {
    adapter: btleplug::platform::Adapter,
}

impl BtleScanner {
    pub fn new(adapter: btleplug::platform::Adapter) -> Self {
        BtleScanner { adapter }
    }
}

impl AdvertisementSource for BtleScanner {
    async fn scan(
        &mut self,
        duration: Duration,
        connection: watch::Receiver<ConnectionState>,
    ) -> anyhow::Result<Vec<RawAdvertisement>> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let ids = events.filter_map(|event| future::ready(discovered_id(event)));
        let seen = collect_until(duration, connection, ids).await;
        self.adapter.stop_scan().await?;

        let adapter = &self.adapter;
        let advertisements = resolve_all(seen, |id| read_properties(adapter, id)).await;
        Ok(advertisements)
    }
}

async fn read_properties(
    adapter: &btleplug::platform::Adapter,
    id: PeripheralId,
) -> anyhow::Result<Option<RawAdvertisement>> {
    let peripheral = adapter.peripheral(&id).await?;
    Ok(peripheral.properties().await?.map(RawAdvertisement::from))
}

/// Looks up each id in order. A peripheral that vanished or cannot be read
/// is skipped; the rest of the batch is kept.
async fn resolve_all<T, F, Fut>(ids: Vec<T>, mut lookup: F) -> Vec<RawAdvertisement>
where
    T: Clone + fmt::Debug,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = anyhow::Result<Option<RawAdvertisement>>>,
{
    let mut advertisements = Vec::with_capacity(ids.len());
    for id in ids {
        match lookup(id.clone()).await {
            Ok(Some(advertisement)) => advertisements.push(advertisement),
            Ok(None) => debug!("Peripheral {:?} has no properties", id),
            Err(err) => debug!("Skipping peripheral {:?}: {:#}", id, err),
        }
    }
    advertisements
}

fn discovered_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

/// Collects distinct ids in discovery order until the window closes, the
/// stream ends, or an update starts.
async fn collect_until<T, St>(
    duration: Duration,
    mut connection: watch::Receiver<ConnectionState>,
    ids: St,
) -> Vec<T>
where
    T: PartialEq,
    St: Stream<Item = T>,
{
    let mut seen = Vec::new();
    let window = tokio::time::sleep(duration);
    tokio::pin!(window);
    tokio::pin!(ids);

    loop {
        tokio::select! {
            _ = &mut window => break,
            changed = connection.changed() => {
                if changed.is_err() || connection.borrow_and_update().update_in_progress {
                    info!("Scan cancelled");
                    break;
                }
            }
            id = ids.next() => match id {
                Some(id) => {
                    if !seen.contains(&id) {
                        seen.push(id);
                    }
                }
                None => {
                    warn!("Adapter event stream closed");
                    break;
                }
            }
        }
    }
    seen
}

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub room: String,
    pub hostname: String,
    pub duration: Duration,
    pub interval: Duration,
    pub max_distance: f64,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not due yet.
    Idle,
    /// Due, but an update is running.
    Skipped,
    Completed { discovered: u32, reported: u32 },
    Inactive,
}

/// Periodic scan driver: one scan per interval, every advertisement decoded
/// and published, followed by one telemetry summary.
pub struct ScanCycle<S, U> {
    source: S,
    publisher: Publisher<U>,
    connection: watch::Receiver<ConnectionState>,
    settings: CycleSettings,
    analog: AnalogReadings,
    sleep: Option<SleepPolicy>,
    last_cycle: Option<Instant>,
    power_on: Option<i32>,
    voltage_sum: i64,
    voltage_samples: u32,
    loop_count: u32,
}

impl<S: AdvertisementSource, U: Uplink> ScanCycle<S, U> {
    pub fn new(
        source: S,
        publisher: Publisher<U>,
        connection: watch::Receiver<ConnectionState>,
        settings: CycleSettings,
        analog: AnalogReadings,
        sleep: Option<SleepPolicy>,
    ) -> Self {
        ScanCycle {
            source,
            publisher,
            connection,
            settings,
            analog,
            sleep,
            last_cycle: None,
            power_on: None,
            voltage_sum: 0,
            voltage_samples: 0,
            loop_count: 0,
        }
    }

    pub async fn run(
        mut self,
        every: Duration,
        inactive: watch::Sender<bool>,
        wake: Arc<Notify>,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.tick(Instant::now()).await == TickOutcome::Inactive {
                inactive.send_replace(true);
                wake.notified().await;
                info!("Waking up");
                inactive.send_replace(false);
                if let Some(policy) = self.sleep.as_mut() {
                    policy.wake(Instant::now());
                }
                ticker.reset();
            }
        }
    }

    pub async fn tick(&mut self, now: Instant) -> TickOutcome {
        if let Some(voltage) = self.analog.voltage() {
            self.voltage_sum += voltage as i64;
            self.voltage_samples += 1;
        }
        self.loop_count += 1;

        let due = self
            .last_cycle
            .is_none_or(|last| now.duration_since(last) >= self.settings.interval);

        let mut outcome = TickOutcome::Idle;
        if due {
            let update_in_progress = self.connection.borrow().update_in_progress;
            if update_in_progress {
                debug!("Update in progress, skipping scan");
                outcome = TickOutcome::Skipped;
            } else {
                let (discovered, reported) = self.cycle().await;
                self.last_cycle = Some(now);
                outcome = TickOutcome::Completed {
                    discovered,
                    reported,
                };
            }
        }

        if self.going_inactive(now) {
            return TickOutcome::Inactive;
        }
        outcome
    }

    async fn cycle(&mut self) -> (u32, u32) {
        self.power_on = self.analog.power_on();
        let voltage = (self.voltage_samples > 0)
            .then(|| (self.voltage_sum / self.voltage_samples as i64) as i32);

        self.publish_debug("scan start");
        info!("Scanning...");
        let advertisements = match self
            .source
            .scan(self.settings.duration, self.connection.clone())
            .await
        {
            Ok(advertisements) => advertisements,
            Err(err) => {
                error!("Error scanning: {:#}", err);
                Vec::new()
            }
        };
        let discovered = advertisements.len() as u32;
        info!("Scan done! Devices found: {}", discovered);

        let mut reported = 0;
        for advertisement in &advertisements {
            let record = beacon::decode(advertisement);
            if let BeaconRecord::EddystoneTlm(tlm) = &record {
                debug!(
                    "{} telemetry v{}: battery {} mV, {:.1} C, {} adverts, up {} s",
                    advertisement.address_id(),
                    tlm.version,
                    tlm.battery_mv,
                    tlm.temperature,
                    tlm.adv_count,
                    tlm.uptime / 10
                );
            }
            if self.publisher.publish(&record, advertisement) {
                reported += 1;
            }
        }
        self.publish_debug("scan end");

        let telemetry = Telemetry {
            room: self.settings.room.clone(),
            ip: self
                .connection
                .borrow()
                .local_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            hostname: self.settings.hostname.clone(),
            scan_dur: self.settings.duration.as_secs(),
            wait_dur: self.settings.interval.as_secs(),
            max_dist: self.settings.max_distance,
            disc_ct: Some(discovered),
            rept_ct: Some(reported),
            voltage,
            loop_ct: Some(self.loop_count),
            power_on: self.power_on,
        };
        if self.publisher.session_up() {
            match self.publisher.uplink().publish_telemetry(&telemetry) {
                Ok(()) => debug!("Telemetry sent"),
                Err(err) => {
                    warn!("Error sending telemetry: {:?}", err);
                    if let Err(err) = self.publisher.uplink().publish_error("Error sending telemetry") {
                        debug!("Error reporting telemetry failure: {:?}", err);
                    }
                }
            }
        } else {
            debug!("Session down, skipping telemetry");
        }

        self.voltage_sum = 0;
        self.voltage_samples = 0;
        self.loop_count = 0;

        (discovered, reported)
    }

    fn going_inactive(&mut self, now: Instant) -> bool {
        let Some(policy) = self.sleep.as_mut() else {
            return false;
        };
        let (update_in_progress, connected) = {
            let state = self.connection.borrow();
            (state.update_in_progress, state.session_up())
        };
        if !policy.should_sleep(now, self.power_on, update_in_progress, connected) {
            return false;
        }

        info!("Going inactive");
        if connected {
            if let Err(err) = self.publisher.uplink().publish_availability(Availability::Sleeping) {
                warn!("Error announcing sleep: {:?}", err);
            }
        }
        true
    }

    fn publish_debug(&self, message: &str) {
        if self.settings.debug && self.publisher.session_up() {
            if let Err(err) = self.publisher.uplink().publish_debug(message) {
                debug!("Error sending debug message: {:?}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mac_address::MacAddress;

    use super::*;
    use crate::advertisement::ServiceData;
    use crate::beacon::EDDYSTONE_SERVICE_ID;
    use crate::power::AnalogInput;
    use crate::publisher::tests::{RecordingUplink, session_state};

    struct FixedSource {
        batch: Vec<RawAdvertisement>,
        scans: u32,
    }

    impl AdvertisementSource for FixedSource {
        async fn scan(
            &mut self,
            _duration: Duration,
            _connection: watch::Receiver<ConnectionState>,
        ) -> anyhow::Result<Vec<RawAdvertisement>> {
            self.scans += 1;
            Ok(self.batch.clone())
        }
    }

    fn advertisement(last: u8, rssi: i16) -> RawAdvertisement {
        RawAdvertisement::new(MacAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, last]), rssi)
    }

    fn settings(debug: bool) -> CycleSettings {
        CycleSettings {
            room: "office".to_string(),
            hostname: "node-office".to_string(),
            duration: Duration::from_secs(3),
            interval: Duration::from_secs(10),
            max_distance: 2.0,
            debug,
        }
    }

    fn cycle(
        state: ConnectionState,
        sleep: Option<SleepPolicy>,
    ) -> (
        ScanCycle<FixedSource, RecordingUplink>,
        RecordingUplink,
        watch::Sender<ConnectionState>,
    ) {
        let uplink = RecordingUplink::default();
        let (tx, rx) = watch::channel(state);
        let source = FixedSource {
            // -65 is close enough, -90 is far beyond 2 m.
            batch: vec![advertisement(1, -65), advertisement(2, -90), advertisement(3, -60)],
            scans: 0,
        };
        let publisher = Publisher::new(uplink.clone(), 2.0, -72, rx.clone());
        let cycle = ScanCycle::new(
            source,
            publisher,
            rx,
            settings(true),
            AnalogReadings::default(),
            sleep,
        );
        (cycle, uplink, tx)
    }

    #[tokio::test]
    async fn test_cycle_reports_and_publishes_telemetry() {
        let (mut cycle, uplink, _tx) = cycle(session_state(true), None);

        let outcome = cycle.tick(Instant::now()).await;
        assert_eq!(
            outcome,
            TickOutcome::Completed {
                discovered: 3,
                reported: 2
            }
        );

        let reports = uplink.presence.lock().unwrap();
        let ids: Vec<&str> = reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["102030405001", "102030405003"]);

        let telemetry = uplink.telemetry.lock().unwrap();
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].disc_ct, Some(3));
        assert_eq!(telemetry[0].rept_ct, Some(2));
        assert_eq!(telemetry[0].loop_ct, Some(1));
        assert_eq!(telemetry[0].voltage, None);
        assert_eq!(telemetry[0].room, "office");

        assert_eq!(
            *uplink.debug.lock().unwrap(),
            vec!["scan start".to_string(), "scan end".to_string()]
        );
    }

    #[tokio::test]
    async fn test_waits_for_interval_and_counts_loops() {
        let (mut cycle, uplink, _tx) = cycle(session_state(true), None);
        let start = Instant::now();

        cycle.tick(start).await;
        assert_eq!(cycle.tick(start + Duration::from_secs(4)).await, TickOutcome::Idle);
        assert_eq!(cycle.tick(start + Duration::from_secs(8)).await, TickOutcome::Idle);
        assert!(matches!(
            cycle.tick(start + Duration::from_secs(10)).await,
            TickOutcome::Completed { .. }
        ));

        assert_eq!(cycle.source.scans, 2);
        let telemetry = uplink.telemetry.lock().unwrap();
        assert_eq!(telemetry[1].loop_ct, Some(3));
    }

    #[tokio::test]
    async fn test_update_skips_cycle() {
        let mut state = session_state(true);
        state.update_in_progress = true;
        let (mut cycle, uplink, _tx) = cycle(state, None);

        assert_eq!(cycle.tick(Instant::now()).await, TickOutcome::Skipped);
        assert_eq!(cycle.source.scans, 0);
        assert!(uplink.telemetry.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_down_skips_publishing() {
        let (mut cycle, uplink, _tx) = cycle(session_state(false), None);

        assert_eq!(
            cycle.tick(Instant::now()).await,
            TickOutcome::Completed {
                discovered: 3,
                reported: 0
            }
        );
        assert!(uplink.presence.lock().unwrap().is_empty());
        assert!(uplink.telemetry.lock().unwrap().is_empty());
        assert_eq!(cycle.loop_count, 0);
    }

    #[tokio::test]
    async fn test_goes_inactive_on_low_power() {
        let path = std::env::temp_dir().join(format!("room-presence-power-{}", std::process::id()));
        std::fs::write(&path, "12\n").unwrap();

        let start = Instant::now();
        let (mut cycle, uplink, _tx) = cycle(session_state(true), Some(SleepPolicy::new(300, start)));
        cycle.analog.power = Some(AnalogInput::new(path.clone()));

        assert!(matches!(cycle.tick(start).await, TickOutcome::Completed { .. }));
        assert_eq!(cycle.power_on, Some(12));
        assert_eq!(
            cycle.tick(start + Duration::from_secs(61)).await,
            TickOutcome::Inactive
        );
        assert_eq!(
            *uplink.availability.lock().unwrap(),
            vec![Availability::Sleeping]
        );
        assert_eq!(uplink.telemetry.lock().unwrap()[1].power_on, Some(12));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_ends_scan_window_early() {
        let (ids_tx, ids_rx) = futures::channel::mpsc::unbounded();
        let (state_tx, state_rx) = watch::channel(session_state(true));
        for id in [7, 3, 7] {
            ids_tx.unbounded_send(id).unwrap();
        }
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            state_tx.send_modify(|state| state.update_in_progress = true);
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop((state_tx, ids_tx));
        });

        let started = Instant::now();
        let seen = collect_until(Duration::from_secs(10), state_rx, ids_rx).await;
        assert_eq!(seen, vec![7, 3]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_window_runs_to_completion() {
        let (ids_tx, ids_rx) = futures::channel::mpsc::unbounded();
        let (state_tx, state_rx) = watch::channel(session_state(true));
        ids_tx.unbounded_send(1).unwrap();
        ids_tx.unbounded_send(2).unwrap();

        let started = Instant::now();
        let seen = collect_until(Duration::from_secs(3), state_rx, ids_rx).await;
        assert_eq!(seen, vec![1, 2]);
        assert!(started.elapsed() >= Duration::from_secs(3));
        drop((state_tx, ids_tx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_count_restarts_after_wake() {
        let path = std::env::temp_dir().join(format!("room-presence-wake-{}", std::process::id()));
        std::fs::write(&path, "12\n").unwrap();

        let (mut cycle, uplink, _tx) = cycle(
            session_state(true),
            Some(SleepPolicy::new(300, Instant::now())),
        );
        cycle.analog.power = Some(AnalogInput::new(path.clone()));
        let (inactive_tx, mut inactive_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        tokio::spawn(cycle.run(Duration::from_secs(1), inactive_tx, wake.clone()));

        inactive_rx.wait_for(|inactive| *inactive).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6 * 3600)).await;
        let before = uplink.telemetry.lock().unwrap().len();

        wake.notify_one();
        inactive_rx.wait_for(|inactive| !*inactive).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        let telemetry = uplink.telemetry.lock().unwrap();
        assert_eq!(telemetry.len(), before + 2);
        // One tick before sleeping plus the first tick after waking.
        assert_eq!(telemetry[before].loop_ct, Some(2));
        assert_eq!(telemetry[before + 1].loop_ct, Some(10));
        drop(telemetry);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_peripheral_keeps_rest_of_batch() {
        let advertisements = resolve_all(vec![1u8, 2, 3, 4], |id| async move {
            let result: anyhow::Result<Option<RawAdvertisement>> = match id {
                2 => Err(anyhow::anyhow!("org.bluez.Error.NotReady")),
                3 => Ok(None),
                _ => Ok(Some(advertisement(id, -60))),
            };
            result
        })
        .await;

        let ids: Vec<String> = advertisements.iter().map(|a| a.address_id()).collect();
        assert_eq!(ids, vec!["102030405001", "102030405004"]);
    }

    #[tokio::test]
    async fn test_telemetry_frames_are_discovered_but_not_reported() {
        let (mut cycle, uplink, _tx) = cycle(session_state(true), None);
        let mut tlm = advertisement(9, -50);
        tlm.service_data = Some(ServiceData {
            service_id: EDDYSTONE_SERVICE_ID,
            payload: vec![
                0x20, 0x00, 0x0B, 0xB8, 0x17, 0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x0A,
            ],
        });
        cycle.source.batch = vec![tlm];

        assert_eq!(
            cycle.tick(Instant::now()).await,
            TickOutcome::Completed {
                discovered: 1,
                reported: 0
            }
        );
        assert!(uplink.presence.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_telemetry_is_reported_on_error_topic() {
        let (mut cycle, uplink, _tx) = cycle(session_state(true), None);
        cycle.publisher = Publisher::new(
            RecordingUplink {
                reject_telemetry: true,
                ..uplink.clone()
            },
            2.0,
            -72,
            cycle.connection.clone(),
        );

        assert!(matches!(
            cycle.tick(Instant::now()).await,
            TickOutcome::Completed { .. }
        ));
        assert!(uplink.telemetry.lock().unwrap().is_empty());
        assert_eq!(
            *uplink.errors.lock().unwrap(),
            vec!["Error sending telemetry".to_string()]
        );
        assert_eq!(cycle.loop_count, 0);
    }
}
