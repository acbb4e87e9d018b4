use log::{debug, warn};
use tokio::sync::watch;

use crate::advertisement::RawAdvertisement;
use crate::beacon::BeaconRecord;
use crate::distance;
use crate::messages::PresenceReport;
use crate::mqtt::Uplink;
use crate::supervisor::ConnectionState;

/// Builds the presence report for a decoded advertisement. Telemetry-only
/// frames have no presence report.
pub fn build_report(
    record: &BeaconRecord,
    advertisement: &RawAdvertisement,
    default_tx_power: i32,
) -> Option<PresenceReport> {
    let address_id = advertisement.address_id();
    let rssi = advertisement.rssi;
    let distance = distance::estimate(rssi as i32, record.reference_power(), default_tx_power);

    let mut report = PresenceReport {
        id: address_id.clone(),
        uuid: address_id,
        rssi,
        name: advertisement.name.clone(),
        major: None,
        minor: None,
        tx_power: record.reference_power(),
        distance,
        url: None,
    };

    match record {
        BeaconRecord::IBeacon(beacon) => {
            report.id = beacon.identifier();
            report.uuid = beacon.proximity_id_string();
            report.major = Some(beacon.major);
            report.minor = Some(beacon.minor);
        }
        BeaconRecord::EddystoneUrl { url, .. } => report.url = Some(url.clone()),
        BeaconRecord::EddystoneTlm(_) => return None,
        BeaconRecord::Generic { .. } => {}
    }

    Some(report)
}

/// Distance filter in front of the uplink. Best effort: a report that cannot
/// be sent right now is dropped.
pub struct Publisher<U> {
    uplink: U,
    max_distance: f64,
    default_tx_power: i32,
    connection: watch::Receiver<ConnectionState>,
}

impl<U: Uplink> Publisher<U> {
    pub fn new(
        uplink: U,
        max_distance: f64,
        default_tx_power: i32,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Publisher {
            uplink,
            max_distance,
            default_tx_power,
            connection,
        }
    }

    pub fn uplink(&self) -> &U {
        &self.uplink
    }

    pub fn session_up(&self) -> bool {
        self.connection.borrow().session_up()
    }

    pub fn accepts(&self, distance: f64) -> bool {
        self.max_distance == 0.0 || distance < self.max_distance
    }

    /// Returns true when the report was handed to the uplink.
    pub fn publish(&self, record: &BeaconRecord, advertisement: &RawAdvertisement) -> bool {
        let Some(report) = build_report(record, advertisement, self.default_tx_power) else {
            return false;
        };

        if !self.accepts(report.distance) {
            debug!(
                "{} exceeded distance threshold {:.2}",
                report.id, report.distance
            );
            return false;
        }

        if !self.session_up() {
            debug!("Session down, dropping report for {}", report.id);
            return false;
        }

        match self.uplink.publish_presence(&report) {
            Ok(()) => true,
            Err(err) => {
                warn!("Error sending report for {}: {:?}", report.id, err);
                false
            }
        }
    }
}
