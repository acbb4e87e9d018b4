//! Classification of raw advertisements into the beacon formats the node understands.
//!
//! Eddystone frames arrive as service data under [`EDDYSTONE_SERVICE_ID`];
//! iBeacon frames arrive as Apple manufacturer data. Anything else, including
//! truncated frames, is treated as a generic advertiser.

use crate::advertisement::RawAdvertisement;

/// https://github.com/google/eddystone
pub const EDDYSTONE_SERVICE_ID: u16 = 0xFEAA;
/// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
pub const IBEACON_COMPANY_ID: u16 = 0x004C;

const EDDYSTONE_URL_FRAME: u8 = 0x10;
const EDDYSTONE_TLM_FRAME: u8 = 0x20;
const IBEACON_FRAME_LEN: usize = 25;
/// Eddystone tx power is calibrated at 0 m; signal loss over the first meter.
const EDDYSTONE_ONE_METER_LOSS: i32 = 41;

const URL_SCHEMES: [&str; 4] = ["http://www.", "https://www.", "http://", "https://"];
const URL_EXPANSIONS: [&str; 14] = [
    ".com/", ".org/", ".edu/", ".net/", ".info/", ".biz/", ".gov/", ".com", ".org", ".edu",
    ".net", ".info", ".biz", ".gov",
];

#[derive(Debug, Clone, PartialEq)]
pub enum BeaconRecord {
    IBeacon(IBeacon),
    /// `tx_power` is the received power at 0 m.
    EddystoneUrl { url: String, tx_power: i8 },
    /// Telemetry-only frame; never reported as presence.
    EddystoneTlm(EddystoneTelemetry),
    Generic { tx_power: Option<i16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IBeacon {
    pub proximity_id: [u8; 16],
    pub major: u16,
    pub minor: u16,
    /// Calibrated RSSI at one meter.
    pub tx_power: i8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EddystoneTelemetry {
    pub version: u8,
    pub battery_mv: u16,
    /// Degrees Celsius, decoded from 8.8 fixed point.
    pub temperature: f32,
    pub adv_count: u32,
    /// Time since power-up in 0.1 s units.
    pub uptime: u32,
}

impl BeaconRecord {
    /// Expected RSSI at one meter carried by the advertisement itself, if any.
    /// Eddystone advertises its 0 m power, so it is shifted to the 1 m
    /// reference the distance curve expects.
    pub fn reference_power(&self) -> Option<i32> {
        match self {
            BeaconRecord::IBeacon(beacon) => Some(beacon.tx_power as i32),
            BeaconRecord::EddystoneUrl { tx_power, .. } => {
                Some(*tx_power as i32 - EDDYSTONE_ONE_METER_LOSS)
            }
            BeaconRecord::EddystoneTlm(_) => None,
            BeaconRecord::Generic { tx_power } => tx_power.map(i32::from),
        }
    }
}

impl IBeacon {
    /// Proximity identifier in advertised byte order, undashed.
    pub fn proximity_id_string(&self) -> String {
        let canonical = canonical_uuid_string(&self.proximity_id);
        let digits = canonical.as_bytes();
        let mut out = String::with_capacity(32);

        let mut i = digits.len();
        while i >= 2 {
            if digits[i - 1] == b'-' {
                i -= 1;
            }
            out.push(digits[i - 2] as char);
            out.push(digits[i - 1] as char);
            i -= 2;
        }
        out
    }

    /// Stable identifier for the beacon: `{proximity id}-{major}-{minor}`.
    pub fn identifier(&self) -> String {
        format!(
            "{}-{}-{}",
            self.proximity_id_string(),
            self.major,
            self.minor
        )
    }
}

/// Dashed 8-4-4-4-12 rendering. The radio stack stores 128-bit ids
/// little-endian, so the canonical form reads the bytes back to front.
pub fn canonical_uuid_string(id: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (n, byte) in id.iter().rev().enumerate() {
        if matches!(n, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

pub fn decode(adv: &RawAdvertisement) -> BeaconRecord {
    if let Some(service) = adv
        .service_data
        .as_ref()
        .filter(|s| s.service_id == EDDYSTONE_SERVICE_ID)
    {
        let frame = match service.payload.first() {
            Some(&EDDYSTONE_URL_FRAME) => decode_eddystone_url(&service.payload),
            Some(&EDDYSTONE_TLM_FRAME) => decode_eddystone_tlm(&service.payload),
            _ => None,
        };
        return frame.unwrap_or(BeaconRecord::Generic {
            tx_power: adv.tx_power,
        });
    }

    if let Some(beacon) = adv.manufacturer_data.as_deref().and_then(decode_ibeacon) {
        return BeaconRecord::IBeacon(beacon);
    }

    BeaconRecord::Generic {
        tx_power: adv.tx_power,
    }
}

fn decode_ibeacon(data: &[u8]) -> Option<IBeacon> {
    if data.len() != IBEACON_FRAME_LEN || data[..2] != IBEACON_COMPANY_ID.to_le_bytes() {
        return None;
    }

    // company(2) type(1) length(1) proximity id(16) major(2) minor(2) power(1)
    let proximity_id: [u8; 16] = data.get(4..20)?.try_into().ok()?;
    let major = read_u16_le(data, 20)?.swap_bytes();
    let minor = read_u16_le(data, 22)?.swap_bytes();
    let tx_power = *data.get(24)? as i8;

    Some(IBeacon {
        proximity_id,
        major,
        minor,
        tx_power,
    })
}

fn decode_eddystone_url(frame: &[u8]) -> Option<BeaconRecord> {
    let tx_power = *frame.get(1)? as i8;
    let scheme = *frame.get(2)?;

    let mut url = URL_SCHEMES
        .get(scheme as usize)
        .copied()
        .unwrap_or_default()
        .to_string();
    for &byte in &frame[3..] {
        if let Some(expansion) = URL_EXPANSIONS.get(byte as usize) {
            url.push_str(expansion);
        } else if byte.is_ascii_graphic() {
            url.push(byte as char);
        }
    }

    Some(BeaconRecord::EddystoneUrl { url, tx_power })
}

fn decode_eddystone_tlm(frame: &[u8]) -> Option<BeaconRecord> {
    let version = *frame.get(1)?;
    let battery_mv = u16::from_be_bytes(frame.get(2..4)?.try_into().ok()?);
    let temperature = i16::from_be_bytes(frame.get(4..6)?.try_into().ok()?) as f32 / 256.0;
    let adv_count = u32::from_be_bytes(frame.get(6..10)?.try_into().ok()?);
    let uptime = u32::from_be_bytes(frame.get(10..14)?.try_into().ok()?);

    Some(BeaconRecord::EddystoneTlm(EddystoneTelemetry {
        version,
        battery_mv,
        temperature,
        adv_count,
        uptime,
    }))
}

fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}
