use serde_derive::Serialize;

/// Presence record published on the room channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PresenceReport {
    pub id: String,
    pub uuid: String,
    pub rssi: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<u16>,
    #[serde(rename = "txPower", skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i32>,
    pub distance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Per-cycle node telemetry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Telemetry {
    pub room: String,
    pub ip: String,
    pub hostname: String,
    pub scan_dur: u64,
    pub wait_dur: u64,
    pub max_dist: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disc_ct: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rept_ct: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_ct: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_on: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    Connected,
    Disconnected,
    Sleeping,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Connected => "CONNECTED",
            Availability::Disconnected => "DISCONNECTED",
            Availability::Sleeping => "SLEEPING",
        }
    }
}
