use btleplug::api::PeripheralProperties;
use btleplug::api::bleuuid::BleUuid as _;
use mac_address::MacAddress;

use crate::beacon::{EDDYSTONE_SERVICE_ID, IBEACON_COMPANY_ID};

/// Service data block tagged with its 16-bit service identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub service_id: u16,
    pub payload: Vec<u8>,
}

/// One advertisement event as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub address: MacAddress,
    pub rssi: i16,
    pub name: Option<String>,
    pub tx_power: Option<i16>,
    pub service_data: Option<ServiceData>,
    /// Manufacturer specific data, including the little-endian company id.
    pub manufacturer_data: Option<Vec<u8>>,
}

impl RawAdvertisement {
    #[cfg(test)]
    pub fn new(address: MacAddress, rssi: i16) -> Self {
        RawAdvertisement {
            address,
            rssi,
            name: None,
            tx_power: None,
            service_data: None,
            manufacturer_data: None,
        }
    }

    /// Lowercase address without separators, e.g. `aabbccddeeff`.
    pub fn address_id(&self) -> String {
        self.address
            .bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl From<PeripheralProperties> for RawAdvertisement {
    fn from(properties: PeripheralProperties) -> Self {
        let address = MacAddress::new(properties.address.into_inner());

        // BlueZ splits manufacturer data by company; prefer the iBeacon vendor,
        // otherwise take the lowest company id.
        let manufacturer_data = properties
            .manufacturer_data
            .get(&IBEACON_COMPANY_ID)
            .map(|payload| (IBEACON_COMPANY_ID, payload))
            .or_else(|| {
                properties
                    .manufacturer_data
                    .iter()
                    .min_by_key(|(company, _)| **company)
                    .map(|(company, payload)| (*company, payload))
            })
            .map(|(company, payload)| {
                let mut data = company.to_le_bytes().to_vec();
                data.extend_from_slice(payload);
                data
            });

        let mut tagged: Vec<ServiceData> = properties
            .service_data
            .iter()
            .filter_map(|(uuid, payload)| {
                uuid.to_ble_u16().map(|service_id| ServiceData {
                    service_id,
                    payload: payload.clone(),
                })
            })
            .collect();
        tagged.sort_by_key(|s| (s.service_id != EDDYSTONE_SERVICE_ID, s.service_id));

        RawAdvertisement {
            address,
            rssi: properties.rssi.unwrap_or(0),
            name: properties.local_name,
            tx_power: properties.tx_power_level,
            service_data: tagged.into_iter().next(),
            manufacturer_data,
        }
    }
}
