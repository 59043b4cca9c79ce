//! What the dashboard knows besides relay output state

use crate::protocol::{Configuration, OnlineStatus, SwitchPress};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Health of the relay/switch fleet as last reported by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetStatus {
    pub online_relays: BTreeSet<String>,
    pub online_switches: BTreeSet<String>,
    /// device id → firmware is current
    pub up_to_date: BTreeMap<String, bool>,
    pub root_id: Option<String>,
    /// device id → signal strength in dBm
    pub rssi: BTreeMap<String, f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FleetStatus {
    pub fn from_report(status: OnlineStatus, received_at: DateTime<Utc>) -> Self {
        Self {
            online_relays: status.online_relays.into_iter().collect(),
            online_switches: status.online_switches.into_iter().collect(),
            up_to_date: status.up_to_date_devices,
            root_id: status.root_id,
            rssi: status.devices_rssi,
            updated_at: Some(received_at),
        }
    }

    pub fn is_online(&self, device: &str) -> bool {
        self.online_relays.contains(device) || self.online_switches.contains(device)
    }

    /// Devices reporting outdated firmware
    pub fn outdated(&self) -> impl Iterator<Item = &str> {
        self.up_to_date
            .iter()
            .filter(|(_, current)| !**current)
            .map(|(device, _)| device.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardState {
    pub connected: bool,
    #[serde(skip)]
    pub configuration: Option<Configuration>,
    /// The server announced a configuration change not yet reloaded
    pub configuration_stale: bool,
    pub fleet: FleetStatus,
    /// blind id → slider value
    pub blind_sliders: BTreeMap<String, u16>,
    /// switch id → last pressed button
    pub last_switch_press: BTreeMap<String, String>,
    /// Latest value of every telemetry field
    pub telemetry: Map<String, Value>,
    pub telemetry_updated: Option<DateTime<Utc>>,
}

impl DashboardState {
    pub fn record_switch_press(&mut self, press: &SwitchPress) {
        self.last_switch_press
            .insert(press.switch_id.clone(), press.button_id.clone());
    }

    pub fn merge_telemetry(&mut self, record: &Map<String, Value>, received_at: DateTime<Utc>) {
        for (field, value) in record {
            self.telemetry.insert(field.clone(), value.clone());
        }
        self.telemetry_updated = Some(received_at);
    }
}
