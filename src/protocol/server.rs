//! Server → client frames
//!
//! The backend mixes two styles: management channels tag every frame with a
//! `type` field, while the blinds and heating channels push bare state
//! objects. [`ServerMessage::decode`] dispatches on `type` when present and
//! otherwise recognises the bare shapes by their fields.

use super::target::{OutputState, TargetKey};
use super::{deserialize_id, deserialize_id_list, deserialize_optional_id};
use crate::error::{Result, SessionError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Authoritative state of one relay output
    LightState(LightState),
    /// Output names and sections
    Configuration(Configuration),
    /// Device fleet health
    OnlineStatus(OnlineStatus),
    /// A physical switch button was pressed
    SwitchState(SwitchPress),
    /// Server-side configuration changed; reload it
    Update,
    /// Current blind position
    BlindPosition(BlindPosition),
    /// Untyped state record (heating telemetry)
    StateRecord(Map<String, Value>),
}

impl ServerMessage {
    /// Decode a text frame. Anything that does not match a known shape is
    /// rejected with [`SessionError::MalformedMessage`].
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SessionError::malformed(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(SessionError::malformed(format!(
                    "expected a JSON object, got {}",
                    kind_of(&other)
                )))
            }
        };

        match map.get("type") {
            Some(Value::String(kind)) => {
                let kind = kind.clone();
                Self::from_tagged(&kind, map)
            }
            Some(other) => Err(SessionError::malformed(format!(
                "message type must be a string, got {}",
                kind_of(other)
            ))),
            None => Self::from_untagged(map),
        }
    }

    fn from_tagged(kind: &str, map: Map<String, Value>) -> Result<Self> {
        match kind {
            "light_state" => decode_fields(kind, map).map(ServerMessage::LightState),
            "configuration" => decode_fields(kind, map).map(ServerMessage::Configuration),
            "online_status" => decode_fields(kind, map).map(ServerMessage::OnlineStatus),
            "switch_state" => decode_fields(kind, map).map(ServerMessage::SwitchState),
            "update" => Ok(ServerMessage::Update),
            other => Err(SessionError::malformed(format!(
                "unknown message type '{other}'"
            ))),
        }
    }

    fn from_untagged(map: Map<String, Value>) -> Result<Self> {
        if map.contains_key("relay_id") && map.contains_key("output_id") {
            return decode_fields("light state", map).map(ServerMessage::LightState);
        }
        if map.contains_key("blind") && map.contains_key("current_position") {
            return decode_fields("blind position", map).map(ServerMessage::BlindPosition);
        }
        Ok(ServerMessage::StateRecord(map))
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::LightState(_) => "light_state",
            ServerMessage::Configuration(_) => "configuration",
            ServerMessage::OnlineStatus(_) => "online_status",
            ServerMessage::SwitchState(_) => "switch_state",
            ServerMessage::Update => "update",
            ServerMessage::BlindPosition(_) => "blind_position",
            ServerMessage::StateRecord(_) => "state_record",
        }
    }
}

fn decode_fields<T: DeserializeOwned>(kind: &str, map: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| SessionError::malformed(format!("bad {kind} message: {e}")))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LightState {
    #[serde(deserialize_with = "deserialize_id")]
    pub relay_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub output_id: String,
    pub state: OutputState,
}

impl LightState {
    pub fn target(&self) -> Result<TargetKey> {
        TargetKey::new(self.relay_id.as_str(), self.output_id.as_str())
    }
}

/// One named output: `[name, section]` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<Value>")]
pub struct NamedOutput {
    pub name: String,
    pub section: Option<String>,
}

impl TryFrom<Vec<Value>> for NamedOutput {
    type Error = String;

    fn try_from(items: Vec<Value>) -> std::result::Result<Self, Self::Error> {
        let mut items = items.into_iter();

        let name = match items.next() {
            Some(Value::String(name)) => name,
            Some(other) => return Err(format!("output name must be a string, got {other}")),
            None => return Err("named output is empty".to_string()),
        };

        let section = match items.next() {
            None | Some(Value::Null) => None,
            Some(Value::String(section)) => Some(section),
            Some(Value::Number(section)) => Some(section.to_string()),
            Some(other) => return Err(format!("invalid section id {other}")),
        };

        Ok(Self { name, section })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Configuration {
    /// relay id → output id → named output
    #[serde(default)]
    pub named_outputs: BTreeMap<String, BTreeMap<String, NamedOutput>>,
    /// section id → section name
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
}

impl Configuration {
    /// Every configured output as a target key
    pub fn targets(&self) -> impl Iterator<Item = TargetKey> + '_ {
        self.named_outputs.iter().flat_map(|(relay, outputs)| {
            outputs
                .keys()
                .filter_map(move |output| TargetKey::new(relay.as_str(), output.as_str()).ok())
        })
    }

    pub fn output(&self, target: &TargetKey) -> Option<&NamedOutput> {
        self.named_outputs
            .get(target.device())
            .and_then(|outputs| outputs.get(target.element()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OnlineStatus {
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub online_relays: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub online_switches: Vec<String>,
    /// device id → firmware is current
    #[serde(default)]
    pub up_to_date_devices: BTreeMap<String, bool>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub root_id: Option<String>,
    /// device id → signal strength in dBm
    #[serde(default)]
    pub devices_rssi: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwitchPress {
    #[serde(deserialize_with = "deserialize_id")]
    pub switch_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub button_id: String,
}

impl SwitchPress {
    pub fn target(&self) -> Result<TargetKey> {
        TargetKey::new(self.switch_id.as_str(), self.button_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlindPosition {
    #[serde(deserialize_with = "deserialize_id")]
    pub blind: String,
    #[serde(deserialize_with = "deserialize_position")]
    pub current_position: u16,
}

impl BlindPosition {
    /// Position as shown on the page slider
    pub fn slider_value(&self) -> u16 {
        super::BlindCommand::MAX_POSITION.saturating_sub(self.current_position)
    }
}

fn deserialize_position<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let raw = deserialize_id(deserializer)?;
    let position: u16 = raw
        .trim()
        .parse()
        .map_err(|_| D::Error::custom(format!("invalid blind position '{raw}'")))?;

    if position > super::BlindCommand::MAX_POSITION {
        return Err(D::Error::custom(format!(
            "blind position {position} is out of range"
        )));
    }
    Ok(position)
}
