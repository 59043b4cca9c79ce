//! Target keys and output states shared by commands and server updates

use crate::error::{Result, SessionError};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Composite identity of a controllable element, e.g. relay `5` output `a`
/// or switch `12` button `c`.
///
/// Displayed as `"{device}-{element}"`. Both the dashed form and the legacy
/// compact form used by the lights page (`"5a"`, last character is the
/// element) parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    device: String,
    element: String,
}

impl TargetKey {
    /// Build a key from its two parts; neither may be empty
    pub fn new(device: impl Into<String>, element: impl Into<String>) -> Result<Self> {
        let device = device.into().trim().to_string();
        let element = element.into().trim().to_string();

        if device.is_empty() || element.is_empty() {
            return Err(SessionError::invalid_input(format!(
                "target key needs a device and an element, got '{device}' / '{element}'"
            )));
        }

        Ok(Self { device, element })
    }

    /// Relay or switch identifier
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Output or button identifier
    pub fn element(&self) -> &str {
        &self.element
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.device, self.element)
    }
}

impl FromStr for TargetKey {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some((device, element)) = s.rsplit_once('-') {
            return Self::new(device, element);
        }

        let mut chars = s.chars();
        match chars.next_back() {
            Some(element) if !chars.as_str().is_empty() => {
                Self::new(chars.as_str(), element.to_string())
            }
            _ => Err(SessionError::invalid_input(format!(
                "cannot parse target key '{s}'"
            ))),
        }
    }
}

/// On/off state of a relay output. Travels as `0`/`1` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputState {
    #[default]
    Off,
    On,
}

impl OutputState {
    pub fn toggled(self) -> Self {
        match self {
            OutputState::Off => OutputState::On,
            OutputState::On => OutputState::Off,
        }
    }

    pub fn is_on(self) -> bool {
        self == OutputState::On
    }

    pub fn as_wire(self) -> u8 {
        match self {
            OutputState::Off => 0,
            OutputState::On => 1,
        }
    }

    pub fn from_wire(value: u64) -> Result<Self> {
        match value {
            0 => Ok(OutputState::Off),
            1 => Ok(OutputState::On),
            other => Err(SessionError::invalid_input(format!(
                "output state must be 0 or 1, got {other}"
            ))),
        }
    }
}

impl From<bool> for OutputState {
    fn from(on: bool) -> Self {
        if on {
            OutputState::On
        } else {
            OutputState::Off
        }
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputState::Off => write!(f, "off"),
            OutputState::On => write!(f, "on"),
        }
    }
}

impl Serialize for OutputState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for OutputState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct StateVisitor;

        impl<'de> Visitor<'de> for StateVisitor {
            type Value = OutputState;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0, 1, true or false")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<OutputState, E> {
                Ok(OutputState::from(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<OutputState, E> {
                OutputState::from_wire(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<OutputState, E> {
                u64::try_from(v)
                    .map_err(E::custom)
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<OutputState, E> {
                match v.trim() {
                    "0" => Ok(OutputState::Off),
                    "1" => Ok(OutputState::On),
                    other => Err(E::custom(format!("invalid output state '{other}'"))),
                }
            }
        }

        deserializer.deserialize_any(StateVisitor)
    }
}
