//! Client → server frames

use super::target::{OutputState, TargetKey};
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Any frame the dashboard may put on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    /// Relay output toggle (lights and relay manager channels)
    Output(OutputCommand),
    /// Blind movement
    Blind(BlindCommand),
    /// Heating setpoint, sent as a bare JSON string
    Setpoint(String),
    /// `type`-tagged management request
    Request(ChannelRequest),
}

impl ClientMessage {
    /// Encode as a text frame
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<OutputCommand> for ClientMessage {
    fn from(command: OutputCommand) -> Self {
        ClientMessage::Output(command)
    }
}

impl From<BlindCommand> for ClientMessage {
    fn from(command: BlindCommand) -> Self {
        ClientMessage::Blind(command)
    }
}

impl From<ChannelRequest> for ClientMessage {
    fn from(request: ChannelRequest) -> Self {
        ClientMessage::Request(request)
    }
}

/// `{"relay_id": .., "output_id": .., "state": 0|1}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCommand {
    pub relay_id: String,
    pub output_id: String,
    pub state: OutputState,
}

impl OutputCommand {
    pub fn new(target: &TargetKey, state: OutputState) -> Self {
        Self {
            relay_id: target.device().to_string(),
            output_id: target.element().to_string(),
            state,
        }
    }

    pub fn target(&self) -> Result<TargetKey> {
        TargetKey::new(self.relay_id.as_str(), self.output_id.as_str())
    }
}

/// `{"blind": .., "position": 0..=999}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlindCommand {
    pub blind: String,
    pub position: u16,
}

impl BlindCommand {
    /// Highest position the blind controller accepts
    pub const MAX_POSITION: u16 = 999;

    pub fn new(blind: impl Into<String>, position: u16) -> Result<Self> {
        if position > Self::MAX_POSITION {
            return Err(SessionError::invalid_input(format!(
                "blind position {position} is outside 0..={}",
                Self::MAX_POSITION
            )));
        }

        Ok(Self {
            blind: blind.into(),
            position,
        })
    }

    /// The page slider runs opposite to the controller: slider 0 is fully
    /// open, controller 0 is fully closed.
    pub fn from_slider(blind: impl Into<String>, slider: u16) -> Result<Self> {
        let position = Self::MAX_POSITION.checked_sub(slider).ok_or_else(|| {
            SessionError::invalid_input(format!(
                "slider value {slider} is outside 0..={}",
                Self::MAX_POSITION
            ))
        })?;
        Self::new(blind, position)
    }
}

/// Relay manager and lights management requests, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelRequest {
    ChangeSection {
        relay_id: String,
        output_id: String,
        section: String,
    },
    AddSection {
        name: String,
    },
    Update,
    GetStates,
    /// Per switch, per button type code
    ButtonTypes {
        data: BTreeMap<String, BTreeMap<String, u8>>,
    },
    UpdateDevice {
        device_id: String,
        device_type: String,
    },
    UpdateAllRelays,
    UpdateAllSwitches,
    UpdateRoot,
}
