//! JSON message contracts exchanged with the dashboard backend
//!
//! Outbound commands live in [`client`], inbound state updates in [`server`].
//! Inbound frames are decoded exactly once, at the transport boundary, into
//! [`ServerMessage`]; anything that does not fit a known shape is rejected
//! there and never reaches the dispatch loop.

pub mod client;
pub mod server;
pub mod target;

pub use client::{BlindCommand, ChannelRequest, ClientMessage, OutputCommand};
pub use server::{
    BlindPosition, Configuration, LightState, NamedOutput, OnlineStatus, ServerMessage,
    SwitchPress,
};
pub use target::{OutputState, TargetKey};

use serde::{Deserialize, Deserializer};

/// The backend sends device identifiers as integers on some channels and as
/// strings on others.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

pub(crate) fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

pub(crate) fn deserialize_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Vec::<RawId>::deserialize(deserializer)?
        .into_iter()
        .map(String::from)
        .collect())
}
