//! Channel paths, session identity and connection URI construction

use crate::error::{Result, SessionError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Session ids are drawn from `0..SESSION_ID_LIMIT`
pub const SESSION_ID_LIMIT: u32 = 2_000_000_000;

/// Logical channel joined by a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    Lights,
    Blinds,
    Heating,
    /// Relay connection manager
    RelayManager,
    /// Any other endpoint path, always ending in `/`
    Custom(String),
}

impl Channel {
    /// Endpoint path the session id is appended to
    pub fn path(&self) -> &str {
        match self {
            Channel::Lights => "/lights/ws/",
            Channel::Blinds => "/blinds/ws/",
            Channel::Heating => "/heating/ws/",
            Channel::RelayManager => "/rcm/ws/",
            Channel::Custom(path) => path,
        }
    }

    /// Whether relay outputs can be toggled on this channel. Custom
    /// endpoints are not restricted.
    pub fn carries_outputs(&self) -> bool {
        !matches!(self, Channel::Blinds | Channel::Heating)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Lights => write!(f, "lights"),
            Channel::Blinds => write!(f, "blinds"),
            Channel::Heating => write!(f, "heating"),
            Channel::RelayManager => write!(f, "rcm"),
            Channel::Custom(path) => write!(f, "{path}"),
        }
    }
}

impl FromStr for Channel {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "lights" => Ok(Channel::Lights),
            "blinds" => Ok(Channel::Blinds),
            "heating" => Ok(Channel::Heating),
            "rcm" | "relay-manager" => Ok(Channel::RelayManager),
            path if path.starts_with('/') => {
                let mut path = path.to_string();
                if !path.ends_with('/') {
                    path.push('/');
                }
                Ok(Channel::Custom(path))
            }
            other => Err(SessionError::config(format!(
                "unknown channel '{other}' (expected lights, blinds, heating, rcm or a /path/)"
            ))),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

/// Identity the server uses to correlate one logical client across
/// physical reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: u32,
    pub channel: Channel,
}

impl SessionIdentity {
    /// Fresh identity with a random session id
    pub fn new(channel: Channel) -> Self {
        let session_id = rand::thread_rng().gen_range(0..SESSION_ID_LIMIT);
        Self::with_id(channel, session_id)
    }

    pub fn with_id(channel: Channel, session_id: u32) -> Self {
        Self {
            session_id,
            channel,
        }
    }
}

/// Build `{ws|wss}://host{base path}{channel path}{session id}?token={token}`.
///
/// `http` and `https` bases are mapped to `ws` and `wss`. The token query
/// parameter is omitted when no token is available.
pub fn build_uri(base: &Url, identity: &SessionIdentity, token: Option<&str>) -> Result<Url> {
    let mut uri = base.clone();

    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SessionError::config(format!(
                "unsupported URL scheme '{other}' for a WebSocket session"
            )))
        }
    };
    uri.set_scheme(scheme)
        .map_err(|_| SessionError::config(format!("cannot use scheme {scheme} for {base}")))?;

    let prefix = base.path().trim_end_matches('/');
    uri.set_path(&format!(
        "{prefix}{}{}",
        identity.channel.path(),
        identity.session_id
    ));
    uri.set_fragment(None);

    match token {
        Some(token) if !token.is_empty() => {
            uri.set_query(Some(&format!("token={}", urlencoding::encode(token))));
        }
        _ => uri.set_query(None),
    }

    Ok(uri)
}

/// Render a connection URI for logs with the token hidden
pub fn redact(uri: &Url) -> String {
    if uri.query_pairs().all(|(key, _)| key != "token") {
        return uri.to_string();
    }

    let pairs: Vec<(String, String)> = uri
        .query_pairs()
        .into_owned()
        .map(|(key, value)| {
            if key == "token" {
                (key, "***".to_string())
            } else {
                (key, value)
            }
        })
        .collect();

    let mut redacted = uri.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
