//! Access token sources
//!
//! The backend authenticates the socket through a `token` query parameter
//! carrying the `access_token` cookie issued by its login flow. Tokens
//! rotate, so providers are asked again on every connection attempt.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Cookie holding the access token
pub const DEFAULT_COOKIE: &str = "access_token";

/// Resolves the credential for the next connection attempt
pub trait TokenProvider: Send + Sync {
    /// `Ok(None)` connects without a token
    fn token(&self) -> Result<Option<String>>;
}

/// Where the token comes from
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TokenConfig {
    /// Connect without a token
    #[default]
    None,
    /// Fixed token
    Static { token: String },
    /// Read from an environment variable on every attempt
    Env { var: String },
    /// Read from a cookie file on every attempt
    CookieFile {
        path: PathBuf,
        #[serde(default = "default_cookie")]
        cookie: String,
    },
}

fn default_cookie() -> String {
    DEFAULT_COOKIE.to_string()
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenConfig::None => f.write_str("None"),
            TokenConfig::Static { .. } => f
                .debug_struct("Static")
                .field("token", &"***")
                .finish(),
            TokenConfig::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            TokenConfig::CookieFile { path, cookie } => f
                .debug_struct("CookieFile")
                .field("path", path)
                .field("cookie", cookie)
                .finish(),
        }
    }
}

impl TokenConfig {
    pub fn provider(&self) -> Box<dyn TokenProvider> {
        match self {
            TokenConfig::None => Box::new(NoToken),
            TokenConfig::Static { token } => Box::new(StaticToken::new(token.clone())),
            TokenConfig::Env { var } => Box::new(EnvToken::new(var.clone())),
            TokenConfig::CookieFile { path, cookie } => {
                Box::new(CookieFileToken::new(path.clone()).with_cookie(cookie.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenProvider for NoToken {
    fn token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<Option<String>> {
        Ok(non_empty(self.0.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn token(&self) -> Result<Option<String>> {
        match std::env::var(&self.var) {
            Ok(token) => Ok(non_empty(token)),
            Err(std::env::VarError::NotPresent) => {
                debug!(var = %self.var, "token variable not set");
                Ok(None)
            }
            Err(e) => Err(SessionError::credentials(format!(
                "cannot read {}: {e}",
                self.var
            ))),
        }
    }
}

/// Reads the token from a file holding either a `Cookie:` header line or a
/// Netscape cookie jar, as exported by curl or a browser extension
#[derive(Debug, Clone)]
pub struct CookieFileToken {
    path: PathBuf,
    cookie: String,
}

impl CookieFileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cookie: default_cookie(),
        }
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = cookie.into();
        self
    }
}

impl TokenProvider for CookieFileToken {
    fn token(&self) -> Result<Option<String>> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            SessionError::credentials(format!(
                "cannot read cookie file {}: {e}",
                self.path.display()
            ))
        })?;

        let token = cookie_value(&contents, &self.cookie);
        if token.is_none() {
            debug!(
                path = %self.path.display(),
                cookie = %self.cookie,
                "cookie not present"
            );
        }
        Ok(token)
    }
}

/// Find cookie `name` in a cookie header line or a Netscape cookie jar.
/// Values are percent-decoded.
pub fn cookie_value(contents: &str, name: &str) -> Option<String> {
    for line in contents.lines() {
        let line = line.trim();
        let line = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => rest,
            None if line.is_empty() || line.starts_with('#') => continue,
            None => line,
        };

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() == 7 {
            if fields[5] == name {
                return non_empty(decode(fields[6]));
            }
            continue;
        }

        let header = strip_header_name(line);
        for pair in header.split(';') {
            if let Some((key, value)) = pair.split_once('=') {
                if key.trim() == name {
                    return non_empty(decode(value.trim()));
                }
            }
        }
    }
    None
}

fn strip_header_name(line: &str) -> &str {
    match line.split_once(':') {
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("cookie") => rest,
        _ => line,
    }
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn non_empty(token: String) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
