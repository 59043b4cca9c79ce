//! WebSocket session layer for the Turbacz home automation dashboard
//!
//! The dashboard talks to the server over one WebSocket per page channel
//! (lights, blinds, heating, relay manager). This crate keeps that socket
//! alive and turns user clicks into relay commands without waiting for a
//! round trip.
//!
//! # Features
//!
//! - Reconnecting sessions with exponential backoff (1s doubling to 30s)
//! - A stable session id per page, reused across reconnects
//! - Access token re-read on every connect, from env, a literal or a cookie jar
//! - Optimistic relay toggles, one command in flight per output
//! - Typed decoding of every server push; malformed frames are dropped
//! - Visibility and liveness triggers for reconnecting idle pages
//!
//! # Example
//!
//! ```no_run
//! use turbacz_session::{Channel, SessionEvent, SessionManager};
//!
//! # async fn run() -> turbacz_session::Result<()> {
//! let server = url::Url::parse("https://turbacz.local")?;
//! let (handle, mut events) = SessionManager::new(server, Channel::Lights).start();
//! handle.connect();
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Message(message) = event {
//!         println!("{}", message.kind());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dashboard;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod tracker;

pub use config::{ClientConfig, SendFailurePolicy, TokenConfig, TokenProvider};
pub use dashboard::{Dashboard, DashboardView, Intent, IntentOutcome};
pub use error::{Result, SessionError};
pub use protocol::{ClientMessage, OutputState, ServerMessage, TargetKey};
pub use session::{
    Channel, ConnectionState, SessionEvent, SessionHandle, SessionManager, SessionStatistics,
};
pub use tracker::{CommandLink, CommandTracker, OutputView, ToggleOutcome};
