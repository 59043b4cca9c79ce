//! Resilient WebSocket session
//!
//! One [`SessionManager`] owns one logical connection to a dashboard
//! channel. Physical sockets come and go; the session id in the URI stays
//! the same, so the server can correlate the client across reconnects.
//!
//! ```text
//! Disconnected --connect--> Connecting --open--> Open
//!      ^                        |                 |
//!      +------ retry timer -----+---- close ------+
//! ```

pub mod backoff;
pub mod endpoint;
pub mod machine;
pub mod manager;

pub use backoff::Backoff;
pub use endpoint::{build_uri, Channel, SessionIdentity};
pub use machine::{ConnectionState, Notification, SessionAction, SessionCore};
pub use manager::{SessionEvent, SessionHandle, SessionManager, SessionStatistics};
