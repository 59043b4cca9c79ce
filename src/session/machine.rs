//! Connection lifecycle state machine
//!
//! [`SessionCore`] performs no I/O. Every input (a caller asking to connect,
//! a socket opening or closing, a timer firing) returns the list of
//! [`SessionAction`]s the driver has to carry out. The tokio actor in
//! [`super::manager`] is the only driver in production; the tests below
//! drive it by hand.
//!
//! Every connection attempt gets a new generation number. Transport events
//! tagged with an older generation belong to a socket that has already been
//! replaced and are ignored.

use super::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Lifecycle notification for the session's consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Opened,
    Closed { reason: String },
    Error { reason: String },
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Resolve a credential, build the URI and open a socket
    OpenSocket { generation: u64 },
    /// Close the socket of this generation
    CloseSocket { generation: u64 },
    /// Arm the single retry timer, replacing any armed one
    ScheduleRetry { delay: Duration },
    CancelRetry,
    Notify(Notification),
}

#[derive(Debug)]
pub struct SessionCore {
    state: ConnectionState,
    backoff: Backoff,
    generation: u64,
    retry_armed: bool,
    visible: bool,
    shut_down: bool,
}

impl SessionCore {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            generation: 0,
            retry_armed: false,
            visible: true,
            shut_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Generation of the most recent connection attempt
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn retry_armed(&self) -> bool {
        self.retry_armed
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Start a connection attempt unless one is in flight or the socket is
    /// already open.
    pub fn connect(&mut self) -> Vec<SessionAction> {
        if self.shut_down {
            trace!("connect ignored after shutdown");
            return Vec::new();
        }
        if self.state != ConnectionState::Disconnected {
            trace!(state = %self.state, "connect ignored");
            return Vec::new();
        }

        self.state = ConnectionState::Connecting;
        self.generation += 1;

        let mut actions = Vec::with_capacity(2);
        if self.retry_armed {
            self.retry_armed = false;
            actions.push(SessionAction::CancelRetry);
        }
        actions.push(SessionAction::OpenSocket {
            generation: self.generation,
        });
        actions
    }

    pub fn on_open(&mut self, generation: u64) -> Vec<SessionAction> {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            debug!(generation, state = %self.state, "ignoring open of superseded socket");
            return Vec::new();
        }

        self.state = ConnectionState::Open;
        self.backoff.reset();
        vec![SessionAction::Notify(Notification::Opened)]
    }

    /// The attempt never reached the open state
    pub fn on_connect_failed(&mut self, generation: u64, reason: &str) -> Vec<SessionAction> {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            debug!(generation, "ignoring failure of superseded attempt");
            return Vec::new();
        }

        let mut actions = vec![SessionAction::Notify(Notification::Error {
            reason: reason.to_string(),
        })];
        actions.extend(self.enter_disconnected(reason));
        actions
    }

    pub fn on_closed(&mut self, generation: u64, reason: &str) -> Vec<SessionAction> {
        if !self.is_current(generation) || self.state == ConnectionState::Disconnected {
            debug!(generation, "ignoring close of superseded socket");
            return Vec::new();
        }
        self.enter_disconnected(reason)
    }

    /// A live socket reported an error. The close that follows drives the
    /// reconnect.
    pub fn on_transport_error(&mut self, generation: u64, reason: &str) -> Vec<SessionAction> {
        if !self.is_current(generation) || self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        vec![SessionAction::Notify(Notification::Error {
            reason: reason.to_string(),
        })]
    }

    pub fn on_retry_elapsed(&mut self) -> Vec<SessionAction> {
        self.retry_armed = false;
        self.connect()
    }

    pub fn on_liveness_tick(&mut self) -> Vec<SessionAction> {
        if self.state == ConnectionState::Open {
            return Vec::new();
        }
        debug!(state = %self.state, "liveness check found session down");
        self.connect()
    }

    /// Reconnect lazily when the host becomes visible again
    pub fn set_visible(&mut self, visible: bool) -> Vec<SessionAction> {
        let was_visible = std::mem::replace(&mut self.visible, visible);
        if visible && !was_visible && self.state != ConnectionState::Open {
            return self.connect();
        }
        Vec::new()
    }

    /// Stop reconnecting and close the socket if there is one. The driver
    /// reports the resulting close through [`SessionCore::on_closed`].
    pub fn shutdown(&mut self) -> Vec<SessionAction> {
        self.shut_down = true;

        let mut actions = Vec::new();
        if self.retry_armed {
            self.retry_armed = false;
            actions.push(SessionAction::CancelRetry);
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            self.state = ConnectionState::Closing;
            actions.push(SessionAction::CloseSocket {
                generation: self.generation,
            });
        }
        actions
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    fn enter_disconnected(&mut self, reason: &str) -> Vec<SessionAction> {
        self.state = ConnectionState::Disconnected;

        let mut actions = vec![SessionAction::Notify(Notification::Closed {
            reason: reason.to_string(),
        })];

        if self.shut_down {
            return actions;
        }

        if self.retry_armed {
            actions.push(SessionAction::CancelRetry);
        }
        let delay = self.backoff.next_delay();
        self.retry_armed = true;
        debug!(
            delay_ms = delay.as_millis() as u64,
            failures = self.backoff.consecutive_failures(),
            "scheduling reconnect"
        );
        actions.push(SessionAction::ScheduleRetry { delay });
        actions
    }
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn open_generation(actions: &[SessionAction]) -> Option<u64> {
        actions.iter().find_map(|action| match action {
            SessionAction::OpenSocket { generation } => Some(*generation),
            _ => None,
        })
    }

    fn retry_delay(actions: &[SessionAction]) -> Option<Duration> {
        actions.iter().find_map(|action| match action {
            SessionAction::ScheduleRetry { delay } => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut core = SessionCore::default();

        let first = core.connect();
        assert_eq!(first, vec![SessionAction::OpenSocket { generation: 1 }]);
        assert_eq!(core.state(), ConnectionState::Connecting);

        assert!(core.connect().is_empty());
        assert!(core.connect().is_empty());

        core.on_open(1);
        assert!(core.is_connected());
        assert!(core.connect().is_empty());
    }

    #[test]
    fn test_failed_attempt_reports_error_then_close() {
        let mut core = SessionCore::default();
        core.connect();

        let actions = core.on_connect_failed(1, "refused");
        assert_eq!(
            actions,
            vec![
                SessionAction::Notify(Notification::Error {
                    reason: "refused".into()
                }),
                SessionAction::Notify(Notification::Closed {
                    reason: "refused".into()
                }),
                SessionAction::ScheduleRetry {
                    delay: Duration::from_secs(1)
                },
            ]
        );
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.retry_armed());
    }

    #[test]
    fn test_consecutive_failures_follow_closed_form() {
        let mut core = SessionCore::default();
        core.connect();

        for n in 0..8u32 {
            let actions = core.on_connect_failed(core.generation(), "refused");
            let expected = Duration::from_millis((1_000u64 << n).min(30_000));
            assert_eq!(retry_delay(&actions), Some(expected), "failure {n}");

            let actions = core.on_retry_elapsed();
            assert!(open_generation(&actions).is_some());
        }
    }

    #[test]
    fn test_successful_open_resets_backoff() {
        let mut core = SessionCore::default();
        core.connect();
        for _ in 0..4 {
            core.on_connect_failed(core.generation(), "refused");
            core.on_retry_elapsed();
        }

        core.on_open(core.generation());
        let actions = core.on_closed(core.generation(), "server went away");
        assert_eq!(retry_delay(&actions), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_connect_cancels_armed_retry() {
        let mut core = SessionCore::default();
        core.connect();
        core.on_connect_failed(1, "refused");
        assert!(core.retry_armed());

        let actions = core.connect();
        assert_eq!(
            actions,
            vec![
                SessionAction::CancelRetry,
                SessionAction::OpenSocket { generation: 2 }
            ]
        );
        assert!(!core.retry_armed());
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let mut core = SessionCore::default();
        core.connect();
        core.on_connect_failed(1, "refused");
        core.connect();

        assert!(core.on_open(1).is_empty());
        assert!(core.on_closed(1, "old socket").is_empty());
        assert_eq!(core.state(), ConnectionState::Connecting);

        assert_eq!(
            core.on_open(2),
            vec![SessionAction::Notify(Notification::Opened)]
        );
    }

    #[test]
    fn test_transport_error_only_notifies() {
        let mut core = SessionCore::default();
        core.connect();
        core.on_open(1);

        let actions = core.on_transport_error(1, "reset by peer");
        assert_eq!(
            actions,
            vec![SessionAction::Notify(Notification::Error {
                reason: "reset by peer".into()
            })]
        );
        assert!(core.is_connected());
    }

    #[test]
    fn test_liveness_tick() {
        let mut core = SessionCore::default();
        assert_eq!(
            open_generation(&core.on_liveness_tick()),
            Some(1),
            "disconnected session reconnects"
        );
        assert!(core.on_liveness_tick().is_empty(), "attempt already in flight");

        core.on_open(1);
        assert!(core.on_liveness_tick().is_empty());
    }

    #[test]
    fn test_visibility_reconnects_only_on_return() {
        let mut core = SessionCore::default();

        assert!(core.set_visible(true).is_empty(), "already visible");
        assert!(core.set_visible(false).is_empty());
        assert_eq!(open_generation(&core.set_visible(true)), Some(1));

        core.on_open(1);
        core.set_visible(false);
        assert!(core.set_visible(true).is_empty(), "still open");
    }

    #[test]
    fn test_shutdown_closes_without_retry() {
        let mut core = SessionCore::default();
        core.connect();
        core.on_open(1);

        assert_eq!(
            core.shutdown(),
            vec![SessionAction::CloseSocket { generation: 1 }]
        );
        assert_eq!(core.state(), ConnectionState::Closing);
        assert!(core.connect().is_empty());

        let actions = core.on_closed(1, "session shut down");
        assert_eq!(
            actions,
            vec![SessionAction::Notify(Notification::Closed {
                reason: "session shut down".into()
            })]
        );
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.on_liveness_tick().is_empty());
    }

    #[test]
    fn test_shutdown_cancels_armed_retry() {
        let mut core = SessionCore::default();
        core.connect();
        core.on_connect_failed(1, "refused");

        assert_eq!(core.shutdown(), vec![SessionAction::CancelRetry]);
        assert!(core.is_shut_down());
    }
}
