//! Optimistic command tracking for relay outputs
//!
//! [`CommandTracker`] turns "toggle this output" intents into at most one
//! command in flight per target. The local state flips immediately, and the
//! flip is reconciled when the server reports the authoritative state or
//! the pending timeout runs out.
//!
//! Pending commands live in one table keyed by target, each carrying its
//! own deadline. Issuing a new command for a key replaces its entry, so an
//! old deadline can never clear a newer command. Time is passed in
//! explicitly; [`CommandTracker::next_deadline`] tells the driver when to
//! call [`CommandTracker::expire`].

use crate::config::{CommandConfig, SendFailurePolicy};
use crate::error::{ErrorReporter, Result};
use crate::protocol::{ClientMessage, OutputCommand, OutputState, TargetKey};
use crate::session::SessionHandle;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default time a toggle blocks further toggles of its target
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_millis(2000);

/// The part of a session the tracker needs
pub trait CommandLink {
    fn is_connected(&self) -> bool;

    /// Ask the session to (re)connect
    fn connect(&self);

    /// Hand a frame to the session; `Err` means "not delivered"
    fn send(&self, frame: String) -> Result<()>;

    /// Host visibility changed
    fn set_visible(&self, _visible: bool) {}

    /// Generation of the socket frames are currently sent on
    fn generation(&self) -> u64 {
        0
    }
}

impl CommandLink for SessionHandle {
    fn is_connected(&self) -> bool {
        SessionHandle::is_connected(self)
    }

    fn connect(&self) {
        SessionHandle::connect(self)
    }

    fn send(&self, frame: String) -> Result<()> {
        SessionHandle::send(self, frame)
    }

    fn set_visible(&self, visible: bool) {
        SessionHandle::set_visible(self, visible)
    }

    fn generation(&self) -> u64 {
        SessionHandle::generation(self)
    }
}

/// Where output state is displayed
pub trait OutputView {
    /// Show `state` for `target`. Returns `false` when nothing displays
    /// that target.
    fn render(&mut self, target: &TargetKey, state: OutputState) -> bool;
}

/// A toggle awaiting server confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub target: TargetKey,
    pub requested: OutputState,
    /// State before the optimistic flip
    pub previous: OutputState,
    pub issued_at: Instant,
    pub deadline: Instant,
    /// Session generation the command was sent on
    pub generation: u64,
}

impl PendingCommand {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Command handed to the session
    Sent(OutputState),
    /// A command for this target is already in flight
    Debounced,
    /// Session down; nothing changed, reconnect requested
    NotConnected,
    /// Session refused the frame; pending cleared
    SendFailed,
}

pub struct CommandTracker<V> {
    view: V,
    states: HashMap<TargetKey, OutputState>,
    pending: HashMap<TargetKey, PendingCommand>,
    timeout: Duration,
    policy: SendFailurePolicy,
}

impl<V: OutputView> CommandTracker<V> {
    pub fn new(view: V) -> Self {
        Self {
            view,
            states: HashMap::new(),
            pending: HashMap::new(),
            timeout: DEFAULT_PENDING_TIMEOUT,
            policy: SendFailurePolicy::default(),
        }
    }

    pub fn from_config(view: V, config: &CommandConfig) -> Self {
        Self::new(view)
            .with_timeout(config.pending_timeout)
            .with_policy(config.send_failure)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: SendFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Flip `target` and send the command, unless the session is down or a
    /// command for `target` is already pending.
    pub fn toggle(
        &mut self,
        target: &TargetKey,
        link: &impl CommandLink,
        now: Instant,
    ) -> ToggleOutcome {
        if !link.is_connected() {
            debug!(target = %target, "session down, toggle aborted");
            link.connect();
            return ToggleOutcome::NotConnected;
        }

        match self.pending.get(target) {
            Some(pending) if !pending.is_expired(now) => {
                trace!(target = %target, "toggle debounced");
                return ToggleOutcome::Debounced;
            }
            Some(_) => {
                debug!(target = %target, "pending command timed out");
                self.pending.remove(target);
            }
            None => {}
        }

        let previous = self.state(target);
        let requested = previous.toggled();

        self.pending.insert(
            target.clone(),
            PendingCommand {
                target: target.clone(),
                requested,
                previous,
                issued_at: now,
                deadline: now + self.timeout,
                generation: link.generation(),
            },
        );
        self.set_state(target, requested);

        let sent = ClientMessage::from(OutputCommand::new(target, requested))
            .to_frame()
            .and_then(|frame| link.send(frame));

        match sent {
            Ok(()) => {
                debug!(target = %target, requested = %requested, "command sent");
                ToggleOutcome::Sent(requested)
            }
            Err(e) => {
                ErrorReporter::log_error(&e, "tracker", "toggle");
                self.abandon(target);
                ToggleOutcome::SendFailed
            }
        }
    }

    /// Apply the server's state for `target`. Always wins over any
    /// optimistic value and clears the pending command.
    pub fn on_server_state(
        &mut self,
        target: &TargetKey,
        state: OutputState,
    ) -> Option<PendingCommand> {
        let cleared = self.pending.remove(target);
        if let Some(pending) = &cleared {
            if pending.requested != state {
                debug!(
                    target = %target,
                    requested = %pending.requested,
                    actual = %state,
                    "server overrode optimistic state"
                );
            }
        }
        self.set_state(target, state);
        cleared
    }

    /// The session dropped the frame for `target` after accepting it.
    /// Clears the matching pending command under the send failure policy;
    /// a newer command for the same target is left alone.
    pub fn on_send_failed(&mut self, target: &TargetKey, requested: OutputState) -> bool {
        let matches = self
            .pending
            .get(target)
            .is_some_and(|pending| pending.requested == requested);
        if !matches {
            trace!(target = %target, "no pending command for failed frame");
            return false;
        }

        debug!(target = %target, requested = %requested, "command not delivered");
        self.abandon(target);
        true
    }

    /// Delivery of anything sent on a socket older than `generation` is
    /// unknown; unblock those targets. Commands already sent on the new
    /// socket stay pending.
    pub fn on_reconnect(&mut self, generation: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.generation >= generation);
        let cleared = before - self.pending.len();
        if cleared > 0 {
            debug!(cleared, generation, "cleared pending commands after reconnect");
        }
        cleared
    }

    /// Drop every pending command whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<TargetKey> {
        let mut expired: Vec<TargetKey> = self
            .pending
            .values()
            .filter(|pending| pending.is_expired(now))
            .map(|pending| pending.target.clone())
            .collect();
        expired.sort();

        for target in &expired {
            self.pending.remove(target);
            debug!(target = %target, "pending command timed out");
        }
        expired
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Last known state; unknown targets are off
    pub fn state(&self, target: &TargetKey) -> OutputState {
        self.states.get(target).copied().unwrap_or_default()
    }

    pub fn is_pending(&self, target: &TargetKey) -> bool {
        self.pending.contains_key(target)
    }

    pub fn pending(&self, target: &TargetKey) -> Option<&PendingCommand> {
        self.pending.get(target)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Every target with a known state, sorted
    pub fn known_states(&self) -> Vec<(TargetKey, OutputState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|(target, state)| (target.clone(), *state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Repaint every known state, e.g. after the view was rebuilt
    pub fn rerender_all(&mut self) {
        for (target, state) in self.known_states() {
            self.render(&target, state);
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn policy(&self) -> SendFailurePolicy {
        self.policy
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    fn abandon(&mut self, target: &TargetKey) {
        if let Some(pending) = self.pending.remove(target) {
            if self.policy == SendFailurePolicy::Rollback {
                self.set_state(target, pending.previous);
            }
        }
    }

    fn set_state(&mut self, target: &TargetKey, state: OutputState) {
        self.states.insert(target.clone(), state);
        self.render(target, state);
    }

    fn render(&mut self, target: &TargetKey, state: OutputState) {
        if !self.view.render(target, state) {
            trace!(target = %target, "no element for target, repaint skipped");
        }
    }
}
