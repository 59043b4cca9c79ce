//! Page controller
//!
//! A [`Dashboard`] owns everything one dashboard page needs: the link to its
//! session, the command tracker with its view, and the rest of the state the
//! server pushes (configuration, fleet health, blind positions, telemetry).
//! Session events, user intents and tracker deadlines are handled one at a
//! time, each to completion, by [`Dashboard::run`].

pub mod commands;
pub mod state;

pub use commands::{parse_line, LineCommand};
pub use state::{DashboardState, FleetStatus};

use crate::error::{ErrorReporter, Result};
use crate::protocol::{
    BlindCommand, ChannelRequest, ClientMessage, Configuration, OutputCommand, ServerMessage,
    SwitchPress, TargetKey,
};
use crate::session::{Channel, SessionEvent};
use crate::tracker::{CommandLink, CommandTracker, OutputView, ToggleOutcome};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Something the user asked for
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Toggle(TargetKey),
    /// Slider value as shown on the page, `0..=999`
    MoveBlind { blind: String, slider: u16 },
    SetSetpoint(String),
    Request(ChannelRequest),
    Visibility(bool),
    /// Repaint every known output
    Refresh,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    Toggle(ToggleOutcome),
    Sent,
    /// The session did not take the frame
    Dropped { reason: String },
    /// The intent itself was invalid
    Rejected { reason: String },
    Applied,
}

/// Everything a page displays. Only output repaints are required; the
/// other hooks default to doing nothing.
pub trait DashboardView: OutputView {
    fn connection_changed(&mut self, _connected: bool) {}

    fn configuration_changed(&mut self, _configuration: &Configuration) {}

    fn fleet_changed(&mut self, _fleet: &FleetStatus) {}

    fn blind_moved(&mut self, _blind: &str, _slider: u16) {}

    fn switch_pressed(&mut self, _press: &SwitchPress) {}

    fn telemetry_received(&mut self, _record: &Map<String, Value>) {}

    fn intent_handled(&mut self, _intent: &Intent, _outcome: &IntentOutcome) {}
}

pub struct Dashboard<V, L> {
    link: L,
    channel: Channel,
    tracker: CommandTracker<V>,
    state: DashboardState,
}

impl<V: DashboardView, L: CommandLink> Dashboard<V, L> {
    pub fn new(link: L, channel: Channel, tracker: CommandTracker<V>) -> Self {
        Self {
            link,
            channel,
            tracker,
            state: DashboardState::default(),
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened => {
                self.state.connected = true;
                self.tracker.on_reconnect(self.link.generation());
                self.tracker.view_mut().connection_changed(true);

                if self.channel == Channel::RelayManager {
                    self.send(ClientMessage::from(ChannelRequest::GetStates));
                }
            }
            SessionEvent::Closed { reason } => {
                self.state.connected = false;
                info!(reason = %reason, "dashboard disconnected");
                self.tracker.view_mut().connection_changed(false);
            }
            SessionEvent::Error { reason } => {
                debug!(reason = %reason, "session error");
            }
            SessionEvent::Message(message) => self.handle_message(message),
            SessionEvent::SendFailed { frame, reason } => {
                warn!(reason = %reason, "frame not delivered");
                self.handle_send_failure(&frame);
            }
        }
    }

    /// Only output commands leave tracker state to unwind
    fn handle_send_failure(&mut self, frame: &str) {
        let Ok(command) = serde_json::from_str::<OutputCommand>(frame) else {
            return;
        };
        match command.target() {
            Ok(target) => {
                self.tracker.on_send_failed(&target, command.state);
            }
            Err(e) => ErrorReporter::log_error(&e, "dashboard", "send_failed"),
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::LightState(light) => match light.target() {
                Ok(target) => {
                    self.tracker.on_server_state(&target, light.state);
                }
                Err(e) => ErrorReporter::log_error(&e, "dashboard", "light_state"),
            },
            ServerMessage::Configuration(configuration) => {
                info!(
                    outputs = configuration.targets().count(),
                    sections = configuration.sections.len(),
                    "configuration received"
                );
                self.tracker
                    .view_mut()
                    .configuration_changed(&configuration);
                self.state.configuration = Some(configuration);
                self.state.configuration_stale = false;
                self.tracker.rerender_all();
            }
            ServerMessage::OnlineStatus(status) => {
                self.state.fleet = FleetStatus::from_report(status, Utc::now());
                self.tracker.view_mut().fleet_changed(&self.state.fleet);
            }
            ServerMessage::SwitchState(press) => {
                self.state.record_switch_press(&press);
                self.tracker.view_mut().switch_pressed(&press);
            }
            ServerMessage::Update => {
                info!("server configuration changed");
                self.state.configuration_stale = true;
            }
            ServerMessage::BlindPosition(position) => {
                let slider = position.slider_value();
                self.state
                    .blind_sliders
                    .insert(position.blind.clone(), slider);
                self.tracker.view_mut().blind_moved(&position.blind, slider);
            }
            ServerMessage::StateRecord(record) => {
                self.state.merge_telemetry(&record, Utc::now());
                self.tracker.view_mut().telemetry_received(&record);
            }
        }
    }

    pub fn handle_intent(&mut self, intent: Intent, now: Instant) -> IntentOutcome {
        let outcome = match &intent {
            Intent::Toggle(_) if !self.channel.carries_outputs() => IntentOutcome::Rejected {
                reason: format!("no relay outputs on the {} channel", self.channel),
            },
            Intent::Toggle(target) => {
                IntentOutcome::Toggle(self.tracker.toggle(target, &self.link, now))
            }
            Intent::MoveBlind { blind, slider } => {
                match BlindCommand::from_slider(blind.as_str(), *slider) {
                    Ok(command) => self.send(command.into()),
                    Err(e) => IntentOutcome::Rejected {
                        reason: e.to_string(),
                    },
                }
            }
            Intent::SetSetpoint(value) if value.trim().is_empty() => IntentOutcome::Rejected {
                reason: "setpoint is empty".to_string(),
            },
            Intent::SetSetpoint(value) => self.send(ClientMessage::Setpoint(value.clone())),
            Intent::Request(request) => self.send(request.clone().into()),
            Intent::Visibility(visible) => {
                self.link.set_visible(*visible);
                IntentOutcome::Applied
            }
            Intent::Refresh => {
                self.tracker.rerender_all();
                if self.channel == Channel::RelayManager && self.link.is_connected() {
                    self.send(ClientMessage::from(ChannelRequest::GetStates));
                }
                IntentOutcome::Applied
            }
        };

        debug!(?intent, ?outcome, "intent handled");
        self.tracker.view_mut().intent_handled(&intent, &outcome);
        outcome
    }

    /// Clear pending commands whose timeout has passed
    pub fn tick(&mut self, now: Instant) -> Vec<TargetKey> {
        self.tracker.expire(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tracker.next_deadline()
    }

    pub fn state(&self) -> &DashboardState {
        &self.state
    }

    pub fn tracker(&self) -> &CommandTracker<V> {
        &self.tracker
    }

    pub fn view(&self) -> &V {
        self.tracker.view()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Process events and intents until the session's event stream ends.
    /// Session pushes keep being applied after the intent source closes.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut intents: mpsc::Receiver<Intent>,
    ) -> Result<()> {
        let mut intents_open = true;

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("session event stream ended");
                        break;
                    }
                },
                intent = intents.recv(), if intents_open => match intent {
                    Some(intent) => {
                        self.handle_intent(intent, Instant::now());
                    }
                    None => {
                        debug!("intent source closed, following the session only");
                        intents_open = false;
                    }
                },
                _ = sleep_until(deadline) => {
                    self.tick(Instant::now());
                }
            }
        }
        Ok(())
    }

    fn send(&mut self, message: ClientMessage) -> IntentOutcome {
        match message.to_frame().and_then(|frame| self.link.send(frame)) {
            Ok(()) => IntentOutcome::Sent,
            Err(e) => {
                warn!(error = %e, "frame not sent");
                IntentOutcome::Dropped {
                    reason: e.to_string(),
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendFailurePolicy;
    use crate::error::SessionError;
    use crate::protocol::OutputState;
    use pretty_assertions::assert_eq;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLink {
        connected: Cell<bool>,
        visible: Cell<Option<bool>>,
        generation: Cell<u64>,
        sent: RefCell<Vec<String>>,
    }

    impl CommandLink for FakeLink {
        fn is_connected(&self) -> bool {
            self.connected.get()
        }

        fn connect(&self) {}

        fn send(&self, frame: String) -> Result<()> {
            if !self.connected.get() {
                return Err(SessionError::not_connected("session is disconnected"));
            }
            self.sent.borrow_mut().push(frame);
            Ok(())
        }

        fn set_visible(&self, visible: bool) {
            self.visible.set(Some(visible));
        }

        fn generation(&self) -> u64 {
            self.generation.get()
        }
    }

    #[derive(Default)]
    struct PageView {
        outputs: Vec<(String, OutputState)>,
        connection: Vec<bool>,
        blinds: Vec<(String, u16)>,
    }

    impl OutputView for PageView {
        fn render(&mut self, target: &TargetKey, state: OutputState) -> bool {
            self.outputs.push((target.to_string(), state));
            true
        }
    }

    impl DashboardView for PageView {
        fn connection_changed(&mut self, connected: bool) {
            self.connection.push(connected);
        }

        fn blind_moved(&mut self, blind: &str, slider: u16) {
            self.blinds.push((blind.to_string(), slider));
        }
    }

    fn dashboard(channel: Channel) -> Dashboard<PageView, FakeLink> {
        let link = FakeLink::default();
        link.connected.set(true);
        Dashboard::new(link, channel, CommandTracker::new(PageView::default()))
    }

    fn message(frame: &str) -> SessionEvent {
        SessionEvent::Message(ServerMessage::decode(frame).unwrap())
    }

    fn key(s: &str) -> TargetKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_reconnect_clears_pending_toggles() {
        let mut dash = dashboard(Channel::Lights);
        let now = Instant::now();

        dash.handle_intent(Intent::Toggle(key("3-b")), now);
        assert!(dash.tracker().is_pending(&key("3-b")));

        dash.handle_event(SessionEvent::Closed {
            reason: "network".into(),
        });
        dash.link().generation.set(1);
        dash.handle_event(SessionEvent::Opened);

        assert!(!dash.tracker().is_pending(&key("3-b")));
        assert_eq!(
            dash.handle_intent(Intent::Toggle(key("3-b")), now + Duration::from_millis(10)),
            IntentOutcome::Toggle(ToggleOutcome::Sent(OutputState::Off))
        );
        assert_eq!(dash.view().connection, vec![false, true]);
    }

    #[test]
    fn test_toggle_on_fresh_socket_survives_its_open_event() {
        let mut dash = dashboard(Channel::Lights);
        let now = Instant::now();

        // The handle reports the new socket open before its event is handled
        dash.link().generation.set(2);
        dash.handle_intent(Intent::Toggle(key("5-a")), now);
        dash.handle_event(SessionEvent::Opened);

        assert!(dash.tracker().is_pending(&key("5-a")));
        assert_eq!(
            dash.handle_intent(Intent::Toggle(key("5-a")), now + Duration::from_millis(100)),
            IntentOutcome::Toggle(ToggleOutcome::Debounced)
        );
        assert_eq!(dash.link().sent.borrow().len(), 1);
    }

    #[test]
    fn test_undelivered_toggle_is_unwound() {
        let link = FakeLink::default();
        link.connected.set(true);
        let tracker =
            CommandTracker::new(PageView::default()).with_policy(SendFailurePolicy::Rollback);
        let mut dash = Dashboard::new(link, Channel::Lights, tracker);
        let now = Instant::now();

        dash.handle_intent(Intent::Toggle(key("5-a")), now);
        let frame = dash.link().sent.borrow()[0].clone();

        // Blind frames carry no tracker state
        dash.handle_event(SessionEvent::SendFailed {
            frame: r#"{"blind":"b1","position":10}"#.into(),
            reason: "session is disconnected".into(),
        });
        assert!(dash.tracker().is_pending(&key("5-a")));

        dash.handle_event(SessionEvent::SendFailed {
            frame,
            reason: "session is disconnected".into(),
        });

        assert!(!dash.tracker().is_pending(&key("5-a")));
        assert_eq!(dash.tracker().state(&key("5-a")), OutputState::Off);
        assert_eq!(
            dash.handle_intent(Intent::Toggle(key("5-a")), now + Duration::from_millis(10)),
            IntentOutcome::Toggle(ToggleOutcome::Sent(OutputState::On))
        );
    }

    #[test]
    fn test_toggles_rejected_on_channels_without_outputs() {
        let mut dash = dashboard(Channel::Heating);
        assert!(matches!(
            dash.handle_intent(Intent::Toggle(key("5-a")), Instant::now()),
            IntentOutcome::Rejected { .. }
        ));
        assert!(dash.link().sent.borrow().is_empty());
        assert_eq!(dash.tracker().pending_count(), 0);
    }

    #[test]
    fn test_relay_manager_requests_states_on_open() {
        let mut dash = dashboard(Channel::RelayManager);
        dash.handle_event(SessionEvent::Opened);
        assert_eq!(
            dash.link().sent.borrow().as_slice(),
            [r#"{"type":"get_states"}"#.to_string()]
        );

        let mut lights = dashboard(Channel::Lights);
        lights.handle_event(SessionEvent::Opened);
        assert!(lights.link().sent.borrow().is_empty());
    }

    #[test]
    fn test_light_state_reconciles_tracker() {
        let mut dash = dashboard(Channel::Lights);
        dash.handle_intent(Intent::Toggle(key("5-a")), Instant::now());

        dash.handle_event(message(
            r#"{"type":"light_state","relay_id":5,"output_id":"a","state":0}"#,
        ));

        assert!(!dash.tracker().is_pending(&key("5-a")));
        assert_eq!(dash.tracker().state(&key("5-a")), OutputState::Off);
    }

    #[test]
    fn test_configuration_repaints_known_outputs() {
        let mut dash = dashboard(Channel::Lights);
        dash.handle_event(message(
            r#"{"type":"light_state","relay_id":"1","output_id":"a","state":1}"#,
        ));
        dash.handle_event(message(r#"{"type":"update"}"#));
        assert!(dash.state().configuration_stale);

        dash.handle_event(message(
            r#"{"type":"configuration","named_outputs":{"1":{"a":["Hall",1]}},"sections":{"1":"Ground"}}"#,
        ));

        assert!(!dash.state().configuration_stale);
        assert!(dash.state().configuration.is_some());
        assert_eq!(
            dash.view().outputs,
            vec![
                ("1-a".to_string(), OutputState::On),
                ("1-a".to_string(), OutputState::On),
            ]
        );
    }

    #[test]
    fn test_blind_moves() {
        let mut dash = dashboard(Channel::Blinds);

        assert_eq!(
            dash.handle_intent(
                Intent::MoveBlind {
                    blind: "b1".into(),
                    slider: 200
                },
                Instant::now()
            ),
            IntentOutcome::Sent
        );
        assert_eq!(
            dash.link().sent.borrow().last().map(String::as_str),
            Some(r#"{"blind":"b1","position":799}"#)
        );

        assert!(matches!(
            dash.handle_intent(
                Intent::MoveBlind {
                    blind: "b1".into(),
                    slider: 1200
                },
                Instant::now()
            ),
            IntentOutcome::Rejected { .. }
        ));

        dash.handle_event(message(r#"{"blind":"b1","current_position":"799"}"#));
        assert_eq!(dash.state().blind_sliders.get("b1"), Some(&200));
        assert_eq!(dash.view().blinds, vec![("b1".to_string(), 200)]);
    }

    #[test]
    fn test_sends_are_dropped_while_disconnected() {
        let mut dash = dashboard(Channel::Heating);
        dash.link().connected.set(false);

        let outcome = dash.handle_intent(Intent::SetSetpoint("21.5".into()), Instant::now());

        assert!(matches!(outcome, IntentOutcome::Dropped { .. }));
        assert!(dash.link().sent.borrow().is_empty());
    }

    #[test]
    fn test_heating_telemetry_and_fleet() {
        let mut dash = dashboard(Channel::Heating);
        dash.handle_event(message(r#"{"cold":31.0,"mixed":40.0,"hot":55.0,"target":45}"#));
        assert_eq!(dash.state().telemetry.len(), 4);
        assert!(dash.state().telemetry_updated.is_some());

        dash.handle_event(message(
            r#"{"type":"online_status","online_relays":[1],"online_switches":[],"up_to_date_devices":{},"root_id":1,"devices_rssi":{}}"#,
        ));
        assert!(dash.state().fleet.is_online("1"));

        dash.handle_event(message(
            r#"{"type":"switch_state","switch_id":4,"button_id":"b"}"#,
        ));
        assert_eq!(
            dash.state().last_switch_press.get("4").map(String::as_str),
            Some("b")
        );
    }

    #[test]
    fn test_visibility_is_forwarded() {
        let mut dash = dashboard(Channel::Lights);
        assert_eq!(
            dash.handle_intent(Intent::Visibility(false), Instant::now()),
            IntentOutcome::Applied
        );
        assert_eq!(dash.link().visible.get(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_expires_pending_commands() {
        let mut dash = dashboard(Channel::Lights);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (intent_tx, intents) = mpsc::channel(8);

        let driver = tokio::spawn(async move {
            intent_tx.send(Intent::Toggle(key("5-a"))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2500)).await;
            drop(event_tx);
            intent_tx
        });

        // Runs until the event sender is dropped
        dash.run(events, intents).await.unwrap();
        let _intent_tx = driver.await.unwrap();

        assert_eq!(dash.tracker().pending_count(), 0);
        assert_eq!(dash.tracker().state(&key("5-a")), OutputState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_outlives_closed_intent_source() {
        let mut dash = dashboard(Channel::Lights);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (intent_tx, intents) = mpsc::channel(8);

        let driver = tokio::spawn(async move {
            drop(intent_tx);
            tokio::time::sleep(Duration::from_millis(100)).await;
            event_tx
                .send(SessionEvent::Message(
                    ServerMessage::decode(
                        r#"{"type":"light_state","relay_id":"5","output_id":"a","state":1}"#,
                    )
                    .unwrap(),
                ))
                .unwrap();
        });

        // Ends only when the event sender goes away with the driver
        dash.run(events, intents).await.unwrap();
        driver.await.unwrap();

        assert_eq!(dash.tracker().state(&key("5-a")), OutputState::On);
    }
}
