use log::{debug, info, warn};

use bay_common::{
    protocol, Action, ConnectTarget, ConnectionSnapshot, ConnectionSupervisor, ConsoleCommand,
    DetailedSnapshot, DeviceReadings, DisplayFrame, ExpanderCommand, Inbound, LinkAction,
    NetworkProbe, OutboundMessage, RuntimeConfig, SessionAction, SessionController,
};

/// Transport events, already detached from the transport that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Text(Vec<u8>),
    Ping,
    Pong,
    Error(String),
}

/// Numbers transport attempts so events from a replaced or aborted attempt are dropped.
///
/// Also folds repeated disconnects of one attempt into a single event.
#[derive(Debug, Default)]
pub struct AttemptFilter {
    current: u64,
    closed: bool,
}

impl AttemptFilter {
    /// Starts a new attempt and returns its tag.
    pub fn begin(&mut self) -> u64 {
        self.current += 1;
        self.closed = false;
        self.current
    }

    /// Retires the current attempt without starting another.
    pub fn retire(&mut self) {
        self.current += 1;
        self.closed = true;
    }

    pub fn accept(&mut self, attempt: u64, event: &LinkEvent) -> bool {
        if attempt != self.current {
            return false;
        }
        if *event == LinkEvent::Disconnected {
            if self.closed {
                return false;
            }
            self.closed = true;
        }
        true
    }
}

/// Work for the platform layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Relay(bool),
    Expander(ExpanderCommand, u8),
    Connect(ConnectTarget),
    Abort,
    Send(OutboundMessage),
}

/// Owns both state machines and turns events into [`Effect`]s.
pub struct Bay {
    runtime: RuntimeConfig,
    session: SessionController,
    link: ConnectionSupervisor,
    expander_image: u8,
}

impl Bay {
    pub fn new(runtime: RuntimeConfig) -> Self {
        let link = ConnectionSupervisor::new(&runtime);
        Self {
            runtime,
            session: SessionController::new(),
            link,
            expander_image: 0,
        }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn link(&self) -> &ConnectionSupervisor {
        &self.link
    }

    pub fn car_id(&self) -> &str {
        &self.runtime.device.car_id
    }

    pub fn record_sent(&mut self) {
        self.link.record_sent();
    }

    pub fn display_frame(&self, now_ms: u64) -> DisplayFrame {
        self.session
            .display_frame(now_ms, self.runtime.control.blink_ms)
    }

    pub fn health_check_target(
        &mut self,
        now_ms: u64,
        net: &dyn NetworkProbe,
    ) -> Option<(String, u16)> {
        self.link.health_check_target(now_ms, net)
    }

    pub fn on_link_event(
        &mut self,
        event: LinkEvent,
        now_ms: u64,
        net: &mut dyn NetworkProbe,
    ) -> Vec<Effect> {
        match event {
            LinkEvent::Connected => {
                self.link.on_connected(now_ms);
                Vec::new()
            }
            LinkEvent::Disconnected => {
                if let Some(summary) = self.link.on_disconnected(now_ms, net) {
                    info!(
                        "link closed after {}s, sent={} received={}",
                        summary.duration_ms / 1_000,
                        summary.sent,
                        summary.received
                    );
                }
                Vec::new()
            }
            LinkEvent::Text(payload) => {
                self.link.on_inbound(now_ms);
                match protocol::decode(&payload) {
                    Ok(inbound) => self.dispatch(inbound, now_ms),
                    Err(err) => {
                        warn!("dropping inbound frame: {err}");
                        Vec::new()
                    }
                }
            }
            LinkEvent::Ping | LinkEvent::Pong => {
                self.link.on_inbound(now_ms);
                Vec::new()
            }
            LinkEvent::Error(err) => {
                warn!("transport error: {err}");
                Vec::new()
            }
        }
    }

    /// Supervisor first, then the session timer.
    pub fn tick(
        &mut self,
        now_ms: u64,
        net: &mut dyn NetworkProbe,
        readings: &DeviceReadings,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        for action in self.link.tick(now_ms, net) {
            match action {
                LinkAction::Connect(target) => effects.push(Effect::Connect(target)),
                LinkAction::Abort => effects.push(Effect::Abort),
                LinkAction::AnnounceHello => {
                    if self.has_headroom(readings, "hello") {
                        effects.push(Effect::Send(self.hello_message(readings)));
                        effects.push(Effect::Send(self.status_message()));
                    }
                }
                LinkAction::Heartbeat => {
                    if self.has_headroom(readings, "heartbeat") {
                        effects.push(Effect::Send(self.heartbeat_message(readings)));
                    }
                }
            }
        }

        self.session.tick(now_ms);
        effects
    }

    /// Session timer only, for iterations without a network to supervise.
    #[cfg_attr(not(feature = "esp32"), allow(dead_code))]
    pub fn tick_session_only(&mut self, now_ms: u64) {
        self.session.tick(now_ms);
    }

    pub fn console_reply(
        &self,
        command: &ConsoleCommand,
        readings: &DeviceReadings,
        now_ms: u64,
    ) -> String {
        match command {
            ConsoleCommand::Detailed => {
                DetailedSnapshot::capture(self.car_id(), &self.session, &self.link, readings, now_ms)
                    .to_string()
            }
            ConsoleCommand::Compact => self.compact_json(now_ms),
            ConsoleCommand::Help => bay_common::diagnostics::HELP.to_string(),
            ConsoleCommand::Unknown(other) => {
                format!("unknown command `{other}`, type h for help")
            }
        }
    }

    pub fn compact_snapshot(&self, now_ms: u64) -> ConnectionSnapshot {
        ConnectionSnapshot::capture(self.car_id(), &self.link, now_ms)
    }

    pub fn compact_json(&self, now_ms: u64) -> String {
        self.compact_snapshot(now_ms)
            .to_json()
            .unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
    }

    fn dispatch(&mut self, inbound: Inbound, now_ms: u64) -> Vec<Effect> {
        match inbound {
            Inbound::Command(action) => {
                info!("command `{}`", action.as_str());
                if action == Action::Start {
                    info!("awaiting session data for duration");
                }
                let actions = self.session.handle_action(action, now_ms);
                self.session_effects(actions)
            }
            Inbound::Expander(command) => {
                self.expander_image = command.apply(self.expander_image);
                vec![Effect::Expander(command, self.expander_image)]
            }
            Inbound::UnknownAction(name) => {
                info!("ignoring unknown action `{name}`");
                Vec::new()
            }
            Inbound::SessionSync(sync) => {
                let actions = self.session.handle_session_sync(&sync, now_ms);
                self.session_effects(actions)
            }
            Inbound::OperationNotice { car_id, status } => {
                info!("operation notice for {car_id}: {status}");
                Vec::new()
            }
            Inbound::System(kind) => {
                info!("server message `{kind}`");
                Vec::new()
            }
            Inbound::Unknown => {
                debug!("unclassified inbound frame");
                Vec::new()
            }
        }
    }

    fn session_effects(&self, actions: Vec<SessionAction>) -> Vec<Effect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                SessionAction::RelayOn => effects.push(Effect::Relay(true)),
                SessionAction::RelayOff => effects.push(Effect::Relay(false)),
                SessionAction::PublishStatus(status) => {
                    info!("status -> {}", status.as_str());
                    if self.link.is_connected() {
                        effects.push(Effect::Send(self.status_message()));
                    }
                }
            }
        }
        effects
    }

    fn has_headroom(&self, readings: &DeviceReadings, what: &str) -> bool {
        let min = self.runtime.link.min_free_heap_bytes;
        if readings.has_headroom(min) {
            return true;
        }
        warn!(
            "skipping {what}: free heap {:?} below {min}",
            readings.free_heap
        );
        false
    }

    fn hello_message(&self, readings: &DeviceReadings) -> OutboundMessage {
        OutboundMessage::Hello {
            car_id: self.car_id().to_string(),
            ip: readings.ip.clone(),
            hostname: self.runtime.device.hostname.clone(),
            board: self.runtime.device.board.clone(),
        }
    }

    fn status_message(&self) -> OutboundMessage {
        OutboundMessage::Status {
            car_id: self.car_id().to_string(),
            status: self.session.status(),
            relay_on: self.session.is_relay_on(),
        }
    }

    fn heartbeat_message(&self, readings: &DeviceReadings) -> OutboundMessage {
        OutboundMessage::Heartbeat {
            car_id: self.car_id().to_string(),
            status: self.session.status(),
            relay_on: self.session.is_relay_on(),
            rssi: readings.rssi,
            ip: readings.ip.clone(),
            uptime_sec: readings.uptime_ms / 1_000,
            heap: readings.free_heap.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bay_common::{OperationStatus, ProbeOutcome};

    struct NoNet;

    impl NetworkProbe for NoNet {
        fn local_address(&self) -> Option<String> {
            Some("192.168.1.40".to_string())
        }

        fn probe(&mut self, _host: &str, _port: u16, _timeout_ms: u64) -> ProbeOutcome {
            ProbeOutcome::Unsupported
        }
    }

    fn bay() -> Bay {
        let mut runtime = RuntimeConfig::default();
        runtime.device.car_id = "CAR-9".to_string();
        runtime.network.server_host = "10.0.0.1".to_string();
        Bay::new(runtime)
    }

    fn readings(free_heap: Option<u32>) -> DeviceReadings {
        DeviceReadings {
            ip: "192.168.1.40".to_string(),
            rssi: -60,
            uptime_ms: 12_000,
            free_heap,
        }
    }

    fn text(raw: &str) -> LinkEvent {
        LinkEvent::Text(raw.as_bytes().to_vec())
    }

    #[test]
    fn first_tick_asks_for_a_connection() {
        let mut bay = bay();
        let effects = bay.tick(0, &mut NoNet, &readings(None));

        assert!(matches!(
            effects.as_slice(),
            [Effect::Connect(target)] if target.url() == "ws://10.0.0.1:8081/ws?carId=CAR-9"
        ));
    }

    #[test]
    fn session_data_engages_relay_and_reports_status() {
        let mut bay = bay();
        bay.on_link_event(LinkEvent::Connected, 0, &mut NoNet);

        let effects = bay.on_link_event(
            text(r#"{"type":"session_data","data":{"duration":300}}"#),
            100,
            &mut NoNet,
        );

        assert_eq!(
            effects,
            vec![
                Effect::Relay(true),
                Effect::Send(OutboundMessage::Status {
                    car_id: "CAR-9".to_string(),
                    status: OperationStatus::Active,
                    relay_on: true,
                })
            ]
        );
        assert_eq!(bay.link().frames_received(), 1);
    }

    #[test]
    fn status_is_not_sent_while_offline() {
        let mut bay = bay();

        let effects = bay.on_link_event(text(r#"{"action":"liberate_free"}"#), 0, &mut NoNet);

        assert_eq!(effects, vec![Effect::Relay(true)]);
        assert_eq!(bay.session().status(), OperationStatus::LiberatedFree);
    }

    #[test]
    fn expander_commands_accumulate_in_image() {
        let mut bay = bay();
        bay.on_link_event(text(r#"{"action":"hc595_pin_1_on"}"#), 0, &mut NoNet);

        let effects = bay.on_link_event(text(r#"{"action":"hc595_pin_4_on"}"#), 0, &mut NoNet);

        assert_eq!(
            effects,
            vec![Effect::Expander(
                ExpanderCommand::Pin { index: 4, on: true },
                0b0001_0010
            )]
        );
    }

    #[test]
    fn garbage_frames_are_dropped() {
        let mut bay = bay();
        let effects = bay.on_link_event(text("not json"), 0, &mut NoNet);

        assert!(effects.is_empty());
        assert_eq!(bay.session().status(), OperationStatus::Stopped);
    }

    #[test]
    fn hello_then_status_after_delay() {
        let mut bay = bay();
        bay.on_link_event(LinkEvent::Connected, 0, &mut NoNet);

        let effects = bay.tick(5_000, &mut NoNet, &readings(Some(50_000)));
        let kinds: Vec<&str> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(message) => Some(message.kind()),
                _ => None,
            })
            .collect();

        assert_eq!(kinds, vec!["hello", "status", "heartbeat"]);
    }

    #[test]
    fn low_heap_skips_outbound_traffic() {
        let mut bay = bay();
        bay.on_link_event(LinkEvent::Connected, 0, &mut NoNet);

        let effects = bay.tick(5_000, &mut NoNet, &readings(Some(2_000)));

        assert!(effects.is_empty());
        assert!(!bay.link().hello_pending());
    }

    #[test]
    fn aborted_attempt_events_are_dropped() {
        let mut attempts = AttemptFilter::default();
        let aborted = attempts.begin();
        attempts.retire();

        assert!(!attempts.accept(aborted, &LinkEvent::Connected));
        assert!(!attempts.accept(aborted, &LinkEvent::Disconnected));

        let next = attempts.begin();
        assert!(!attempts.accept(aborted, &LinkEvent::Connected));
        assert!(attempts.accept(next, &LinkEvent::Connected));
    }

    #[test]
    fn one_disconnect_per_attempt() {
        let mut attempts = AttemptFilter::default();
        let attempt = attempts.begin();

        assert!(attempts.accept(attempt, &LinkEvent::Disconnected));
        assert!(!attempts.accept(attempt, &LinkEvent::Disconnected));
        let next = attempts.begin();
        assert!(attempts.accept(next, &LinkEvent::Disconnected));
    }

    #[test]
    fn console_replies() {
        let bay = bay();
        let now = 0;

        assert_eq!(
            bay.console_reply(&ConsoleCommand::Compact, &readings(None), now),
            r#"{"carId":"CAR-9","online":false,"lastSeenSec":null}"#
        );
        assert!(bay
            .console_reply(&ConsoleCommand::Unknown("x".to_string()), &readings(None), now)
            .contains("type h for help"));
    }
}
