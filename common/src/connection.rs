//! Link supervision: when to connect, to which host, and how long to back off.
//!
//! The supervisor never touches the transport. The run loop feeds it transport events
//! (`on_connected`, `on_disconnected`, `on_inbound`) and executes the [`LinkAction`]s
//! returned from [`ConnectionSupervisor::tick`].

use log::{debug, info, warn};

use crate::{
    config::RuntimeConfig,
    timing::{Backoff, Cadence, Deferred},
    types::{ConnectTarget, LinkAction},
};

/// Shortest probe worth making; a smaller share of the budget skips probing.
const MIN_PROBE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable,
    Unsupported,
}

/// What the supervisor needs to know about the local network.
pub trait NetworkProbe {
    /// This device's own address, if it has one yet.
    fn local_address(&self) -> Option<String>;

    /// Bounded reachability check used to prefer live hosts when rotating.
    fn probe(&mut self, _host: &str, _port: u16, _timeout_ms: u64) -> ProbeOutcome {
        ProbeOutcome::Unsupported
    }
}

/// Per-connection traffic summary, produced when a live link drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSummary {
    pub duration_ms: u64,
    pub sent: u32,
    pub received: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    hosts: Vec<String>,
    current_index: usize,
    port: u16,
    path: String,

    backoff: Backoff,
    base_retry_ms: u64,
    handshake_timeout_ms: u64,
    probe_timeout_ms: u64,
    next_allowed_at_ms: u64,

    connect_once: bool,
    attempts: u32,
    gave_up: bool,

    in_handshake: bool,
    handshake_started_at_ms: Option<u64>,
    connected: bool,
    connected_at_ms: Option<u64>,
    last_inbound_ms: Option<u64>,
    frames_sent: u32,
    frames_received: u32,

    hello_delay_ms: u64,
    hello: Deferred,
    heartbeat_enabled: bool,
    heartbeat: Cadence,
    health: Cadence,
}

impl ConnectionSupervisor {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        let link = &runtime.link;
        Self {
            hosts: runtime.host_list(),
            current_index: 0,
            port: runtime.network.server_port,
            path: runtime.ws_path(),
            backoff: Backoff::new(link.base_retry_ms, link.max_retry_ms),
            base_retry_ms: link.base_retry_ms,
            handshake_timeout_ms: link.handshake_timeout_ms,
            probe_timeout_ms: link.probe_timeout_ms,
            next_allowed_at_ms: 0,
            connect_once: link.connect_once,
            attempts: 0,
            gave_up: false,
            in_handshake: false,
            handshake_started_at_ms: None,
            connected: false,
            connected_at_ms: None,
            last_inbound_ms: None,
            frames_sent: 0,
            frames_received: 0,
            hello_delay_ms: link.hello_delay_ms,
            hello: Deferred::default(),
            heartbeat_enabled: link.heartbeat_enabled,
            heartbeat: Cadence::new(link.heartbeat_ms),
            health: Cadence::new(link.healthcheck_interval_ms),
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_host(&self) -> &str {
        &self.hosts[self.current_index]
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_in_handshake(&self) -> bool {
        self.in_handshake
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff.current_ms()
    }

    pub fn next_allowed_at_ms(&self) -> u64 {
        self.next_allowed_at_ms
    }

    pub fn frames_sent(&self) -> u32 {
        self.frames_sent
    }

    pub fn frames_received(&self) -> u32 {
        self.frames_received
    }

    pub fn last_inbound_ms(&self) -> Option<u64> {
        self.last_inbound_ms
    }

    pub fn last_seen_sec(&self, now_ms: u64) -> Option<u64> {
        self.last_inbound_ms
            .map(|last| now_ms.saturating_sub(last) / 1_000)
    }

    pub fn hello_pending(&self) -> bool {
        self.hello.is_pending()
    }

    pub fn tick(&mut self, now_ms: u64, net: &mut dyn NetworkProbe) -> Vec<LinkAction> {
        let mut actions = Vec::new();

        if self.connected {
            if self.hello.take_if_due(now_ms) {
                actions.push(LinkAction::AnnounceHello);
            }
            if self.heartbeat_enabled && self.heartbeat.fire_if_due(now_ms) {
                actions.push(LinkAction::Heartbeat);
            }
            return actions;
        }

        if self.gave_up {
            return actions;
        }

        if self.in_handshake {
            let started = self.handshake_started_at_ms.unwrap_or(now_ms);
            if now_ms.saturating_sub(started) > self.handshake_timeout_ms {
                warn!(
                    "handshake with {} timed out after {}ms",
                    self.current_host(),
                    self.handshake_timeout_ms
                );
                self.in_handshake = false;
                self.handshake_started_at_ms = None;
                actions.push(LinkAction::Abort);
                if self.connect_once {
                    warn!("single-attempt mode, giving up");
                    self.gave_up = true;
                } else {
                    self.next_allowed_at_ms = now_ms.saturating_add(self.base_retry_ms);
                    self.rotate_host(net);
                }
            }
            return actions;
        }

        if now_ms < self.next_allowed_at_ms {
            return actions;
        }
        if self.connect_once && self.attempts > 0 {
            return actions;
        }

        if let Some(target) = self.connect(now_ms, net) {
            actions.push(LinkAction::Connect(target));
        }
        actions
    }

    /// Resolves the current host and starts a handshake with it.
    pub fn connect(&mut self, now_ms: u64, net: &mut dyn NetworkProbe) -> Option<ConnectTarget> {
        let local = net.local_address();

        if self.current_host().is_empty() {
            debug!("host slot {} is empty, skipping", self.current_index);
            self.rotate_host(net);
            self.skip_attempt(now_ms);
            return None;
        }

        if is_self(self.current_host(), local.as_deref()) {
            warn!(
                "host {} is this device, trying the next one",
                self.current_host()
            );
            self.rotate_host(net);
            let host = self.current_host();
            if host.is_empty() || is_self(host, local.as_deref()) {
                warn!("no usable server host");
                self.skip_attempt(now_ms);
                return None;
            }
        }

        let target = ConnectTarget {
            host: self.current_host().to_string(),
            port: self.port,
            path: self.path.clone(),
        };
        self.in_handshake = true;
        self.handshake_started_at_ms = Some(now_ms);
        self.attempts = self.attempts.saturating_add(1);
        info!(
            "connecting to {} (attempt {})",
            target.url(),
            self.attempts
        );
        Some(target)
    }

    pub fn on_connected(&mut self, now_ms: u64) {
        info!("link up with {}", self.current_host());
        self.connected = true;
        self.in_handshake = false;
        self.handshake_started_at_ms = None;
        self.connected_at_ms = Some(now_ms);
        self.frames_sent = 0;
        self.frames_received = 0;
        self.backoff.reset();
        self.next_allowed_at_ms = now_ms.saturating_add(self.base_retry_ms);
        self.hello.schedule(now_ms, self.hello_delay_ms);
        self.heartbeat.restart(now_ms);
    }

    /// Records a lost link or a failed attempt. Returns the traffic summary when a live
    /// link went down.
    pub fn on_disconnected(
        &mut self,
        now_ms: u64,
        net: &mut dyn NetworkProbe,
    ) -> Option<LinkSummary> {
        let summary = self.connected.then(|| LinkSummary {
            duration_ms: self
                .connected_at_ms
                .map(|at| now_ms.saturating_sub(at))
                .unwrap_or_default(),
            sent: self.frames_sent,
            received: self.frames_received,
        });

        self.connected = false;
        self.connected_at_ms = None;
        self.in_handshake = false;
        self.handshake_started_at_ms = None;
        self.hello.clear();
        self.health.disarm();

        if self.gave_up {
            return summary;
        }
        if self.connect_once {
            warn!("link lost in single-attempt mode, not retrying");
            self.gave_up = true;
            return summary;
        }

        let delay = self.backoff.next_delay();
        self.next_allowed_at_ms = now_ms.saturating_add(delay);
        info!("link down, retrying in {delay}ms");
        self.rotate_host(net);
        summary
    }

    pub fn on_inbound(&mut self, now_ms: u64) {
        self.frames_received = self.frames_received.saturating_add(1);
        self.last_inbound_ms = Some(now_ms);
    }

    pub fn record_sent(&mut self) {
        self.frames_sent = self.frames_sent.saturating_add(1);
    }

    /// Moves to the next usable host, preferring one that answers a probe.
    ///
    /// Visits every other slot at most once. All probes of one rotation share
    /// `probe_timeout_ms` between them. The index stays put when no other slot holds a
    /// usable host.
    pub fn rotate_host(&mut self, net: &mut dyn NetworkProbe) {
        let len = self.hosts.len();
        if len <= 1 {
            return;
        }

        let local = net.local_address();
        let candidates: Vec<usize> = (1..len)
            .map(|step| (self.current_index + step) % len)
            .filter(|&index| {
                let host = &self.hosts[index];
                !host.is_empty() && !is_self(host, local.as_deref())
            })
            .collect();

        let Some(&first) = candidates.first() else {
            warn!("no alternative server host available");
            return;
        };

        let mut chosen = first;
        let mut budget_ms = self.probe_timeout_ms;
        for (probed, &index) in candidates.iter().enumerate() {
            let timeout_ms = budget_ms / (candidates.len() - probed) as u64;
            if timeout_ms < MIN_PROBE_MS {
                debug!("probe budget too small, skipping reachability checks");
                break;
            }
            budget_ms -= timeout_ms;
            match net.probe(&self.hosts[index], self.port, timeout_ms) {
                ProbeOutcome::Reachable => {
                    chosen = index;
                    break;
                }
                ProbeOutcome::Unreachable => {
                    debug!("{} did not answer", self.hosts[index]);
                }
                ProbeOutcome::Unsupported => break,
            }
        }

        self.current_index = chosen;
        info!("next server host {}", self.current_host());
    }

    /// Host and port worth a health check right now, at most once per interval while the
    /// link is down.
    pub fn health_check_target(
        &mut self,
        now_ms: u64,
        net: &dyn NetworkProbe,
    ) -> Option<(String, u16)> {
        if self.connected || self.in_handshake || self.gave_up {
            return None;
        }
        let host = self.current_host();
        if host.is_empty() || is_self(host, net.local_address().as_deref()) {
            return None;
        }
        if !self.health.fire_if_due(now_ms) {
            return None;
        }
        Some((self.current_host().to_string(), self.port))
    }

    fn skip_attempt(&mut self, now_ms: u64) {
        if self.connect_once {
            self.gave_up = true;
        } else {
            self.next_allowed_at_ms = now_ms.saturating_add(self.base_retry_ms);
        }
    }
}

fn is_self(host: &str, local: Option<&str>) -> bool {
    local.map(|local| local == host).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct MockNet {
        local: Option<String>,
        reachable: Option<Vec<String>>,
        probed: Vec<String>,
        waited_ms: u64,
    }

    impl MockNet {
        fn at(local: &str) -> Self {
            Self {
                local: Some(local.to_string()),
                ..Self::default()
            }
        }
    }

    impl NetworkProbe for MockNet {
        fn local_address(&self) -> Option<String> {
            self.local.clone()
        }

        fn probe(&mut self, host: &str, _port: u16, timeout_ms: u64) -> ProbeOutcome {
            self.probed.push(host.to_string());
            self.waited_ms += timeout_ms;
            match &self.reachable {
                Some(hosts) if hosts.iter().any(|h| h == host) => ProbeOutcome::Reachable,
                Some(_) => ProbeOutcome::Unreachable,
                None => ProbeOutcome::Unsupported,
            }
        }
    }

    fn supervisor(primary: &str, fallbacks: &[&str]) -> ConnectionSupervisor {
        let mut runtime = RuntimeConfig::default();
        runtime.network.server_host = primary.to_string();
        runtime.network.fallback_hosts = fallbacks.iter().map(|h| h.to_string()).collect();
        ConnectionSupervisor::new(&runtime)
    }

    fn single_attempt(primary: &str) -> ConnectionSupervisor {
        let mut runtime = RuntimeConfig::default();
        runtime.network.server_host = primary.to_string();
        runtime.link.connect_once = true;
        ConnectionSupervisor::new(&runtime)
    }

    #[test]
    fn consecutive_disconnects_double_the_delay() {
        let mut link = supervisor("10.0.0.1", &["10.0.0.2"]);
        let mut net = MockNet::default();
        let mut delays = Vec::new();

        for now in [1_000, 2_000, 3_000] {
            link.on_disconnected(now, &mut net);
            delays.push(link.next_allowed_at_ms() - now);
        }

        assert_eq!(delays, vec![3_000, 6_000, 12_000]);
    }

    #[test]
    fn backoff_never_exceeds_max() {
        let mut link = supervisor("10.0.0.1", &[]);
        let mut net = MockNet::default();
        let mut previous = 0;

        for now in 0..10 {
            link.on_disconnected(now, &mut net);
            assert!(link.backoff_ms() >= previous);
            assert!(link.backoff_ms() <= 30_000);
            previous = link.backoff_ms();
        }
        assert_eq!(previous, 30_000);
    }

    #[test]
    fn successful_connect_restarts_backoff_from_base() {
        let mut link = supervisor("10.0.0.1", &[]);
        let mut net = MockNet::default();
        for now in 0..5 {
            link.on_disconnected(now, &mut net);
        }

        link.on_connected(10_000);
        assert_eq!(link.next_allowed_at_ms(), 13_000);

        link.on_disconnected(20_000, &mut net);
        assert_eq!(link.next_allowed_at_ms(), 23_000);
    }

    #[test]
    fn first_tick_connects_to_primary() {
        let mut link = supervisor("10.0.0.1", &["10.0.0.2"]);
        let mut net = MockNet::default();

        let actions = link.tick(0, &mut net);

        assert_eq!(
            actions,
            vec![LinkAction::Connect(ConnectTarget {
                host: "10.0.0.1".to_string(),
                port: 8081,
                path: "/ws?carId=CAR-UNDEFINED".to_string(),
            })]
        );
        assert!(link.is_in_handshake());
        assert!(link.tick(50, &mut net).is_empty());
    }

    #[test]
    fn handshake_timeout_rotates_and_waits_base_retry() {
        let mut link = supervisor("10.0.0.1", &["10.0.0.2"]);
        let mut net = MockNet::default();
        link.tick(0, &mut net);

        assert!(link.tick(8_000, &mut net).is_empty());
        assert_eq!(link.tick(8_001, &mut net), vec![LinkAction::Abort]);

        assert!(!link.is_in_handshake());
        assert_eq!(link.current_host(), "10.0.0.2");
        assert_eq!(link.next_allowed_at_ms(), 11_001);
        assert!(link.tick(11_000, &mut net).is_empty());
        assert!(matches!(
            link.tick(11_001, &mut net).as_slice(),
            [LinkAction::Connect(target)] if target.host == "10.0.0.2"
        ));
    }

    #[test]
    fn single_attempt_gives_up_after_handshake_timeout() {
        let mut link = single_attempt("10.0.0.1");
        let mut net = MockNet::default();
        assert_eq!(link.tick(0, &mut net).len(), 1);

        link.tick(9_000, &mut net);
        assert!(link.has_given_up());

        for now in (10_000..600_000).step_by(5_000) {
            assert!(link.tick(now, &mut net).is_empty());
        }
        assert_eq!(link.attempts(), 1);
    }

    #[test]
    fn single_attempt_does_not_retry_after_disconnect() {
        let mut link = single_attempt("10.0.0.1");
        let mut net = MockNet::default();
        link.tick(0, &mut net);
        link.on_connected(100);

        link.on_disconnected(5_000, &mut net);

        assert!(link.has_given_up());
        assert!(link.tick(60_000, &mut net).is_empty());
    }

    #[test]
    fn rotation_skips_self_and_empty_entries() {
        let mut link = supervisor("10.0.0.1", &["", "192.168.1.50", "10.0.0.9"]);
        let mut net = MockNet::at("192.168.1.50");

        link.rotate_host(&mut net);
        assert_eq!(link.current_host(), "10.0.0.9");

        link.rotate_host(&mut net);
        assert_eq!(link.current_host(), "10.0.0.1");
    }

    #[test]
    fn rotation_without_alternatives_keeps_current_host() {
        let mut link = supervisor("10.0.0.1", &["", "192.168.1.50", ""]);
        let mut net = MockNet::at("192.168.1.50");

        link.rotate_host(&mut net);

        assert_eq!(link.current_index(), 0);
    }

    #[test]
    fn rotation_prefers_reachable_host() {
        let mut link = supervisor("10.0.0.1", &["10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        let mut net = MockNet {
            reachable: Some(vec!["10.0.0.4".to_string()]),
            ..MockNet::default()
        };

        link.rotate_host(&mut net);

        assert_eq!(link.current_host(), "10.0.0.4");
        assert_eq!(net.probed, vec!["10.0.0.2", "10.0.0.3", "10.0.0.4"]);
    }

    #[test]
    fn rotation_falls_back_to_next_when_nothing_answers() {
        let mut link = supervisor("10.0.0.1", &["10.0.0.2", "10.0.0.3"]);
        let mut net = MockNet {
            reachable: Some(Vec::new()),
            ..MockNet::default()
        };

        link.rotate_host(&mut net);

        assert_eq!(link.current_host(), "10.0.0.2");
        assert_eq!(net.probed.len(), 2);
    }

    #[test]
    fn rotation_probes_share_one_timeout() {
        let fallbacks = [
            "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6", "10.0.0.7",
        ];
        let mut link = supervisor("10.0.0.1", &fallbacks);
        let mut net = MockNet {
            reachable: Some(Vec::new()),
            ..MockNet::default()
        };

        link.on_disconnected(1_000, &mut net);

        assert_eq!(net.probed.len(), 6);
        assert!(net.waited_ms <= 2_000, "rotation waited {}ms", net.waited_ms);
        assert_eq!(link.current_host(), "10.0.0.2");
    }

    #[test]
    fn tiny_probe_budget_skips_probing() {
        let mut runtime = RuntimeConfig::default();
        runtime.network.server_host = "10.0.0.1".to_string();
        runtime.network.fallback_hosts = vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()];
        runtime.link.probe_timeout_ms = 150;
        let mut link = ConnectionSupervisor::new(&runtime);
        let mut net = MockNet {
            reachable: Some(vec!["10.0.0.3".to_string()]),
            ..MockNet::default()
        };

        link.rotate_host(&mut net);

        assert!(net.probed.is_empty());
        assert_eq!(link.current_host(), "10.0.0.2");
    }

    #[test]
    fn connect_skips_own_address() {
        let mut link = supervisor("192.168.1.50", &["10.0.0.2"]);
        let mut net = MockNet::at("192.168.1.50");

        let target = link.connect(0, &mut net);

        assert_eq!(target.map(|t| t.host), Some("10.0.0.2".to_string()));
    }

    #[test]
    fn connect_to_self_only_is_terminal_in_single_attempt_mode() {
        let mut link = single_attempt("192.168.1.50");
        let mut net = MockNet::at("192.168.1.50");

        assert!(link.tick(0, &mut net).is_empty());
        assert!(link.has_given_up());
        assert!(link.tick(60_000, &mut net).is_empty());
    }

    #[test]
    fn connect_to_self_only_retries_later_otherwise() {
        let mut link = supervisor("192.168.1.50", &[]);
        let mut net = MockNet::at("192.168.1.50");

        assert!(link.tick(0, &mut net).is_empty());
        assert!(!link.has_given_up());
        assert_eq!(link.next_allowed_at_ms(), 3_000);
    }

    #[test]
    fn hello_fires_once_after_delay() {
        let mut link = supervisor("10.0.0.1", &[]);
        let mut net = MockNet::default();
        link.tick(0, &mut net);
        link.on_connected(1_000);

        assert!(link.tick(5_999, &mut net).is_empty());
        assert_eq!(
            link.tick(6_000, &mut net),
            vec![LinkAction::AnnounceHello, LinkAction::Heartbeat]
        );
        assert!(link.tick(6_050, &mut net).is_empty());
        assert_eq!(link.tick(11_000, &mut net), vec![LinkAction::Heartbeat]);
    }

    #[test]
    fn pending_hello_is_dropped_on_disconnect() {
        let mut link = supervisor("10.0.0.1", &[]);
        let mut net = MockNet::default();
        link.on_connected(0);

        link.on_disconnected(2_000, &mut net);
        link.on_connected(4_000);

        assert!(link.tick(6_000, &mut net).is_empty());
        assert_eq!(link.tick(9_000, &mut net)[0], LinkAction::AnnounceHello);
    }

    #[test]
    fn frame_counters_reset_on_each_connection() {
        let mut link = supervisor("10.0.0.1", &[]);
        let mut net = MockNet::default();
        link.on_connected(0);
        link.record_sent();
        link.on_inbound(500);
        link.on_inbound(900);

        let summary = link.on_disconnected(2_000, &mut net);
        assert_eq!(
            summary,
            Some(LinkSummary {
                duration_ms: 2_000,
                sent: 1,
                received: 2,
            })
        );

        link.on_connected(10_000);
        assert_eq!(link.frames_sent(), 0);
        assert_eq!(link.frames_received(), 0);
        assert_eq!(link.last_seen_sec(10_900), Some(10));
    }

    #[test]
    fn failed_attempt_has_no_summary() {
        let mut link = supervisor("10.0.0.1", &[]);
        let mut net = MockNet::default();
        link.tick(0, &mut net);

        assert_eq!(link.on_disconnected(500, &mut net), None);
        assert!(!link.is_in_handshake());
    }

    #[test]
    fn health_check_only_while_down() {
        let mut link = supervisor("10.0.0.1", &[]);
        let net = MockNet::default();

        assert_eq!(
            link.health_check_target(0, &net),
            Some(("10.0.0.1".to_string(), 8081))
        );
        assert_eq!(link.health_check_target(14_999, &net), None);
        assert!(link.health_check_target(15_000, &net).is_some());

        link.on_connected(16_000);
        assert_eq!(link.health_check_target(40_000, &net), None);
    }
}
