use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs, UdpSocket},
    path::PathBuf,
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use bay_common::{
    ConnectTarget, ConnectionSnapshot, ConsoleCommand, DeviceReadings, DisplayFrame,
    NetworkProbe, OperationStatus, ProbeOutcome, RuntimeConfig, WifiAction, WifiWatch,
};

use crate::bay::{AttemptFilter, Bay, Effect, LinkEvent};

const DEFAULT_STATUS_PORT: u16 = 8080;
const HEALTH_PROBE_TIMEOUT_MS: u64 = 2_500;

#[derive(Debug, Clone, Serialize)]
struct StatusView {
    #[serde(flatten)]
    connection: ConnectionSnapshot,
    status: OperationStatus,
    #[serde(rename = "relayOn")]
    relay_on: bool,
    #[serde(rename = "remainingSeconds")]
    remaining_seconds: u32,
    #[serde(rename = "extraSeconds")]
    extra_seconds: u32,
    host: String,
    display: DisplayFrame,
}

/// Desktop stand-in for the device network: knows its outbound address and can probe
/// hosts over TCP.
struct HostNet {
    local: Option<String>,
}

impl HostNet {
    fn discover(runtime: &RuntimeConfig) -> Self {
        let local = UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect((runtime.network.server_host.as_str(), runtime.network.server_port))?;
                socket.local_addr()
            })
            .ok()
            .and_then(|addr| self_address(addr.ip()));
        Self { local }
    }
}

/// Loopback and unspecified addresses are shared with any local server, so they never
/// identify this device.
fn self_address(ip: IpAddr) -> Option<String> {
    (!ip.is_loopback() && !ip.is_unspecified()).then(|| ip.to_string())
}

impl NetworkProbe for HostNet {
    fn local_address(&self) -> Option<String> {
        self.local.clone()
    }

    fn probe(&mut self, host: &str, port: u16, timeout_ms: u64) -> ProbeOutcome {
        let reachable = tokio::task::block_in_place(|| probe_tcp(host, port, timeout_ms));
        if reachable {
            ProbeOutcome::Reachable
        } else {
            ProbeOutcome::Unreachable
        }
    }
}

/// WebSocket client running in its own task; events come back tagged with the attempt
/// that produced them so a dropped attempt cannot leak late events.
struct WsTransport {
    attempts: AttemptFilter,
    task: Option<JoinHandle<()>>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
}

impl WsTransport {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            attempts: AttemptFilter::default(),
            task: None,
            outgoing: None,
            events_tx,
            events_rx,
        }
    }

    fn connect(&mut self, target: &ConnectTarget) {
        self.abort();
        let attempt = self.attempts.begin();

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(outgoing_tx);
        self.task = Some(tokio::spawn(run_socket(
            target.url(),
            attempt,
            self.events_tx.clone(),
            outgoing_rx,
        )));
    }

    fn abort(&mut self) {
        self.attempts.retire();
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn send(&self, text: String) -> bool {
        self.outgoing
            .as_ref()
            .map(|outgoing| outgoing.send(text).is_ok())
            .unwrap_or(false)
    }

    fn poll(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok((attempt, event)) = self.events_rx.try_recv() {
            if self.attempts.accept(attempt, &event) {
                events.push(event);
            }
        }
        events
    }
}

/// Simulated relay; logs transitions.
#[derive(Default)]
struct Relay {
    on: bool,
}

impl Relay {
    fn set(&mut self, on: bool) {
        if self.on != on {
            self.on = on;
            info!("relay {}", if on { "ON" } else { "OFF" });
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    ensure_host_defaults(&mut runtime);
    runtime.sanitize();
    runtime.validate().context("invalid runtime config")?;

    info!(
        "bay {} -> {}:{} ({} candidate hosts, connect_once={})",
        runtime.device.car_id,
        runtime.network.server_host,
        runtime.network.server_port,
        runtime.host_list().len(),
        runtime.link.connect_once
    );

    let status_port = std::env::var("BAY_STATUS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_STATUS_PORT);

    let mut net = HostNet::discover(&runtime);
    let mut bay = Bay::new(runtime);
    let (status_tx, status_rx) = watch::channel(status_view(&bay, monotonic_ms()));

    spawn_status_server(status_port, status_rx).await?;
    let mut console = spawn_console_reader();

    let mut transport = WsTransport::new();
    let mut relay = Relay::default();
    let mut wifi = WifiWatch::new(&bay.runtime().control, monotonic_ms());
    let mut last_frame: Option<DisplayFrame> = None;

    let mut interval =
        tokio::time::interval(Duration::from_millis(bay.runtime().control.loop_delay_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => {
                info!("shutting down");
                transport.abort();
                relay.set(false);
                return Ok(());
            }
        }

        let now_ms = monotonic_ms();
        let readings = device_readings(&net, now_ms);

        // The desktop host has no radio to lose.
        if wifi.observe(now_ms, true) != WifiAction::None {
            warn!("unexpected wifi action on host");
        }
        if let Some((host, port)) = bay.health_check_target(now_ms, &net) {
            spawn_health_probe(host, port);
        }

        for event in transport.poll() {
            let effects = bay.on_link_event(event, now_ms, &mut net);
            execute_effects(&mut bay, &mut transport, &mut relay, now_ms, effects);
        }

        let effects = bay.tick(now_ms, &mut net, &readings);
        execute_effects(&mut bay, &mut transport, &mut relay, now_ms, effects);

        let frame = bay.display_frame(now_ms);
        if last_frame.as_ref() != Some(&frame) {
            debug!("display [{}]", frame.text);
            last_frame = Some(frame);
        }

        while let Ok(line) = console.try_recv() {
            if let Some(command) = ConsoleCommand::parse(&line) {
                println!("{}", bay.console_reply(&command, &readings, now_ms));
            }
        }

        status_tx.send_replace(status_view(&bay, now_ms));
    }
}

fn execute_effects(
    bay: &mut Bay,
    transport: &mut WsTransport,
    relay: &mut Relay,
    now_ms: u64,
    effects: Vec<Effect>,
) {
    for effect in effects {
        match effect {
            Effect::Relay(on) => relay.set(on),
            Effect::Expander(command, image) => {
                info!("expander {command:?} -> {image:#010b}");
            }
            Effect::Connect(target) => transport.connect(&target),
            Effect::Abort => transport.abort(),
            Effect::Send(message) => {
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(err) => {
                        warn!("failed to encode {}: {err}", message.kind());
                        continue;
                    }
                };

                let log = &bay.runtime().log;
                let echo = match message.kind() {
                    "heartbeat" => log.heartbeat_json,
                    "status" => log.status_json,
                    _ => log.verbose,
                };
                if echo {
                    info!("-> {json}");
                }

                if !transport.send(json) {
                    warn!("{} not sent, link is down", message.kind());
                    continue;
                }
                bay.record_sent();

                if message.kind() == "heartbeat" && !bay.runtime().log.verbose {
                    println!("{}", bay.compact_json(now_ms));
                }
            }
        }
    }
}

async fn run_socket(
    url: String,
    attempt: u64,
    events: mpsc::UnboundedSender<(u64, LinkEvent)>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            let _ = events.send((attempt, LinkEvent::Error(err.to_string())));
            let _ = events.send((attempt, LinkEvent::Disconnected));
            return;
        }
    };

    let _ = events.send((attempt, LinkEvent::Connected));
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = read.next() => {
                let event = match frame {
                    Some(Ok(Message::Text(text))) => LinkEvent::Text(text.into_bytes()),
                    Some(Ok(Message::Ping(_))) => LinkEvent::Ping,
                    Some(Ok(Message::Pong(_))) => LinkEvent::Pong,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        let _ = events.send((attempt, LinkEvent::Error(err.to_string())));
                        break;
                    }
                };
                if events.send((attempt, event)).is_err() {
                    return;
                }
            }
            text = outgoing.recv() => {
                let Some(text) = text else {
                    break;
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    let _ = events.send((attempt, LinkEvent::Error(err.to_string())));
                    break;
                }
            }
        }
    }

    let _ = events.send((attempt, LinkEvent::Disconnected));
}

async fn spawn_status_server(
    port: u16,
    status: watch::Receiver<StatusView>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .with_state(status);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;
    info!("status view on http://{addr}/api/status");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("status server stopped: {err}");
        }
    });
    Ok(())
}

async fn handle_get_status(State(status): State<watch::Receiver<StatusView>>) -> impl IntoResponse {
    let view = status.borrow().clone();
    Json(view)
}

fn spawn_console_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!("console read failed: {err}");
                    return;
                }
            }
        }
    });
    rx
}

fn spawn_health_probe(host: String, port: u16) {
    tokio::spawn(async move {
        let connect = TcpStream::connect((host.as_str(), port));
        match tokio::time::timeout(Duration::from_millis(HEALTH_PROBE_TIMEOUT_MS), connect).await {
            Ok(Ok(_)) => info!("health check {host}:{port} reachable"),
            Ok(Err(err)) => warn!("health check {host}:{port} failed: {err}"),
            Err(_) => warn!("health check {host}:{port} timed out"),
        }
    });
}

fn probe_tcp(host: &str, port: u16, timeout_ms: u64) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    let timeout = Duration::from_millis(timeout_ms);
    addrs
        .into_iter()
        .any(|addr| StdTcpStream::connect_timeout(&addr, timeout).is_ok())
}

fn status_view(bay: &Bay, now_ms: u64) -> StatusView {
    let session = bay.session();
    StatusView {
        connection: bay.compact_snapshot(now_ms),
        status: session.status(),
        relay_on: session.is_relay_on(),
        remaining_seconds: session.remaining_seconds(),
        extra_seconds: session.extra_seconds(),
        host: bay.link().current_host().to_string(),
        display: bay.display_frame(now_ms),
    }
}

fn device_readings(net: &HostNet, now_ms: u64) -> DeviceReadings {
    DeviceReadings {
        ip: net.local.clone().unwrap_or_default(),
        rssi: 0,
        uptime_ms: now_ms,
        free_heap: None,
    }
}

async fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let Some(path) = std::env::var_os("BAY_CONFIG").map(PathBuf::from) else {
        return Ok(RuntimeConfig::default());
    };
    match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("{} not found, using defaults", path.display());
            Ok(RuntimeConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(car_id) = std::env::var("BAY_CAR_ID") {
        runtime.device.car_id = car_id;
    }
    if let Ok(host) = std::env::var("BAY_WS_HOST") {
        runtime.network.server_host = host;
    }
    if let Some(port) = std::env::var("BAY_WS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.server_port = port;
    }
    if let Ok(hosts) = std::env::var("BAY_FALLBACK_HOSTS") {
        runtime.network.fallback_hosts = hosts.split(',').map(str::to_string).collect();
    }
    if let Ok(value) = std::env::var("BAY_CONNECT_ONCE") {
        runtime.link.connect_once = matches!(value.trim(), "1" | "true" | "yes");
    }
}

fn ensure_host_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.server_host.trim().is_empty() {
        runtime.network.server_host = "127.0.0.1".to_string();
    }
    if runtime.device.hostname.is_empty() {
        runtime.device.hostname = format!("bay-{}", runtime.device.car_id.to_lowercase());
    }
    if runtime.device.board == "ESP32" {
        runtime.device.board = "host".to_string();
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings() -> DeviceReadings {
        DeviceReadings {
            ip: String::new(),
            rssi: 0,
            uptime_ms: 0,
            free_heap: None,
        }
    }

    #[test]
    fn loopback_is_never_our_own_address() {
        assert_eq!(self_address("127.0.0.1".parse().unwrap()), None);
        assert_eq!(self_address("::1".parse().unwrap()), None);
        assert_eq!(self_address("0.0.0.0".parse().unwrap()), None);
        assert_eq!(
            self_address("192.168.1.40".parse().unwrap()),
            Some("192.168.1.40".to_string())
        );
    }

    #[test]
    fn local_server_gets_a_connection_attempt() {
        let mut runtime = RuntimeConfig::default();
        runtime.network.server_host = "127.0.0.1".to_string();
        runtime.network.fallback_hosts.clear();
        let mut net = HostNet::discover(&runtime);
        let mut bay = Bay::new(runtime);

        let effects = bay.tick(0, &mut net, &readings());

        assert_eq!(net.local_address(), None);
        assert!(matches!(
            effects.as_slice(),
            [Effect::Connect(target)] if target.host == "127.0.0.1"
        ));
    }

    #[test]
    fn events_from_an_aborted_socket_are_ignored() {
        let mut transport = WsTransport::new();
        let attempt = transport.attempts.begin();
        transport.abort();

        transport
            .events_tx
            .send((attempt, LinkEvent::Connected))
            .unwrap();

        assert!(transport.poll().is_empty());
    }
}
