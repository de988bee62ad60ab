use core::convert::TryInto;
use std::{
    io::BufRead,
    net::{Ipv4Addr, TcpStream, ToSocketAddrs},
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    io::EspIOError,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::EspWifi,
    ws::client::{EspWebSocketClient, EspWebSocketClientConfig, WebSocketEvent, WebSocketEventType},
};
use log::{debug, info, warn};

use bay_common::{
    ConnectTarget, ConsoleCommand, DeviceReadings, DisplayFrame, NetworkProbe, ProbeOutcome,
    RuntimeConfig, WifiAction, WifiWatch,
};

use crate::bay::{AttemptFilter, Bay, Effect, LinkEvent};

const NVS_NAMESPACE: &str = "bay";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const RELAY_PIN: i32 = 2;
const STATUS_LED_PIN: i32 = 5;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
const HEALTH_PATH: &str = "/api/ws/health";

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

struct Relay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    on: bool,
}

impl Relay {
    fn set(&mut self, on: bool) {
        if self.on == on {
            return;
        }
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        match result {
            Ok(()) => {
                self.on = on;
                info!("relay {}", if on { "ON" } else { "OFF" });
            }
            Err(err) => warn!("failed to drive relay: {err}"),
        }
    }
}

struct EspNet {
    local: Option<String>,
}

impl NetworkProbe for EspNet {
    fn local_address(&self) -> Option<String> {
        self.local.clone()
    }

    fn probe(&mut self, host: &str, port: u16, timeout_ms: u64) -> ProbeOutcome {
        let timeout = Duration::from_millis(timeout_ms);
        let reachable = (host, port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok()))
            .unwrap_or(false);
        if reachable {
            ProbeOutcome::Reachable
        } else {
            ProbeOutcome::Unreachable
        }
    }
}

/// Wraps the IDF WebSocket client. Its callback runs on the client task, so events are
/// queued and drained by the run loop.
struct WsTransport {
    attempts: AttemptFilter,
    client: Option<EspWebSocketClient<'static>>,
    events_tx: mpsc::Sender<(u64, LinkEvent)>,
    events_rx: mpsc::Receiver<(u64, LinkEvent)>,
}

impl WsTransport {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            attempts: AttemptFilter::default(),
            client: None,
            events_tx,
            events_rx,
        }
    }

    fn connect(&mut self, target: &ConnectTarget) {
        self.abort();
        let attempt = self.attempts.begin();
        let events = self.events_tx.clone();
        let config = EspWebSocketClientConfig {
            disable_auto_reconnect: true,
            ..Default::default()
        };

        let client = EspWebSocketClient::new(
            &target.url(),
            &config,
            WS_SEND_TIMEOUT,
            move |event: &Result<WebSocketEvent, EspIOError>| {
                let event = match event {
                    Ok(event) => match event.event_type {
                        WebSocketEventType::Connected => LinkEvent::Connected,
                        WebSocketEventType::Disconnected | WebSocketEventType::Closed => {
                            LinkEvent::Disconnected
                        }
                        WebSocketEventType::Text(text) => LinkEvent::Text(text.as_bytes().to_vec()),
                        WebSocketEventType::Ping => LinkEvent::Ping,
                        WebSocketEventType::Pong => LinkEvent::Pong,
                        _ => return,
                    },
                    Err(err) => LinkEvent::Error(format!("{err:?}")),
                };
                let _ = events.send((attempt, event));
            },
        );

        match client {
            Ok(client) => self.client = Some(client),
            Err(err) => {
                warn!("websocket client start failed: {err:?}");
                let _ = self.events_tx.send((attempt, LinkEvent::Disconnected));
            }
        }
    }

    fn abort(&mut self) {
        self.attempts.retire();
        self.client = None;
    }

    fn send(&mut self, text: &str) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.send(FrameType::Text(false), text.as_bytes()) {
            Ok(()) => true,
            Err(err) => {
                warn!("websocket send failed: {err:?}");
                false
            }
        }
    }

    fn poll(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        // The client reports both DISCONNECTED and CLOSED for one teardown.
        while let Ok((attempt, event)) = self.events_rx.try_recv() {
            if self.attempts.accept(attempt, &event) {
                events.push(event);
            }
        }
        events
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    apply_build_defaults(&mut runtime);
    runtime.sanitize();
    runtime
        .validate()
        .context("runtime config unusable, set WS_HOST and CAR_ID at build time")?;

    info!(
        "bay {} -> {}:{} ssid=`{}`",
        runtime.device.car_id,
        runtime.network.server_host,
        runtime.network.server_port,
        runtime.network.wifi_ssid,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut relay_pin = unsafe { PinDriver::output(AnyOutputPin::new(RELAY_PIN)) }
        .context("relay output unavailable")?;
    relay_pin.set_low().context("failed to release relay")?;
    let mut relay = Relay {
        pin: relay_pin,
        on: false,
    };
    let mut status_led = init_status_led(STATUS_LED_PIN);

    let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
    start_wifi(&mut wifi, &runtime)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register run loop with watchdog: {err:#}");
    }

    let loop_delay = Duration::from_millis(runtime.control.loop_delay_ms);
    let mut wifi_watch = WifiWatch::new(&runtime.control, monotonic_ms());
    let mut bay = Bay::new(runtime);
    let mut net = EspNet { local: None };
    let mut transport = WsTransport::new();
    let console = spawn_console_reader();
    let mut last_frame: Option<DisplayFrame> = None;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        let associated = is_wifi_station_connected();
        net.local = if associated { station_ip(&wifi) } else { None };
        match wifi_watch.observe(now_ms, associated) {
            WifiAction::None => {}
            WifiAction::Reconnect => {
                if let Err(err) = wifi.connect() {
                    debug!("wifi reconnect request failed: {err}");
                }
            }
            WifiAction::Restart => {
                thread::sleep(Duration::from_millis(100));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        }
        update_status_led(
            &mut status_led,
            associated,
            bay.link().is_connected(),
            now_ms,
        );
        if associated {
            if let Some((host, port)) = bay.health_check_target(now_ms, &net) {
                check_server_health(&host, port);
            }
        }

        for event in transport.poll() {
            let effects = bay.on_link_event(event, now_ms, &mut net);
            execute_effects(&mut bay, &mut transport, &mut relay, now_ms, effects);
        }

        let readings = device_readings(&net, now_ms);
        if associated {
            let effects = bay.tick(now_ms, &mut net, &readings);
            execute_effects(&mut bay, &mut transport, &mut relay, now_ms, effects);
        } else {
            bay.tick_session_only(now_ms);
        }

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

        thread::sleep(loop_delay);
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

                if !transport.send(&json) {
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

fn apply_build_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }
    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
    if runtime.network.server_host.is_empty() {
        if let Some(host) = option_env!("WS_HOST") {
            runtime.network.server_host = host.to_string();
        }
    }
    if runtime.device.car_id == RuntimeConfig::default().device.car_id {
        if let Some(car_id) = option_env!("CAR_ID") {
            runtime.device.car_id = car_id.to_string();
        }
    }
    if runtime.device.hostname.is_empty() {
        runtime.device.hostname = format!("bay-{}", runtime.device.car_id.to_lowercase());
    }
}

fn start_wifi(wifi: &mut EspWifi<'static>, runtime: &RuntimeConfig) -> anyhow::Result<()> {
    let network = &runtime.network;
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, associating with `{}`", network.wifi_ssid);
    if let Err(err) = wifi.connect() {
        warn!("initial wifi connect request failed: {err}");
    }
    disable_wifi_power_save();
    Ok(())
}

fn station_ip(wifi: &EspWifi<'static>) -> Option<String> {
    let info = wifi.sta_netif().get_ip_info().ok()?;
    (info.ip != Ipv4Addr::UNSPECIFIED).then(|| info.ip.to_string())
}

fn check_server_health(host: &str, port: u16) {
    let url = format!("http://{host}:{port}{HEALTH_PATH}");
    match fetch_status(&url) {
        Ok(status) if (200..300).contains(&status) => info!("health check {url}: HTTP {status}"),
        Ok(status) => warn!("health check {url}: HTTP {status}"),
        Err(err) => warn!("health check {url} failed: {err:#}"),
    }
}

fn fetch_status(url: &str) -> anyhow::Result<u16> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(HEALTH_TIMEOUT),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;
    Ok(response.status())
}

fn device_readings(net: &EspNet, now_ms: u64) -> DeviceReadings {
    DeviceReadings {
        ip: net.local.clone().unwrap_or_default(),
        rssi: station_rssi().unwrap_or_default(),
        uptime_ms: now_ms,
        free_heap: Some(unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }),
    }
}

fn spawn_console_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("console".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("console read failed: {err}");
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        })
        .expect("failed to spawn console thread");
    rx
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    station_ap_info().is_some()
}

fn station_rssi() -> Option<i32> {
    station_ap_info().map(|info| i32::from(info.rssi))
}

fn station_ap_info() -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info)
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn update_status_led(
    status_led: &mut Option<StatusLed>,
    wifi_connected: bool,
    link_connected: bool,
    now_ms: u64,
) {
    let desired_on = bay_common::network::status_led_lit(now_ms, wifi_connected, link_connected);

    let Some(led) = status_led.as_mut() else {
        return;
    };
    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
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
