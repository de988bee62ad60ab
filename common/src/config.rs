use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_FALLBACK_HOSTS: [&str; 6] = [
    "192.168.1.114",
    "localhost",
    "127.0.0.1",
    "192.168.1.100",
    "192.168.0.100",
    "10.0.0.100",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub car_id: String,
    pub hostname: String,
    pub board: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            car_id: "CAR-UNDEFINED".to_string(),
            hostname: String::new(),
            board: "ESP32".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub server_host: String,
    pub server_port: u16,
    pub fallback_hosts: Vec<String>,
    #[serde(default)]
    pub disable_fallback: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            server_host: String::new(),
            server_port: 8081,
            fallback_hosts: DEFAULT_FALLBACK_HOSTS
                .iter()
                .map(|host| host.to_string())
                .collect(),
            disable_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub base_retry_ms: u64,
    pub max_retry_ms: u64,
    pub handshake_timeout_ms: u64,
    pub hello_delay_ms: u64,
    pub heartbeat_ms: u64,
    pub heartbeat_enabled: bool,
    pub connect_once: bool,
    pub probe_timeout_ms: u64,
    pub healthcheck_interval_ms: u64,
    pub min_free_heap_bytes: u32,
    pub ws_path: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            base_retry_ms: 3_000,
            max_retry_ms: 30_000,
            handshake_timeout_ms: 8_000,
            hello_delay_ms: 5_000,
            heartbeat_ms: 5_000,
            heartbeat_enabled: true,
            connect_once: false,
            probe_timeout_ms: 2_000,
            healthcheck_interval_ms: 15_000,
            min_free_heap_bytes: 8_000,
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub loop_delay_ms: u64,
    pub blink_ms: u64,
    pub wifi_startup_timeout_ms: u64,
    pub wifi_retry_ms: u64,
    pub wifi_restart_grace_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            loop_delay_ms: 50,
            blink_ms: 500,
            wifi_startup_timeout_ms: 20_000,
            wifi_retry_ms: 2_000,
            wifi_restart_grace_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub verbose: bool,
    pub heartbeat_json: bool,
    pub status_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            verbose: true,
            heartbeat_json: false,
            status_json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.device.car_id = self.device.car_id.trim().to_string();
        self.network.server_host = self.network.server_host.trim().to_string();
        for host in &mut self.network.fallback_hosts {
            *host = host.trim().to_string();
        }
        self.link.sanitize();
        self.control.sanitize();
    }

    /// Validates what the run loop cannot work around.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.car_id.is_empty() {
            return Err(ConfigError::EmptyCarId);
        }
        if self.network.server_port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.network.server_host.is_empty() {
            return Err(ConfigError::EmptyPrimaryHost);
        }
        Ok(())
    }

    /// Candidate servers: the configured host first, then fallbacks unless the link runs
    /// in single-attempt mode or fallback is disabled. Empty entries are kept so the
    /// supervisor can skip them observably.
    pub fn host_list(&self) -> Vec<String> {
        let mut hosts = vec![self.network.server_host.clone()];
        if !self.link.connect_once && !self.network.disable_fallback {
            hosts.extend(self.network.fallback_hosts.iter().cloned());
        }
        hosts
    }

    /// Path and query used for the WebSocket upgrade, e.g. `/ws?carId=CAR-7`.
    pub fn ws_path(&self) -> String {
        format!("{}?carId={}", self.link.ws_path, self.device.car_id)
    }
}

impl LinkConfig {
    pub fn sanitize(&mut self) {
        self.base_retry_ms = self.base_retry_ms.max(100);
        if self.max_retry_ms < self.base_retry_ms {
            self.max_retry_ms = self.base_retry_ms;
        }
        self.handshake_timeout_ms = self.handshake_timeout_ms.max(1_000);
        self.probe_timeout_ms = self.probe_timeout_ms.clamp(250, 3_000);
        self.heartbeat_ms = self.heartbeat_ms.max(1_000);
        if !self.ws_path.starts_with('/') {
            self.ws_path.insert(0, '/');
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.loop_delay_ms = self.loop_delay_ms.clamp(10, 1_000);
        self.blink_ms = self.blink_ms.clamp(100, 2_000);
        self.wifi_retry_ms = self.wifi_retry_ms.max(500);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn runtime_with_host(host: &str) -> RuntimeConfig {
        let mut runtime = RuntimeConfig::default();
        runtime.network.server_host = host.to_string();
        runtime
    }

    #[test]
    fn primary_host_leads_the_candidate_list() {
        let runtime = runtime_with_host("10.8.113.82");
        let hosts = runtime.host_list();

        assert_eq!(hosts.len(), 1 + DEFAULT_FALLBACK_HOSTS.len());
        assert_eq!(hosts[0], "10.8.113.82");
        assert_eq!(hosts[1], "192.168.1.114");
    }

    #[test]
    fn connect_once_uses_only_the_primary_host() {
        let mut runtime = runtime_with_host("10.8.113.82");
        runtime.link.connect_once = true;

        assert_eq!(runtime.host_list(), vec!["10.8.113.82".to_string()]);
    }

    #[test]
    fn sanitize_repairs_retry_window_and_path() {
        let mut runtime = runtime_with_host(" 10.0.0.5 ");
        runtime.link.base_retry_ms = 10_000;
        runtime.link.max_retry_ms = 2_000;
        runtime.link.ws_path = "ws".to_string();
        runtime.control.loop_delay_ms = 0;

        runtime.sanitize();

        assert_eq!(runtime.network.server_host, "10.0.0.5");
        assert_eq!(runtime.link.max_retry_ms, 10_000);
        assert_eq!(runtime.link.ws_path, "/ws");
        assert_eq!(runtime.control.loop_delay_ms, 10);
    }

    #[test]
    fn validate_rejects_missing_primary_host() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.validate(), Err(ConfigError::EmptyPrimaryHost));
        assert_eq!(runtime_with_host("10.0.0.5").validate(), Ok(()));
    }

    #[test]
    fn ws_path_carries_car_id() {
        let mut runtime = runtime_with_host("10.0.0.5");
        runtime.device.car_id = "CAR-12".to_string();
        assert_eq!(runtime.ws_path(), "/ws?carId=CAR-12");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{
            "device": {"car_id": "CAR-3", "hostname": "bay-3", "board": "ESP8266"},
            "network": {
                "wifi_ssid": "bay", "wifi_pass": "", "server_host": "10.0.0.2",
                "server_port": 9000, "fallback_hosts": []
            }
        }"#;

        let runtime: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(runtime.network.server_port, 9000);
        assert_eq!(runtime.link.base_retry_ms, 3_000);
        assert!(!runtime.network.disable_fallback);
        assert_eq!(runtime.host_list(), vec!["10.0.0.2".to_string()]);
    }
}
