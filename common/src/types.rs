use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[default]
    Stopped,
    Active,
    Paused,
    #[serde(rename = "LIBERATED_TIME")]
    LiberatedWithTime,
    LiberatedFree,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::LiberatedWithTime => "LIBERATED_TIME",
            Self::LiberatedFree => "LIBERATED_FREE",
        }
    }

    /// Statuses in which the per-second timer advances.
    pub fn is_timed(self) -> bool {
        matches!(self, Self::Active | Self::LiberatedWithTime)
    }

    /// Statuses that keep the relay engaged.
    pub fn engages_relay(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Frames the controller sends to the coordination server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Hello {
        #[serde(rename = "carId")]
        car_id: String,
        ip: String,
        hostname: String,
        board: String,
    },
    Status {
        #[serde(rename = "carId")]
        car_id: String,
        status: OperationStatus,
        #[serde(rename = "relayOn")]
        relay_on: bool,
    },
    Heartbeat {
        #[serde(rename = "carId")]
        car_id: String,
        status: OperationStatus,
        #[serde(rename = "relayOn")]
        relay_on: bool,
        rssi: i32,
        ip: String,
        #[serde(rename = "uptimeSec")]
        uptime_sec: u64,
        heap: u32,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Status { .. } => "status",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Side effects requested by the session controller, executed by the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    RelayOn,
    RelayOff,
    PublishStatus(OperationStatus),
}

/// Where the transport should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ConnectTarget {
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Side effects requested by the connection supervisor, executed by the run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Connect(ConnectTarget),
    /// Drop the attempt that timed out in the handshake.
    Abort,
    AnnounceHello,
    Heartbeat,
}

/// Point-in-time readings of the platform the run loop hands to message builders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReadings {
    pub ip: String,
    pub rssi: i32,
    pub uptime_ms: u64,
    pub free_heap: Option<u32>,
}

impl DeviceReadings {
    /// `false` only when the platform reports free memory and it is below `min_bytes`.
    pub fn has_headroom(&self, min_bytes: u32) -> bool {
        self.free_heap.map(|free| free >= min_bytes).unwrap_or(true)
    }
}
