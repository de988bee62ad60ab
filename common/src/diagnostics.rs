//! Read-only console diagnostics.

use std::fmt;

use serde::Serialize;

use crate::{
    connection::ConnectionSupervisor, session::SessionController, types::DeviceReadings,
    types::OperationStatus,
};

pub const HELP: &str = "commands: i = detailed status, j = compact json, h = help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Detailed,
    Compact,
    Help,
    Unknown(String),
}

impl ConsoleCommand {
    /// Blank lines are not commands.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "" => None,
            "i" | "I" => Some(Self::Detailed),
            "j" | "J" => Some(Self::Compact),
            "h" | "H" | "?" => Some(Self::Help),
            other => Some(Self::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    #[serde(rename = "carId")]
    pub car_id: String,
    pub online: bool,
    #[serde(rename = "lastSeenSec")]
    pub last_seen_sec: Option<u64>,
}

impl ConnectionSnapshot {
    pub fn capture(car_id: &str, link: &ConnectionSupervisor, now_ms: u64) -> Self {
        Self {
            car_id: car_id.to_string(),
            online: link.is_connected(),
            last_seen_sec: link.last_seen_sec(now_ms),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailedSnapshot {
    pub car_id: String,
    pub ip: String,
    pub rssi: i32,
    pub relay_on: bool,
    pub status: OperationStatus,
    pub uptime_sec: u64,
    pub link_up: bool,
    pub last_seen_sec: Option<u64>,
    pub heap: Option<u32>,
}

impl DetailedSnapshot {
    pub fn capture(
        car_id: &str,
        session: &SessionController,
        link: &ConnectionSupervisor,
        readings: &DeviceReadings,
        now_ms: u64,
    ) -> Self {
        Self {
            car_id: car_id.to_string(),
            ip: readings.ip.clone(),
            rssi: readings.rssi,
            relay_on: session.is_relay_on(),
            status: session.status(),
            uptime_sec: readings.uptime_ms / 1_000,
            link_up: link.is_connected(),
            last_seen_sec: link.last_seen_sec(now_ms),
            heap: readings.free_heap,
        }
    }
}

impl fmt::Display for DetailedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "car={} ip={} rssi={} relay={} status={} uptime={}s ws={}",
            self.car_id,
            self.ip,
            self.rssi,
            if self.relay_on { "ON" } else { "OFF" },
            self.status.as_str(),
            self.uptime_sec,
            if self.link_up { "up" } else { "down" },
        )?;
        match self.last_seen_sec {
            Some(seconds) => write!(f, " seen={seconds}s")?,
            None => write!(f, " seen=-")?,
        }
        match self.heap {
            Some(heap) => write!(f, " heap={heap}"),
            None => write!(f, " heap=-"),
        }
    }
}
