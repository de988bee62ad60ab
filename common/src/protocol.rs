//! Decoding of inbound text frames into typed commands.
//!
//! Frames are JSON objects. Classification precedence mirrors what the coordination
//! server sends: an `action` wins, then `session_data`, then operation notices, then
//! any other typed system message.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DecodeError;

pub const MAX_FRAME_BYTES: usize = 2_048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Pause,
    Resume,
    LiberateFree,
    Emergency,
}

impl Action {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "liberate_free" => Some(Self::LiberateFree),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::LiberateFree => "liberate_free",
            Self::Emergency => "emergency",
        }
    }
}

/// Bench-test commands for the 8-bit output expander.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpanderCommand {
    Pin { index: u8, on: bool },
    AllOn,
    AllOff,
    RunningLight,
    SetByte(u8),
}

impl ExpanderCommand {
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(rest) = name.strip_prefix("hc595_pin_") {
            let index = rest.get(..1)?.parse::<u8>().ok()?;
            if index > 7 {
                return None;
            }
            let on = rest.ends_with("_on");
            if !on && !rest.ends_with("_off") {
                return None;
            }
            return Some(Self::Pin { index, on });
        }

        match name {
            "hc595_all_on" => Some(Self::AllOn),
            "hc595_all_off" => Some(Self::AllOff),
            "hc595_running_light" => Some(Self::RunningLight),
            _ => name
                .strip_prefix("hc595_byte_")
                .and_then(|value| value.parse::<u8>().ok())
                .map(Self::SetByte),
        }
    }

    /// Applies the command to an output image and returns the new image.
    pub fn apply(self, image: u8) -> u8 {
        match self {
            Self::Pin { index, on: true } => image | (1 << index),
            Self::Pin { index, on: false } => image & !(1 << index),
            Self::AllOn => 0xFF,
            Self::AllOff | Self::RunningLight => 0x00,
            Self::SetByte(value) => value,
        }
    }
}

/// Server-authoritative session timing, already decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSync {
    pub remaining_seconds: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub minutes: Option<i64>,
    pub status: Option<String>,
}

impl SessionSync {
    /// First present value among remaining seconds, duration seconds and minutes.
    ///
    /// An explicit value shadows the later ones even when it is zero.
    pub fn resolved_seconds(&self) -> Option<i64> {
        self.remaining_seconds
            .or(self.duration_seconds)
            .or_else(|| self.minutes.map(|minutes| minutes.saturating_mul(60)))
    }

    pub fn wants_liberated_time(&self) -> bool {
        self.status
            .as_deref()
            .map(|status| status.eq_ignore_ascii_case("liberated_time"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(Action),
    Expander(ExpanderCommand),
    UnknownAction(String),
    SessionSync(SessionSync),
    OperationNotice { car_id: String, status: String },
    System(String),
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct WireSession {
    #[serde(rename = "remainingTime")]
    remaining_time: Option<WireRemaining>,
    duration: Option<f64>,
    #[serde(rename = "initialMinutes", alias = "minutes")]
    minutes: Option<f64>,
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRemaining {
    total_seconds: Option<f64>,
}

pub fn decode(payload: &[u8]) -> Result<Inbound, DecodeError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge(payload.len(), MAX_FRAME_BYTES));
    }

    let text = std::str::from_utf8(payload)?;
    let Value::Object(fields) = serde_json::from_str::<Value>(text)? else {
        return Ok(Inbound::Unknown);
    };

    if let Some(action) = fields.get("action") {
        let name = action.as_str().unwrap_or_default();
        return Ok(classify_action(name));
    }

    let kind = fields.get("type").and_then(Value::as_str);

    if kind == Some("session_data") {
        return Ok(Inbound::SessionSync(decode_session(&fields)?));
    }

    if let (Some(car_id), Some(status)) = (fields.get("carId"), fields.get("status")) {
        return Ok(Inbound::OperationNotice {
            car_id: value_text(car_id),
            status: value_text(status),
        });
    }

    Ok(match kind {
        Some(kind) => Inbound::System(kind.to_string()),
        None => Inbound::Unknown,
    })
}

fn classify_action(name: &str) -> Inbound {
    if let Some(action) = Action::from_name(name) {
        return Inbound::Command(action);
    }
    match ExpanderCommand::parse(name) {
        Some(command) => Inbound::Expander(command),
        None => Inbound::UnknownAction(name.to_string()),
    }
}

fn decode_session(fields: &Map<String, Value>) -> Result<SessionSync, DecodeError> {
    let payload = fields
        .get("data")
        .or_else(|| fields.get("session_data"))
        .filter(|value| value.is_object());

    let wire = match payload {
        Some(value) => WireSession::deserialize(value)?,
        None => WireSession::default(),
    };

    Ok(SessionSync {
        remaining_seconds: wire
            .remaining_time
            .and_then(|remaining| remaining.total_seconds)
            .map(whole),
        duration_seconds: wire.duration.map(whole),
        minutes: wire.minutes.map(whole),
        status: wire.status,
    })
}

fn whole(value: f64) -> i64 {
    if value.is_finite() {
        value.trunc() as i64
    } else {
        0
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
