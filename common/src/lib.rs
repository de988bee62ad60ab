pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod display;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod timing;
pub mod types;

pub use config::{LinkConfig, NetworkConfig, RuntimeConfig};
pub use connection::{ConnectionSupervisor, LinkSummary, NetworkProbe, ProbeOutcome};
pub use diagnostics::{ConnectionSnapshot, ConsoleCommand, DetailedSnapshot};
pub use display::DisplayFrame;
pub use error::{ConfigError, DecodeError};
pub use network::{WifiAction, WifiWatch};
pub use protocol::{Action, ExpanderCommand, Inbound, SessionSync};
pub use session::SessionController;
pub use types::{
    ConnectTarget, DeviceReadings, LinkAction, OperationStatus, OutboundMessage, SessionAction,
};
