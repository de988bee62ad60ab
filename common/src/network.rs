//! Wi-Fi readiness and recovery decisions, polled from the run loop.

use log::{info, warn};

use crate::{
    config::ControlConfig,
    timing::{blink_phase, Cadence, Deferred},
};

pub const LED_FAST_BLINK_MS: u64 = 200;
pub const LED_SLOW_BLINK_MS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiAction {
    None,
    Reconnect,
    Restart,
}

/// Tracks station association without ever blocking.
///
/// While disassociated it asks for a reconnect at most once per retry period, and for
/// a restart once the outage reaches the grace period.
#[derive(Debug, Clone)]
pub struct WifiWatch {
    retry: Cadence,
    restart_grace_ms: u64,
    lost_since_ms: Option<u64>,
    startup: Deferred,
    ready: bool,
}

impl WifiWatch {
    pub fn new(control: &ControlConfig, now_ms: u64) -> Self {
        let mut startup = Deferred::default();
        startup.schedule(now_ms, control.wifi_startup_timeout_ms);
        Self {
            retry: Cadence::starting_at(control.wifi_retry_ms, now_ms),
            restart_grace_ms: control.wifi_restart_grace_ms,
            lost_since_ms: Some(now_ms),
            startup,
            ready: false,
        }
    }

    /// `true` once the station has associated at least once.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn lost_since_ms(&self) -> Option<u64> {
        self.lost_since_ms
    }

    pub fn observe(&mut self, now_ms: u64, associated: bool) -> WifiAction {
        if associated {
            if !self.ready {
                info!("wifi ready");
                self.ready = true;
                self.startup.clear();
            } else if self.lost_since_ms.is_some() {
                info!("wifi back");
            }
            self.lost_since_ms = None;
            return WifiAction::None;
        }

        if self.startup.take_if_due(now_ms) {
            warn!("wifi not ready yet, continuing without it");
        }

        let lost_since = *self.lost_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(lost_since) >= self.restart_grace_ms {
            warn!(
                "wifi down for {}s, restart required",
                self.restart_grace_ms / 1_000
            );
            self.lost_since_ms = Some(now_ms);
            return WifiAction::Restart;
        }

        if self.retry.fire_if_due(now_ms) {
            WifiAction::Reconnect
        } else {
            WifiAction::None
        }
    }
}

/// Fast blink without Wi-Fi, slow blink without the server link, solid when both are up.
pub fn status_led_lit(now_ms: u64, wifi_up: bool, link_up: bool) -> bool {
    if !wifi_up {
        blink_phase(now_ms, LED_FAST_BLINK_MS)
    } else if !link_up {
        blink_phase(now_ms, LED_SLOW_BLINK_MS)
    } else {
        true
    }
}
