use log::{info, warn};

use crate::{
    display::{self, DisplayFrame},
    protocol::{Action, SessionSync},
    timing::{blink_phase, Cadence},
    types::{OperationStatus, SessionAction},
};

const COUNT_PERIOD_MS: u64 = 1_000;

/// Operational status, countdown/overtime counters and the relay they drive.
///
/// Every mutating call returns the relay and status effects the caller must carry out.
/// The relay is engaged in every status except `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionController {
    status: OperationStatus,
    remaining_seconds: u32,
    extra_seconds: u32,
    counting_down: bool,
    relay_on: bool,
    count_gate: Cadence,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            status: OperationStatus::Stopped,
            remaining_seconds: 0,
            extra_seconds: 0,
            counting_down: false,
            relay_on: false,
            count_gate: Cadence::new(COUNT_PERIOD_MS),
        }
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.remaining_seconds
    }

    pub fn extra_seconds(&self) -> u32 {
        self.extra_seconds
    }

    pub fn is_counting_down(&self) -> bool {
        self.counting_down
    }

    pub fn is_relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn last_count_ms(&self) -> Option<u64> {
        self.count_gate.last_ms()
    }

    /// Timed status with a countdown that has no time on it yet.
    pub fn is_awaiting_time(&self) -> bool {
        self.status.is_timed() && self.counting_down && self.remaining_seconds == 0
    }

    pub fn start(&mut self, total_seconds: i64, now_ms: u64) -> Vec<SessionAction> {
        self.begin_timed(OperationStatus::Active, total_seconds, now_ms)
    }

    pub fn liberate_with_time(&mut self, total_seconds: i64, now_ms: u64) -> Vec<SessionAction> {
        self.begin_timed(OperationStatus::LiberatedWithTime, total_seconds, now_ms)
    }

    /// Bare `start`: engage the bay and wait for the server to supply the session time.
    pub fn arm(&mut self, now_ms: u64) -> Vec<SessionAction> {
        self.remaining_seconds = 0;
        self.extra_seconds = 0;
        self.counting_down = true;
        self.count_gate.restart(now_ms);
        info!("session armed, awaiting session data");
        self.enter(OperationStatus::Active)
    }

    pub fn stop(&mut self) -> Vec<SessionAction> {
        self.remaining_seconds = 0;
        self.extra_seconds = 0;
        self.counting_down = false;
        info!("session stopped");
        self.enter(OperationStatus::Stopped)
    }

    pub fn pause(&mut self) -> Vec<SessionAction> {
        if !self.status.is_timed() {
            return Vec::new();
        }
        info!(
            "session paused at {}s remaining, {}s extra",
            self.remaining_seconds, self.extra_seconds
        );
        self.enter(OperationStatus::Paused)
    }

    /// Always resumes into `Active`; the count reference moves to `now_ms`.
    pub fn resume(&mut self, now_ms: u64) -> Vec<SessionAction> {
        if self.status != OperationStatus::Paused {
            return Vec::new();
        }
        self.count_gate.restart(now_ms);
        info!("session resumed");
        self.enter(OperationStatus::Active)
    }

    pub fn liberate_free(&mut self) -> Vec<SessionAction> {
        self.remaining_seconds = 0;
        self.extra_seconds = 0;
        self.counting_down = false;
        info!("bay liberated without time");
        self.enter(OperationStatus::LiberatedFree)
    }

    /// Advances the timer by one second when at least a second passed since the last
    /// advance. Returns `true` when a counter changed.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if !self.count_gate.fire_if_due(now_ms) {
            return false;
        }
        if !self.status.is_timed() || self.is_awaiting_time() {
            return false;
        }

        if self.counting_down {
            self.remaining_seconds = self.remaining_seconds.saturating_sub(1);
            if self.remaining_seconds == 0 {
                self.counting_down = false;
                self.extra_seconds = 0;
                info!("countdown finished, overtime started");
            }
        } else {
            self.extra_seconds = self.extra_seconds.saturating_add(1);
        }
        true
    }

    pub fn handle_action(&mut self, action: Action, now_ms: u64) -> Vec<SessionAction> {
        match action {
            Action::Start => self.arm(now_ms),
            Action::Stop => self.stop(),
            Action::Emergency => {
                warn!("emergency stop requested");
                self.stop()
            }
            Action::Pause => self.pause(),
            Action::Resume => self.resume(now_ms),
            Action::LiberateFree => self.liberate_free(),
        }
    }

    /// Overwrites the timer from server data. Zero or missing time never starts a session.
    pub fn handle_session_sync(&mut self, sync: &SessionSync, now_ms: u64) -> Vec<SessionAction> {
        match sync.resolved_seconds() {
            Some(seconds) if seconds > 0 => {
                if sync.wants_liberated_time() {
                    self.liberate_with_time(seconds, now_ms)
                } else {
                    self.start(seconds, now_ms)
                }
            }
            _ => {
                info!("session data carries no time, nothing to start");
                Vec::new()
            }
        }
    }

    pub fn display_frame(&self, now_ms: u64, blink_ms: u64) -> DisplayFrame {
        display::render(
            self.status,
            self.remaining_seconds,
            self.extra_seconds,
            self.counting_down,
            blink_phase(now_ms, blink_ms),
        )
    }

    fn begin_timed(
        &mut self,
        status: OperationStatus,
        total_seconds: i64,
        now_ms: u64,
    ) -> Vec<SessionAction> {
        if total_seconds <= 0 {
            warn!("refusing {} with {total_seconds}s", status.as_str());
            self.remaining_seconds = 0;
            self.extra_seconds = 0;
            self.counting_down = true;
            return Vec::new();
        }

        self.remaining_seconds = u32::try_from(total_seconds).unwrap_or(u32::MAX);
        self.extra_seconds = 0;
        self.counting_down = true;
        self.count_gate.restart(now_ms);
        info!(
            "{} with {}s on the clock",
            status.as_str(),
            self.remaining_seconds
        );
        self.enter(status)
    }

    fn enter(&mut self, status: OperationStatus) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        let relay_on = status.engages_relay();
        if relay_on != self.relay_on {
            self.relay_on = relay_on;
            actions.push(if relay_on {
                SessionAction::RelayOn
            } else {
                SessionAction::RelayOff
            });
        }

        if status != self.status {
            self.status = status;
            actions.push(SessionAction::PublishStatus(status));
        }

        actions
    }
}
