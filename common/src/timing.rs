//! Millisecond timing helpers shared by the link supervisor and the session timer.
//!
//! All helpers take `now_ms` from the caller and compare with wrapping-safe
//! saturating arithmetic, so a monotonic millisecond counter is all they need.

/// Doubling reconnect delay with a ceiling.
///
/// The delay starts at zero; the first failure seeds it with `base_ms`, every later
/// failure doubles it up to `max_ms`. Only [`Backoff::reset`] brings it back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            current_ms: 0,
        }
    }

    pub fn base_ms(&self) -> u64 {
        self.base_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    /// Advances to the next delay and returns it.
    pub fn next_delay(&mut self) -> u64 {
        self.current_ms = if self.current_ms == 0 {
            self.base_ms
        } else {
            self.current_ms.saturating_mul(2)
        };
        self.current_ms = self.current_ms.min(self.max_ms);
        self.current_ms
    }

    pub fn reset(&mut self) {
        self.current_ms = 0;
    }
}

/// A one-shot action represented as "scheduled-at timestamp + flag".
///
/// Nothing cancels it explicitly; callers drop it with [`Deferred::clear`] or simply
/// never observe it once conditions change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deferred {
    due_at_ms: Option<u64>,
}

impl Deferred {
    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64) {
        self.due_at_ms = Some(now_ms.saturating_add(delay_ms));
    }

    pub fn clear(&mut self) {
        self.due_at_ms = None;
    }

    pub fn is_pending(&self) -> bool {
        self.due_at_ms.is_some()
    }

    pub fn due_at_ms(&self) -> Option<u64> {
        self.due_at_ms
    }

    /// Returns `true` exactly once, on the first call at or after the deadline.
    pub fn take_if_due(&mut self, now_ms: u64) -> bool {
        match self.due_at_ms {
            Some(due) if now_ms >= due => {
                self.due_at_ms = None;
                true
            }
            _ => false,
        }
    }
}

/// Period gate: fires when at least `period_ms` elapsed since the last firing.
///
/// The reference moves to `now_ms` on every firing, so stalls are never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    period_ms: u64,
    last_ms: Option<u64>,
}

impl Cadence {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            last_ms: None,
        }
    }

    /// Like [`Cadence::new`] but anchored at `now_ms`, so the first firing is one full
    /// period away.
    pub fn starting_at(period_ms: u64, now_ms: u64) -> Self {
        Self {
            period_ms,
            last_ms: Some(now_ms),
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn last_ms(&self) -> Option<u64> {
        self.last_ms
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.last_ms
            .map(|last| now_ms.saturating_sub(last) >= self.period_ms)
            .unwrap_or(true)
    }

    pub fn fire_if_due(&mut self, now_ms: u64) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.last_ms = Some(now_ms);
        true
    }

    pub fn restart(&mut self, now_ms: u64) {
        self.last_ms = Some(now_ms);
    }

    pub fn disarm(&mut self) {
        self.last_ms = None;
    }
}

/// `true` during the "on" half of a square wave with the given half period.
pub fn blink_phase(now_ms: u64, half_period_ms: u64) -> bool {
    if half_period_ms == 0 {
        return true;
    }
    (now_ms / half_period_ms) % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_seeds_doubles_and_caps() {
        let mut backoff = Backoff::new(3_000, 30_000);

        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000, 30_000, 30_000]);
    }

    #[test]
    fn backoff_reset_restarts_from_base() {
        let mut backoff = Backoff::new(1_000, 4_000);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.current_ms(), 0);
        assert_eq!(backoff.next_delay(), 1_000);
    }

    #[test]
    fn backoff_max_never_below_base() {
        let backoff = Backoff::new(5_000, 1_000);
        assert_eq!(backoff.max_ms(), 5_000);
    }

    #[test]
    fn deferred_fires_once() {
        let mut deferred = Deferred::default();
        deferred.schedule(100, 50);

        assert!(!deferred.take_if_due(149));
        assert!(deferred.take_if_due(150));
        assert!(!deferred.take_if_due(151));
        assert!(!deferred.is_pending());
    }

    #[test]
    fn cadence_does_not_replay_missed_periods() {
        let mut cadence = Cadence::starting_at(1_000, 0);

        assert!(!cadence.fire_if_due(999));
        assert!(cadence.fire_if_due(5_500));
        assert!(!cadence.fire_if_due(6_000));
        assert!(cadence.fire_if_due(6_500));
    }

    #[test]
    fn fresh_cadence_is_due_immediately() {
        let mut cadence = Cadence::new(5_000);
        assert!(cadence.fire_if_due(0));
        assert!(!cadence.fire_if_due(4_999));
    }

    #[test]
    fn blink_alternates_every_half_period() {
        assert!(blink_phase(0, 500));
        assert!(blink_phase(499, 500));
        assert!(!blink_phase(500, 500));
        assert!(blink_phase(1_000, 500));
    }
}
