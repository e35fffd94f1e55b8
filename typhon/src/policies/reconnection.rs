//! Reconnection policies: how long a pool waits between attempts to
//! restore lost connections.

use std::time::Duration;

/// A factory of reconnection schedules. Each pool obtains a fresh
/// schedule when it starts reconnecting and drops it once reconnected.
pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send>;
}

/// A single reconnection sequence. Owns its cursor: every call to
/// [`ReconnectionSchedule::next_delay`] advances it monotonically.
pub trait ReconnectionSchedule {
    fn next_delay(&mut self) -> Duration;
}

/// Waits a constant time between reconnection attempts.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ConstantReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        Box::new(ConstantReconnectionSchedule { delay: self.delay })
    }
}

struct ConstantReconnectionSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay on every attempt, up to a cap.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        Box::new(ExponentialReconnectionSchedule {
            next: self.base_delay,
            max: self.max_delay,
        })
    }
}

struct ExponentialReconnectionSchedule {
    next: Duration,
    max: Duration,
}

impl ReconnectionSchedule for ExponentialReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(self.next * 2, self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_doubles_up_to_cap() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        let mut schedule = policy.new_schedule();
        let delays: Vec<_> = (0..6).map(|_| schedule.next_delay().as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1000, 1000]);

        // A fresh schedule starts over.
        let mut schedule = policy.new_schedule();
        assert_eq!(schedule.next_delay().as_millis(), 100);
    }

    #[test]
    fn constant_schedule_never_changes() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_millis(250));
        let mut schedule = policy.new_schedule();
        for _ in 0..3 {
            assert_eq!(schedule.next_delay().as_millis(), 250);
        }
    }
}
