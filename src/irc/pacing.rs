//! Outbound flood-control pacer for IRC writes (4.F).
//!
//! Tracks a penalty counter alongside the wall-clock time of the last send:
//! every call either drains the counter by the number of whole seconds since
//! the last send, or bumps it by one when two sends land in the same second.
//! Once the counter climbs past `PENALTY_CAP`, or the line itself is long
//! enough to warrant it, the caller is told to sleep before the next line
//! goes out - the same shape a bouncer's flood protection uses to stay under
//! a server's `flood` threshold without stalling ordinary traffic.

use std::time::{Duration, Instant};

const PENALTY_CAP: i64 = 5;
const MIN_SLEEP_SECS: f64 = 1.5;

pub struct Pacer {
    last_send_time: Instant,
    penalty: i64,
}

impl Pacer {
    pub fn new() -> Self {
        Pacer {
            last_send_time: Instant::now(),
            penalty: 0,
        }
    }

    /// Call after transmitting a line of `line_len` bytes. Updates the
    /// penalty counter for the time elapsed since the previous send, then
    /// returns how long the caller should sleep before sending the next line
    /// (4.F). `last_send_time` is only advanced once the decision is made -
    /// immediately when no sleep is required, or past the sleep when one is.
    pub fn pace(&mut self, line_len: usize) -> Duration {
        let now = Instant::now();
        let diff = now.saturating_duration_since(self.last_send_time).as_secs() as i64;
        if diff == 0 {
            self.penalty += 1;
        } else {
            self.penalty = (self.penalty - diff).max(0);
        }

        let sleep_secs = (line_len as f64 / 512.0 * 6.0).max(MIN_SLEEP_SECS);
        if self.penalty > PENALTY_CAP || sleep_secs > MIN_SLEEP_SECS {
            let sleep = Duration::from_secs_f64(sleep_secs);
            self.last_send_time = now + sleep;
            sleep
        } else {
            self.last_send_time = now;
            Duration::ZERO
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_short_lines_incur_no_wait() {
        let mut pacer = Pacer::new();
        for _ in 0..PENALTY_CAP {
            assert_eq!(pacer.pace(10), Duration::ZERO);
        }
    }

    #[test]
    fn bursting_past_the_cap_forces_a_wait() {
        let mut pacer = Pacer::new();
        let mut saw_wait = false;
        for _ in 0..20 {
            if pacer.pace(10) > Duration::ZERO {
                saw_wait = true;
                break;
            }
        }
        assert!(saw_wait, "sustained burst in the same instant should eventually be throttled");
    }

    #[test]
    fn long_lines_force_a_wait_even_without_penalty() {
        let mut pacer = Pacer::new();
        // 600 bytes / 512 * 6 = 7.03s, well past the 1.5s floor.
        assert!(pacer.pace(600) > Duration::from_secs(1));
    }

    #[test]
    fn short_line_below_floor_does_not_wait_alone() {
        let mut pacer = Pacer::new();
        assert_eq!(pacer.pace(10), Duration::ZERO);
    }
}
