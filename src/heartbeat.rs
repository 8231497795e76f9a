use chrono::Utc;

use crate::errors::{Result, TraceError};

/// Paces the sampling loop at a fixed frequency.
///
/// `beat()` is called once per tick; when the loop falls behind, whole
/// intervals are discarded and reported as skipped rather than replayed, so
/// the average rate recovers instead of bursting.
pub struct Heartbeat {
    interval: u64,
    next_expected: u64,
    skipped: u64,
}

fn now_usec() -> u64 {
    let now = Utc::now();
    now.timestamp() as u64 * 1_000_000 + u64::from(now.timestamp_subsec_micros())
}

impl Heartbeat {
    pub fn new(freq: u64) -> Heartbeat {
        Heartbeat::starting_at(freq, now_usec())
    }

    fn starting_at(freq: u64, start: u64) -> Heartbeat {
        Heartbeat {
            interval: 1_000_000 / freq,
            next_expected: start,
            skipped: 0,
        }
    }

    pub fn skipped_beats(&self) -> u64 {
        self.skipped
    }

    pub fn beat(&mut self) -> Result<()> {
        self.beat_at(now_usec())
    }

    fn beat_at(&mut self, t: u64) -> Result<()> {
        if t < self.next_expected {
            return Err(TraceError::TooSoon);
        }
        let elapsed = t - self.next_expected;
        self.skipped = elapsed / self.interval;
        if self.skipped > 0 {
            self.skipped -= 1;
        }
        self.next_expected += (self.skipped + 1) * self.interval;
        if self.next_expected < t {
            self.next_expected += self.interval;
        }
        Ok(())
    }

    pub fn usec_until_next_beat(&self) -> u64 {
        self.usec_until_next_beat_at(now_usec())
    }

    fn usec_until_next_beat_at(&self, t: u64) -> u64 {
        self.next_expected.saturating_sub(t)
    }
}
