//! Periodic progress output.

use std::time::Instant;

use crate::types::{Rank, SimTime};

/// Emits a progress record every `period` ticks of simulated time.
#[derive(Debug)]
pub struct Heartbeat {
    period: SimTime,
    last_wall: Instant,
    last_time: SimTime,
    beats: u64,
}

/// What a heartbeat reports.
#[derive(Clone, Debug, PartialEq)]
pub struct Beat {
    pub sim_time: SimTime,
    pub wall_secs: f64,
    pub sim_advance: SimTime,
    pub beats: u64,
}

impl Heartbeat {
    pub fn new(period: SimTime) -> Self {
        Self {
            period,
            last_wall: Instant::now(),
            last_time: 0,
            beats: 0,
        }
    }

    pub fn period(&self) -> SimTime {
        self.period
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Time of the first beat.
    pub fn first(&self, now: SimTime) -> SimTime {
        now + self.period
    }

    /// Records a beat at `now` and logs it.
    pub fn beat(&mut self, now: SimTime, rank: Rank, formatted_time: &str, pending: usize) -> Beat {
        let wall = self.last_wall.elapsed().as_secs_f64();
        self.beats += 1;
        let beat = Beat {
            sim_time: now,
            wall_secs: wall,
            sim_advance: now - self.last_time,
            beats: self.beats,
        };
        tracing::info!(
            rank,
            sim_time = %formatted_time,
            wall_secs = wall,
            pending_activities = pending,
            "heartbeat"
        );
        self.last_wall = Instant::now();
        self.last_time = now;
        beat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beat_tracks_advance() {
        let mut hb = Heartbeat::new(1000);
        assert_eq!(hb.first(0), 1000);
        let b = hb.beat(1000, 0, "1 ns", 3);
        assert_eq!(b.sim_advance, 1000);
        let b = hb.beat(2000, 0, "2 ns", 3);
        assert_eq!(b.sim_advance, 1000);
        assert_eq!(hb.beats(), 2);
    }
}
