//! Per-channel traffic accounting
//!
//! Packets are counted in one-second buckets per channel and direction.
//! Closed buckets are kept in a rolling window from which rate statistics
//! (average, percentiles, max) are derived.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::net::channel::{Channel, CHANNEL_COUNT};

const BUCKET: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    packets: u64,
    bytes: u64,
}

type Second = [[Bucket; CHANNEL_COUNT]; 2];

/// Rate statistics over the window, per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateStats {
    pub avg: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

impl RateStats {
    fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let len = samples.len();
        let at = |p: f32| samples[((len as f32 * p) as usize).min(len - 1)];
        Self {
            avg: samples.iter().sum::<u64>() as f64 / len as f64,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: samples[len - 1],
        }
    }
}

/// Traffic of one channel in one direction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelTraffic {
    pub channel: Channel,
    pub direction: Direction,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub bytes_per_sec: RateStats,
    pub packets_per_sec: RateStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficReport {
    /// Closed one-second buckets the statistics were computed from
    pub window_secs: usize,
    /// Only channels that carried traffic since the logger was created
    pub channels: Vec<ChannelTraffic>,
}

/// Rolling per-channel traffic counters
#[derive(Debug)]
pub struct TrafficLogger {
    window: usize,
    bucket_start: Instant,
    current: Second,
    history: VecDeque<Second>,
    totals: Second,
}

impl TrafficLogger {
    /// Logger keeping `window_secs` closed buckets (at least one)
    pub fn new(window_secs: usize) -> Self {
        Self::starting_at(window_secs, Instant::now())
    }

    pub fn starting_at(window_secs: usize, now: Instant) -> Self {
        let window = window_secs.max(1);
        Self {
            window,
            bucket_start: now,
            current: Second::default(),
            history: VecDeque::with_capacity(window),
            totals: Second::default(),
        }
    }

    /// Count one packet of `bytes` wire bytes
    pub fn record(&mut self, direction: Direction, channel: Channel, bytes: usize) {
        self.record_at(Instant::now(), direction, channel, bytes);
    }

    pub fn record_at(&mut self, now: Instant, direction: Direction, channel: Channel, bytes: usize) {
        self.roll(now);
        for second in [&mut self.current, &mut self.totals] {
            let bucket = &mut second[direction.index()][channel.index()];
            bucket.packets += 1;
            bucket.bytes += bytes as u64;
        }
    }

    /// Close every bucket that ended before `now`
    pub fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.bucket_start);
        let closed = (elapsed.as_secs() as usize).min(self.window + 1);
        if closed == 0 {
            return;
        }

        let finished = std::mem::take(&mut self.current);
        self.push_closed(finished);
        // Idle seconds count as zero traffic
        for _ in 1..closed {
            self.push_closed(Second::default());
        }
        self.bucket_start += BUCKET * elapsed.as_secs() as u32;
    }

    fn push_closed(&mut self, second: Second) {
        self.history.push_back(second);
        while self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    pub fn report(&mut self) -> TrafficReport {
        self.report_at(Instant::now())
    }

    pub fn report_at(&mut self, now: Instant) -> TrafficReport {
        self.roll(now);

        let mut channels = Vec::new();
        for direction in [Direction::Inbound, Direction::Outbound] {
            for channel in Channel::ALL {
                let total = self.totals[direction.index()][channel.index()];
                if total.packets == 0 {
                    continue;
                }
                let samples = self
                    .history
                    .iter()
                    .map(|second| second[direction.index()][channel.index()]);
                let bytes: Vec<u64> = samples.clone().map(|b| b.bytes).collect();
                let packets: Vec<u64> = samples.map(|b| b.packets).collect();
                channels.push(ChannelTraffic {
                    channel,
                    direction,
                    total_packets: total.packets,
                    total_bytes: total.bytes,
                    bytes_per_sec: RateStats::from_samples(bytes),
                    packets_per_sec: RateStats::from_samples(packets),
                });
            }
        }

        TrafficReport {
            window_secs: self.history.len(),
            channels,
        }
    }

    /// Write the current report to the log, one line per active channel
    pub fn log_summary(&mut self) {
        let report = self.report();
        for entry in &report.channels {
            info!(
                channel = %entry.channel,
                direction = entry.direction.as_str(),
                avg_bps = %format!("{:.1}", entry.bytes_per_sec.avg),
                p95_bps = entry.bytes_per_sec.p95,
                max_bps = entry.bytes_per_sec.max,
                avg_pps = %format!("{:.1}", entry.packets_per_sec.avg),
                total_bytes = entry.total_bytes,
                "Traffic"
            );
        }
    }
}

impl Default for TrafficLogger {
    fn default() -> Self {
        Self::new(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report() {
        let mut logger = TrafficLogger::new(10);
        assert!(logger.report().channels.is_empty());
    }

    #[test]
    fn test_open_bucket_not_in_rates() {
        let start = Instant::now();
        let mut logger = TrafficLogger::starting_at(10, start);
        logger.record_at(start, Direction::Outbound, Channel::Input, 100);

        let report = logger.report_at(start);
        assert_eq!(report.window_secs, 0);
        assert_eq!(report.channels.len(), 1);
        assert_eq!(report.channels[0].total_bytes, 100);
        assert_eq!(report.channels[0].bytes_per_sec.max, 0);
    }

    #[test]
    fn test_rates_per_channel_and_direction() {
        let start = Instant::now();
        let mut logger = TrafficLogger::starting_at(10, start);
        logger.record_at(start, Direction::Outbound, Channel::Replication, 700);

        for sec in 0..4u64 {
            let t = start + Duration::from_millis(sec * 1000 + 10);
            for _ in 0..=sec {
                logger.record_at(t, Direction::Inbound, Channel::Input, 50);
            }
        }

        let report = logger.report_at(start + Duration::from_secs(4));
        assert_eq!(report.window_secs, 4);

        let input = report
            .channels
            .iter()
            .find(|c| c.channel == Channel::Input)
            .unwrap();
        assert_eq!(input.direction, Direction::Inbound);
        assert_eq!(input.total_packets, 10);
        assert_eq!(input.packets_per_sec.max, 4);
        assert_eq!(input.bytes_per_sec.max, 200);
        assert!((input.bytes_per_sec.avg - 125.0).abs() < 1e-9);

        let replication = report
            .channels
            .iter()
            .find(|c| c.channel == Channel::Replication)
            .unwrap();
        assert_eq!(replication.direction, Direction::Outbound);
        assert_eq!(replication.bytes_per_sec.max, 700);
        assert_eq!(replication.bytes_per_sec.p50, 0);
    }

    #[test]
    fn test_window_is_bounded() {
        let start = Instant::now();
        let mut logger = TrafficLogger::starting_at(3, start);
        logger.record_at(start, Direction::Inbound, Channel::Time, 10);

        // Long idle gap pushes the only busy second out of the window
        let report = logger.report_at(start + Duration::from_secs(100));
        assert_eq!(report.window_secs, 3);
        assert_eq!(report.channels[0].bytes_per_sec.max, 0);
        assert_eq!(report.channels[0].total_bytes, 10);
    }
}
