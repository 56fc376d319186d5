//! Latency measurement pipeline and activity reporting.
//!
//! Per-packet round-trip times feed two structures: a fixed-bucket
//! microsecond histogram and a bounded top-K list of the highest latencies
//! seen ("spikes"). Both are per-run, single-threaded state — the
//! multithreaded server never measures latency.
//!
//! The activity printer deliberately uses wall-clock time: its interval
//! lines are a human readout, not a measurement.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::clock;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Lower bucket bounds in microseconds; the last bucket is open-ended.
pub const BUCKET_BOUNDS_US: [u64; 14] =
    [0, 3, 5, 7, 10, 15, 20, 50, 100, 200, 500, 1000, 2000, 5000];

/// Fixed-bucket latency histogram.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    counts: [u64; BUCKET_BOUNDS_US.len()],
}

/// One histogram row for reports.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub min_usec: u64,
    pub count: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        LatencyHistogram {
            counts: [0; BUCKET_BOUNDS_US.len()],
        }
    }

    /// Attribute a sample to the largest bucket whose bound is strictly
    /// below it; exact zeros land in the first bucket.
    pub fn record(&mut self, latency_usec: f64) {
        let idx = BUCKET_BOUNDS_US.partition_point(|&b| (b as f64) < latency_usec);
        self.counts[idx.saturating_sub(1)] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// `(lower_bound_usec, count)` rows, ascending.
    pub fn buckets(&self) -> impl Iterator<Item = HistogramBucket> + '_ {
        BUCKET_BOUNDS_US
            .iter()
            .zip(self.counts.iter())
            .map(|(&min_usec, &count)| HistogramBucket { min_usec, count })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Spike list
// ---------------------------------------------------------------------------

/// One of the K highest latencies observed, with the packet counter at the
/// moment it was measured.
#[derive(Debug, Clone, Serialize)]
pub struct Spike {
    pub latency_usec: f64,
    pub packet_counter: u64,
}

/// Bounded list of the K highest latencies, ascending, head = minimum.
///
/// Below capacity every sample is inserted in order. At capacity a sample
/// must exceed the head to displace it; ties insert before the first
/// strictly greater entry so the head stays the displacement target.
#[derive(Debug, Clone)]
pub struct SpikeList {
    entries: Vec<Spike>,
    capacity: usize,
}

impl SpikeList {
    pub fn new(capacity: usize) -> Self {
        SpikeList {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, latency_usec: f64, packet_counter: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            if latency_usec <= self.entries[0].latency_usec {
                return;
            }
            self.entries.remove(0);
        }
        let idx = self
            .entries
            .partition_point(|s| latency_usec > s.latency_usec);
        self.entries.insert(
            idx,
            Spike {
                latency_usec,
                packet_counter,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ascending by latency.
    pub fn iter(&self) -> impl Iterator<Item = &Spike> {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// Per-burst pipeline
// ---------------------------------------------------------------------------

/// Detailed-mode measurement state: per-packet send timestamps for one burst
/// plus the histogram and spike list they drain into.
pub struct LatencyPipeline {
    pub histogram: LatencyHistogram,
    pub spikes: SpikeList,
    send_ns: Vec<u64>,
    rtt_usec: Vec<f64>,
    counter_at: Vec<u64>,
}

impl LatencyPipeline {
    pub fn new(burst_size: usize, spike_capacity: usize) -> Self {
        LatencyPipeline {
            histogram: LatencyHistogram::new(),
            spikes: SpikeList::new(spike_capacity),
            send_ns: vec![0; burst_size],
            rtt_usec: vec![0.0; burst_size],
            counter_at: vec![0; burst_size],
        }
    }

    /// Timestamp the `index`-th send of the current burst.
    #[inline]
    pub fn mark_send(&mut self, index: usize) {
        self.send_ns[index] = clock::now_ns();
    }

    /// Record the matched reply for the `index`-th packet of the burst.
    #[inline]
    pub fn mark_matched(&mut self, index: usize, packet_counter: u64) {
        let rtt_ns = clock::now_ns().saturating_sub(self.send_ns[index]);
        self.rtt_usec[index] = rtt_ns as f64 / 1_000.0;
        self.counter_at[index] = packet_counter;
    }

    /// Feed the first `matched` samples of the burst into histogram and
    /// spike list as one-way latencies.
    pub fn flush_burst(&mut self, matched: usize) {
        for i in 0..matched {
            let latency_usec = self.rtt_usec[i] / 2.0;
            self.spikes.record(latency_usec, self.counter_at[i]);
            self.histogram.record(latency_usec);
        }
    }
}

// ---------------------------------------------------------------------------
// Activity printer
// ---------------------------------------------------------------------------

/// Activity reporting knob shared by the role engines.
#[derive(Debug, Clone, Copy)]
pub struct ActivityConfig {
    pub ratio: u64,
    pub detailed: bool,
}

/// Prints a liveness mark every `ratio` processed packets: either a bare dot
/// or a detailed interval/rate/total line with a periodic header.
pub struct ActivityPrinter {
    ratio: u64,
    detailed: bool,
    last_wall: Option<DateTime<Utc>>,
    header_countdown: u32,
}

const HEADER_EVERY: u32 = 20;

impl ActivityPrinter {
    pub fn new(ratio: u64, detailed: bool) -> Self {
        ActivityPrinter {
            ratio,
            detailed,
            last_wall: None,
            header_countdown: 0,
        }
    }

    /// Stamp the interval origin (the client calls this at test start so the
    /// first detailed line covers a real interval).
    pub fn start(&mut self) {
        self.last_wall = Some(Utc::now());
    }

    #[inline]
    pub fn tick(&mut self, packet_counter: u64) {
        if packet_counter % self.ratio == 0 {
            self.emit(packet_counter);
        }
    }

    fn emit(&mut self, packet_counter: u64) {
        if !self.detailed {
            print!(".");
            std::io::stdout().flush().ok();
            return;
        }

        let now = Utc::now();
        if let Some(last) = self.last_wall {
            let interval = now.signed_duration_since(last);
            if interval.num_seconds() < 3600 {
                let interval_usec = interval.num_microseconds().unwrap_or(0).max(0) as u64;
                if interval_usec > 0 {
                    let rate = 1_000_000 * self.ratio / interval_usec;
                    if self.header_countdown == 0 {
                        self.header_countdown = HEADER_EVERY;
                        println!(
                            "    -- Interval --     -- Message Rate --  -- Total Message Count --"
                        );
                    }
                    println!(
                        " {:10} [usec]    {:10} [msg/s]    {:13} [msg]",
                        interval_usec, rate, packet_counter
                    );
                    self.header_countdown -= 1;
                } else {
                    println!("Interval: {:8} [usec]", interval_usec);
                }
                std::io::stdout().flush().ok();
            }
        }
        self.last_wall = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_attribution() {
        let mut h = LatencyHistogram::new();
        h.record(0.0); // first bucket
        h.record(2.5); // bucket 0
        h.record(4.0); // bucket 3
        h.record(12.0); // bucket 10
        h.record(9_999.0); // open-ended bucket 5000

        let buckets: Vec<_> = h.buckets().collect();
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].count, 1); // min_usec 3
        assert_eq!(buckets[4].count, 1); // min_usec 10
        assert_eq!(buckets[13].count, 1); // min_usec 5000
        assert_eq!(h.total(), 5);
    }

    #[test]
    fn test_histogram_total_matches_samples() {
        let mut h = LatencyHistogram::new();
        for i in 0..1000 {
            h.record(i as f64 * 7.3);
        }
        assert_eq!(h.total(), 1000);
    }

    #[test]
    fn test_spike_list_top_k() {
        let mut s = SpikeList::new(3);
        for (i, lat) in [5.0, 20.0, 7.0, 100.0, 3.0, 50.0].iter().enumerate() {
            s.record(*lat, i as u64);
        }
        let latencies: Vec<f64> = s.iter().map(|sp| sp.latency_usec).collect();
        assert_eq!(latencies, vec![20.0, 50.0, 100.0]);
    }

    #[test]
    fn test_spike_list_below_capacity_keeps_everything() {
        let mut s = SpikeList::new(10);
        for (i, lat) in [9.0, 1.0, 5.0].iter().enumerate() {
            s.record(*lat, i as u64);
        }
        assert_eq!(s.len(), 3);
        let latencies: Vec<f64> = s.iter().map(|sp| sp.latency_usec).collect();
        assert_eq!(latencies, vec![1.0, 5.0, 9.0]);
    }

    #[test]
    fn test_spike_list_rejects_at_or_below_head() {
        let mut s = SpikeList::new(2);
        s.record(10.0, 1);
        s.record(20.0, 2);
        s.record(10.0, 3); // equal to head: rejected
        s.record(5.0, 4); // below head: rejected
        let latencies: Vec<f64> = s.iter().map(|sp| sp.latency_usec).collect();
        assert_eq!(latencies, vec![10.0, 20.0]);
        assert_eq!(s.iter().next().unwrap().packet_counter, 1);
    }

    #[test]
    fn test_spike_list_tie_breaks_before_greater() {
        let mut s = SpikeList::new(4);
        s.record(10.0, 1);
        s.record(30.0, 2);
        s.record(10.0, 3); // tie: sits before the 30, after nothing greater
        let counters: Vec<u64> = s.iter().map(|sp| sp.packet_counter).collect();
        assert_eq!(counters, vec![3, 1, 2]);
    }

    #[test]
    fn test_spike_list_size_invariant() {
        let mut s = SpikeList::new(5);
        for i in 0..3 {
            s.record(i as f64, i);
        }
        assert_eq!(s.len(), 3);
        for i in 3..100 {
            s.record(i as f64, i);
        }
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_pipeline_flush_counts_matched_only() {
        let mut p = LatencyPipeline::new(4, 3);
        for i in 0..4 {
            p.mark_send(i);
        }
        p.mark_matched(0, 1);
        p.mark_matched(1, 2);
        p.flush_burst(2);
        assert_eq!(p.histogram.total(), 2);
        assert_eq!(p.spikes.len(), 2);
    }
}
