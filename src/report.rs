//! Final summaries: human-readable output and the optional JSON report.
//!
//! Summaries are produced by the main thread after the engine loops have
//! observed the termination flag — never from a signal handler.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use pulse_engine::client::ClientOutcome;
use pulse_engine::server::ServerStats;
use pulse_engine::shutdown::ShutdownFlag;
use pulse_engine::stats::{HistogramBucket, LatencyPipeline, Spike, BUCKET_BOUNDS_US};
use pulse_engine::wire::IP_MTU_PAYLOAD;

use crate::config::{Role, RunConfig};

/// IPv4 + UDP header bytes per fragment, for on-the-wire bandwidth math.
const IP_UDP_HEADERS: usize = 28;

fn print_termination_reason(flag: ShutdownFlag) {
    match flag.last_signal() {
        Some(libc::SIGALRM) => println!("Test end (interrupted by timer)"),
        Some(libc::SIGINT) => println!("Test end (interrupted by user)"),
        Some(sig) => println!("Test end (interrupted by signal {sig})"),
        None => println!("Test end"),
    }
}

/// Close the dot row so the summary starts on its own line.
fn close_activity_row(cfg: &RunConfig, packet_counter: u64) {
    if let Some(activity) = cfg.activity {
        if !activity.detailed && activity.ratio < packet_counter {
            println!();
        }
    }
}

pub fn print_server_summary(cfg: &RunConfig, stats: &ServerStats, flag: ShutdownFlag) {
    close_activity_row(cfg, stats.packet_counter);
    print_termination_reason(flag);

    if stats.packet_counter == 0 {
        println!("No messages were received on the server.");
    } else if cfg.stream_mode || cfg.role == Role::Bridge {
        println!("Total of {} messages received", stats.packet_counter);
    } else {
        println!(
            "Total {} messages received and echoed back",
            stats.packet_counter
        );
    }
}

pub fn print_client_summary(cfg: &RunConfig, outcome: &ClientOutcome, flag: ShutdownFlag) {
    let stats = &outcome.stats;
    close_activity_row(cfg, stats.packet_counter);
    print_termination_reason(flag);

    if stats.packet_counter == 0 {
        if cfg.stream_mode {
            println!("No messages were sent");
        } else {
            println!("No messages were received from the server. Is the server down?");
        }
        return;
    }

    let elapsed_sec = stats.elapsed_usec as f64 / 1_000_000.0;
    if cfg.stream_mode {
        if stats.cycle_counter != stats.packet_counter {
            println!(
                "Total of {} messages sent in {:.3} sec, cycles counter = {}",
                stats.packet_counter, elapsed_sec, stats.cycle_counter
            );
        } else {
            println!(
                "Total of {} messages sent in {:.3} sec",
                stats.packet_counter, elapsed_sec
            );
        }
        if stats.elapsed_usec > 0 {
            let (mps, pps, frags, mbps) = stream_rates(stats.packet_counter, stats.elapsed_usec, stats.msg_size);
            if frags == 1 {
                println!("Summary: Message Rate is {mps} [msg/sec]");
            } else {
                println!(
                    "Summary: Message Rate is {mps} [msg/sec], Packet Rate is {pps} [pkt/sec] ({frags} ip frags / msg)"
                );
            }
            println!("Summary: BandWidth is {:.3} MBps ({:.3} Mbps)", mbps, mbps * 8.0);
        }
    } else {
        if stats.duplicate_packets > 0 {
            println!(
                "Warning: Mismatched packets counter = {} (Drops, Duplicates or Out of order)",
                stats.duplicate_packets
            );
        }
        if cfg.data_integrity {
            // A failed check aborts the run before the summary.
            println!("Data integrity test succeeded");
        }

        let avg_latency = average_latency_usec(
            stats.elapsed_usec,
            stats.packet_counter,
            cfg.burst_size as u64,
        );
        println!(
            "Total {} messages sent in {:.3} sec",
            stats.packet_counter, elapsed_sec
        );
        if cfg.burst_size == 1 {
            println!("Summary: Latency is {avg_latency:.3} usec");
        } else {
            println!(
                "Summary: Latency of burst of {} packets is {avg_latency:.3} usec",
                cfg.burst_size
            );
        }
        if let Some(pipeline) = &outcome.pipeline {
            print_spikes(pipeline);
            print_histogram(pipeline);
        }
    }

    if cfg.cycle_duration_nsec > 0 && stats.cycle_wait_loops == 0 {
        println!(
            "Warning: the value of the clients cycle duration might be too small (--cycle_duration={} usec)",
            cfg.cycle_duration_nsec / 1_000
        );
    }
}

/// One-way average: half the mean round-trip, scaled to the burst.
fn average_latency_usec(elapsed_usec: u64, packet_counter: u64, burst_size: u64) -> f64 {
    elapsed_usec as f64 / (packet_counter * 2) as f64 * burst_size as f64
}

fn stream_rates(packet_counter: u64, elapsed_usec: u64, msg_size: usize) -> (u64, u64, usize, f64) {
    let frags = msg_size.div_ceil(IP_MTU_PAYLOAD).max(1);
    let secs = elapsed_usec as f64 / 1_000_000.0;
    let mps = (packet_counter as f64 / secs) as u64;
    let pps = mps * frags as u64;
    let line_bytes = msg_size + frags * IP_UDP_HEADERS;
    let mbps = mps as f64 * line_bytes as f64 / 1024.0 / 1024.0;
    (mps, pps, frags, mbps)
}

fn print_spikes(pipeline: &LatencyPipeline) {
    println!("Spikes details [usec]: ");
    for spike in pipeline.spikes.iter() {
        println!(
            "\tspike: {:6.3}   at packet counter: {}",
            spike.latency_usec, spike.packet_counter
        );
    }
}

fn print_histogram(pipeline: &LatencyPipeline) {
    println!("Latency histogram [usec]: ");
    let buckets: Vec<HistogramBucket> = pipeline.histogram.buckets().collect();
    let highest = match buckets.iter().rposition(|b| b.count > 0) {
        Some(h) => h,
        None => return,
    };
    // One empty row above the busiest bucket, then everything below it.
    let start = (highest + 1).min(BUCKET_BOUNDS_US.len() - 1);
    for bucket in buckets[..=start].iter().rev() {
        println!("\tmin_usec: {:5}  count: {}", bucket.min_usec, bucket.count);
    }
}

// ---------------------------------------------------------------------------
// JSON report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ClientReport<'a> {
    timestamp: String,
    mode: &'static str,
    duration_secs: u64,
    msg_size: usize,
    burst_size: usize,
    packet_counter: u64,
    duplicate_packets: u64,
    elapsed_usec: u64,
    cycle_counter: u64,
    cycle_wait_loops: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    average_latency_usec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_rate_per_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bandwidth_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_integrity_ok: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    histogram: Vec<HistogramBucket>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    spikes: Vec<&'a Spike>,
}

pub fn write_json_report(path: &Path, cfg: &RunConfig, outcome: &ClientOutcome) -> Result<()> {
    let stats = &outcome.stats;
    let (latency, rate, mbps) = if cfg.stream_mode {
        let (mps, _, _, mbps) = stream_rates(stats.packet_counter, stats.elapsed_usec.max(1), stats.msg_size);
        (None, Some(mps), Some(mbps))
    } else if stats.packet_counter > 0 {
        (
            Some(average_latency_usec(
                stats.elapsed_usec,
                stats.packet_counter,
                cfg.burst_size as u64,
            )),
            None,
            None,
        )
    } else {
        (None, None, None)
    };

    let report = ClientReport {
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if cfg.stream_mode { "stream" } else { "latency" },
        duration_secs: cfg.duration_secs,
        msg_size: stats.msg_size,
        burst_size: cfg.burst_size,
        packet_counter: stats.packet_counter,
        duplicate_packets: stats.duplicate_packets,
        elapsed_usec: stats.elapsed_usec,
        cycle_counter: stats.cycle_counter,
        cycle_wait_loops: stats.cycle_wait_loops,
        average_latency_usec: latency,
        message_rate_per_sec: rate,
        bandwidth_mbps: mbps,
        data_integrity_ok: cfg.data_integrity.then_some(true),
        histogram: outcome
            .pipeline
            .as_ref()
            .map(|p| p.histogram.buckets().collect())
            .unwrap_or_default(),
        spikes: outcome
            .pipeline
            .as_ref()
            .map(|p| p.spikes.iter().collect())
            .unwrap_or_default(),
    };

    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
    eprintln!("Report written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_latency_formula() {
        // 1 second, 1000 round trips, burst 1: 500 usec one-way.
        let avg = average_latency_usec(1_000_000, 1000, 1);
        assert!((avg - 500.0).abs() < f64::EPSILON);
        // Burst of 4 scales the per-burst figure.
        let avg4 = average_latency_usec(1_000_000, 1000, 4);
        assert!((avg4 - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stream_rates_single_fragment() {
        let (mps, pps, frags, mbps) = stream_rates(100_000, 1_000_000, 200);
        assert_eq!(frags, 1);
        assert_eq!(mps, 100_000);
        assert_eq!(pps, 100_000);
        // 200 payload + 28 header bytes per message.
        let expected = 100_000.0 * 228.0 / 1024.0 / 1024.0;
        assert!((mbps - expected).abs() < 0.001);
    }

    #[test]
    fn test_stream_rates_fragmented() {
        let (_, pps, frags, _) = stream_rates(1000, 1_000_000, 3000);
        assert_eq!(frags, 3);
        assert_eq!(pps, 3000);
    }
}
