//! CLI definitions for udpulse.

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "udpulse",
    about = "UDP latency and throughput benchmark\n\nRun a server (-s) on one host, point a client (-c) at it, and measure round-trip latency, burst latency, or raw stream throughput over unicast or multicast.",
    long_about = None,
    disable_version_flag = true
)]
pub struct Cli {
    /// Run client
    #[clap(short = 'c', long = "client")]
    pub client: bool,

    /// Run server (default role, unicast echo)
    #[clap(short = 's', long = "server")]
    pub server: bool,

    /// Run in bridge mode: forward datagrams between two multicast interfaces
    #[clap(short = 'B', long = "bridge")]
    pub bridge: bool,

    /// Listen on / send to this IPv4 address
    #[clap(short = 'i', long = "ip")]
    pub ip: Option<Ipv4Addr>,

    /// UDP port (default 11111; bridge defaults to 5001)
    #[clap(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Message size in bytes (minimum 2; servers default to the maximum)
    #[clap(short = 'm', long = "msg_size")]
    pub msg_size: Option<usize>,

    /// With -m, randomly vary the message size within size ± range
    #[clap(short = 'r', long = "range")]
    pub range: Option<usize>,

    /// Number of packets the client sends in every burst
    #[clap(short = 'b', long = "burst", default_value = "1")]
    pub burst: usize,

    /// Run for this many seconds (client)
    #[clap(short = 't', long = "time", default_value = "1")]
    pub time: u64,

    /// Read multiple ip:port destinations from a file, one per line
    #[clap(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Readiness backend for multiple sockets: s|select|p|poll|e|epoll
    #[clap(short = 'F', long = "fd_handler_type")]
    pub fd_handler_type: Option<String>,

    /// Print a '.' for every N packets processed
    #[clap(short = 'a', long = "activity")]
    pub activity: Option<u64>,

    /// Print interval, rate, and total for every N packets processed
    #[clap(short = 'A', long = "Activity")]
    pub activity_detail: Option<u64>,

    /// Collect detailed latency information including the K highest spikes
    #[clap(short = 'I', long = "information")]
    pub information: Option<usize>,

    /// Stream mode: send only, no echo, no latency measurement
    #[clap(short = 'k', long = "streammode")]
    pub stream_mode: bool,

    /// Interface address on which to receive multicast packets
    #[clap(long = "rx_mc_if")]
    pub rx_mc_if: Option<Ipv4Addr>,

    /// Interface address on which to transmit multicast packets
    #[clap(long = "tx_mc_if")]
    pub tx_mc_if: Option<Ipv4Addr>,

    /// select/poll/epoll timeout in milliseconds, -1 for infinite
    #[clap(long = "timeout", default_value = "10", allow_hyphen_values = true)]
    pub timeout_msec: i64,

    /// Run N server threads (requires -f)
    #[clap(long = "threads-num")]
    pub threads_num: Option<usize>,

    /// Minimum client send+receive cycle duration in microseconds
    #[clap(long = "cycle_duration", default_value = "0")]
    pub cycle_duration_usec: u64,

    /// Request this SO_RCVBUF/SO_SNDBUF size in bytes
    #[clap(long = "udp-buffer-size")]
    pub udp_buffer_size: Option<usize>,

    /// Verify echoed payloads against the pattern; mismatch fails the run
    #[clap(long = "data_integrity")]
    pub data_integrity: bool,

    /// Run as a daemon
    #[clap(long = "daemonize")]
    pub daemonize: bool,

    /// Open non-blocking sockets
    #[clap(long = "nonblocked")]
    pub nonblocked: bool,

    /// Don't send warmup packets on start
    #[clap(long = "dontwarmup")]
    pub dontwarmup: bool,

    /// Seconds to wait before sending warmup packets
    #[clap(long = "pre_warmup_wait", default_value = "0")]
    pub pre_warmup_wait: u64,

    /// Disable multicast loopback (default enabled)
    #[clap(long = "mc_loopback_disable")]
    pub mc_loopback_disable: bool,

    /// Number of servers the client expects a reply from per packet
    #[clap(long = "srv_num", default_value = "1")]
    pub srv_num: usize,

    /// Force the server to reply via unicast even on multicast sockets
    #[clap(long = "force_unicast_reply")]
    pub force_unicast_reply: bool,

    /// Write a JSON report of the run to this file (client)
    #[clap(long = "json")]
    pub json: Option<PathBuf>,

    /// Print version
    #[clap(short = 'v', long = "version")]
    pub version: bool,
}
