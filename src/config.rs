//! Run configuration: CLI validation and socket-list file parsing.
//!
//! Turns the raw CLI surface into a validated [`RunConfig`] the role engines
//! consume. Every rejection carries the exit code the process must leave
//! with: 1 for argument errors, 4 for a missing socket-list file, 8 for a
//! malformed line in it.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pulse_engine::mux::Backend;
use pulse_engine::stats::ActivityConfig;
use pulse_engine::wire::{MAX_PAYLOAD_SIZE, MIN_PAYLOAD_SIZE};

use crate::cli::Cli;

pub const DEFAULT_PORT: u16 = 11111;
/// Bridge listens on iperf's default port unless told otherwise.
pub const DEFAULT_BRIDGE_PORT: u16 = 5001;
pub const MAX_TEST_DURATION: u64 = 36_000_000;

pub const EXIT_USAGE: i32 = 1;
pub const EXIT_NO_FILE: i32 = 4;
pub const EXIT_BAD_FILE_LINE: i32 = 8;
pub const EXIT_VERIFY_FAILED: i32 = 16;

/// A configuration rejection plus the exit code it maps to.
#[derive(Debug)]
pub struct ConfigError {
    pub exit_code: i32,
    message: String,
}

impl ConfigError {
    fn usage(message: impl Into<String>) -> Self {
        ConfigError {
            exit_code: EXIT_USAGE,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    Bridge,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
            Role::Bridge => "bridge",
        }
    }
}

/// Everything a run needs, validated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub role: Role,
    pub addrs: Vec<SocketAddrV4>,
    pub backend: Backend,
    pub timeout: Option<Duration>,
    pub msg_size: usize,
    /// `(min, max)` when `-r` range mode is active.
    pub msg_size_range: Option<(usize, usize)>,
    /// Receive/pattern buffer size: covers the largest possible payload.
    pub max_buffer_size: usize,
    pub burst_size: usize,
    pub duration_secs: u64,
    pub threads_num: usize,
    pub stream_mode: bool,
    pub data_integrity: bool,
    pub spike_capacity: Option<usize>,
    pub activity: Option<ActivityConfig>,
    pub srv_num: usize,
    pub cycle_duration_nsec: u64,
    pub force_unicast_reply: bool,
    pub mc_loopback_disable: bool,
    pub nonblocked: bool,
    pub do_warmup: bool,
    pub pre_warmup_wait: u64,
    pub udp_buffer_size: Option<usize>,
    pub rx_mc_if: Ipv4Addr,
    pub tx_mc_if: Ipv4Addr,
    pub daemonize: bool,
    pub json_report: Option<PathBuf>,
}

pub fn build(cli: &Cli) -> Result<RunConfig, ConfigError> {
    let role = match (cli.client, cli.server, cli.bridge) {
        (true, false, false) => Role::Client,
        (false, _, false) => Role::Server,
        (false, false, true) => Role::Bridge,
        _ => return Err(ConfigError::usage("pick exactly one of -c, -s, -B")),
    };

    let msg_size = cli.msg_size.unwrap_or(match role {
        Role::Client => MIN_PAYLOAD_SIZE,
        // Servers size for whatever the client may send.
        Role::Server | Role::Bridge => MAX_PAYLOAD_SIZE,
    });
    if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&msg_size) {
        return Err(ConfigError::usage(format!(
            "invalid message size: {msg_size} (min: {MIN_PAYLOAD_SIZE}, max: {MAX_PAYLOAD_SIZE})"
        )));
    }

    if cli.burst < 1 {
        return Err(ConfigError::usage(format!(
            "invalid burst size: {}",
            cli.burst
        )));
    }
    if cli.time == 0 || cli.time > MAX_TEST_DURATION {
        return Err(ConfigError::usage(format!(
            "invalid duration: {} (max: {MAX_TEST_DURATION})",
            cli.time
        )));
    }
    if cli.srv_num < 1 {
        return Err(ConfigError::usage(format!(
            "invalid server num: {}",
            cli.srv_num
        )));
    }
    if cli.timeout_msec < -1 {
        return Err(ConfigError::usage(format!(
            "invalid select/poll/epoll timeout: {}",
            cli.timeout_msec
        )));
    }

    if cli.range.is_some() && role != Role::Client {
        return Err(ConfigError::usage(
            "dynamic message size mode can be used on client side only",
        ));
    }
    if cli.threads_num.is_some() && role != Role::Server {
        return Err(ConfigError::usage("--threads-num can only work on server side"));
    }
    if cli.threads_num.is_some() && cli.file.is_none() {
        return Err(ConfigError::usage(
            "--threads-num must be used with a feed file (option '-f')",
        ));
    }
    if cli.fd_handler_type.is_some() && cli.file.is_none() {
        return Err(ConfigError::usage(
            "[-F | --fd_handler_type] has to come with option [-f | --file]",
        ));
    }

    let backend = match (&cli.fd_handler_type, &cli.file) {
        (Some(kind), _) => kind
            .parse::<Backend>()
            .map_err(|e| ConfigError::usage(e.to_string()))?,
        // A multi-socket set needs a real readiness backend.
        (None, Some(_)) => Backend::Select,
        (None, None) => Backend::Direct,
    };

    let addrs = match &cli.file {
        Some(path) => parse_socket_list(path)?,
        None => {
            let ip = cli.ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
            let port = cli.port.unwrap_or(match role {
                Role::Bridge => DEFAULT_BRIDGE_PORT,
                _ => DEFAULT_PORT,
            });
            vec![SocketAddrV4::new(ip, port)]
        }
    };

    let msg_size_range = match cli.range {
        Some(0) | None => None,
        Some(r) => {
            let min = msg_size.saturating_sub(r).max(MIN_PAYLOAD_SIZE);
            let max = (msg_size + r).min(MAX_PAYLOAD_SIZE);
            tracing::info!("message size range: [{min} - {max}]");
            Some((min, max))
        }
    };
    let max_buffer_size = msg_size_range.map_or(msg_size, |(_, max)| max);

    let activity = match (cli.activity, cli.activity_detail) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::usage("-a and -A are mutually exclusive"))
        }
        (Some(ratio), None) if ratio > 0 => Some(ActivityConfig {
            ratio,
            detailed: false,
        }),
        (None, Some(ratio)) if ratio > 0 => Some(ActivityConfig {
            ratio,
            detailed: true,
        }),
        _ => None,
    };

    if let Some(k) = cli.information {
        if k < 1 {
            return Err(ConfigError::usage(format!("invalid spikes quantity: {k}")));
        }
    }

    let timeout = match cli.timeout_msec {
        -1 => None,
        msec => Some(Duration::from_millis(msec as u64)),
    };

    Ok(RunConfig {
        role,
        addrs,
        backend,
        timeout,
        msg_size,
        msg_size_range,
        max_buffer_size,
        burst_size: cli.burst,
        duration_secs: cli.time,
        threads_num: cli.threads_num.unwrap_or(1),
        stream_mode: cli.stream_mode,
        data_integrity: cli.data_integrity,
        spike_capacity: cli.information,
        activity,
        srv_num: cli.srv_num,
        cycle_duration_nsec: cli.cycle_duration_usec.saturating_mul(1_000),
        force_unicast_reply: cli.force_unicast_reply,
        mc_loopback_disable: cli.mc_loopback_disable,
        nonblocked: cli.nonblocked,
        do_warmup: !cli.dontwarmup,
        pre_warmup_wait: cli.pre_warmup_wait,
        udp_buffer_size: cli.udp_buffer_size,
        rx_mc_if: cli.rx_mc_if.unwrap_or(Ipv4Addr::UNSPECIFIED),
        tx_mc_if: cli.tx_mc_if.unwrap_or(Ipv4Addr::UNSPECIFIED),
        daemonize: cli.daemonize,
        json_report: cli.json.clone(),
    })
}

/// Parse a socket-list file: one `ip:port` per line, blank tail permitted.
pub fn parse_socket_list(path: &Path) -> Result<Vec<SocketAddrV4>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError {
        exit_code: EXIT_NO_FILE,
        message: format!("no such file: {}", path.display()),
    })?;

    let mut addrs = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let addr = parse_ip_port(line).ok_or_else(|| ConfigError {
            exit_code: EXIT_BAD_FILE_LINE,
            message: format!(
                "invalid input in line {}: each line must have the following format: ip:port",
                lineno + 1
            ),
        })?;
        addrs.push(addr);
    }

    if addrs.is_empty() {
        return Err(ConfigError {
            exit_code: EXIT_BAD_FILE_LINE,
            message: format!("no destinations in {}", path.display()),
        });
    }
    Ok(addrs)
}

fn parse_ip_port(line: &str) -> Option<SocketAddrV4> {
    let (ip, port) = line.split_once(':')?;
    let ip: Ipv4Addr = ip.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddrV4::new(ip, port))
}
