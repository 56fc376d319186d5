//! udpulse — UDP latency and throughput benchmark.
//!
//! Three roles over unicast or multicast UDP: a client that sends sequenced
//! bursts at a controlled cadence and measures round-trip latency, a server
//! that echoes them back, and a bridge that forwards datagrams between two
//! multicast interfaces. Run `udpulse --help` for usage.

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod report;

use pulse_engine::client::{ClientConfig, ClientEngine, VerifyError};
use pulse_engine::mux::Backend;
use pulse_engine::server::{ServerConfig, ServerEngine};
use pulse_engine::shutdown::{self, ShutdownFlag};
use pulse_engine::socket::{self, SocketOptions, SocketSet};
use pulse_engine::{dispatch, pattern};

use config::{Role, RunConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => config::EXIT_USAGE,
            };
            std::process::exit(code);
        }
    };

    if cli.version {
        println!("udpulse {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let cfg = match config::build(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("udpulse: {err}");
            std::process::exit(err.exit_code);
        }
    };

    if cfg.daemonize {
        let rc = unsafe { libc::daemon(1, 1) };
        if rc != 0 {
            tracing::error!("failed to daemonize: {}", std::io::Error::last_os_error());
        } else {
            tracing::info!("running as daemon");
        }
    }

    if let Err(err) = run(cfg) {
        if let Some(verify) = err.downcast_ref::<VerifyError>() {
            eprintln!("udpulse: {verify}");
            std::process::exit(config::EXIT_VERIFY_FAILED);
        }
        eprintln!("udpulse: {err:#}");
        std::process::exit(config::EXIT_USAGE);
    }
}

fn run(cfg: RunConfig) -> Result<()> {
    let flag = ShutdownFlag::global();
    shutdown::install_handlers(cfg.role == Role::Client);

    let opts = SocketOptions {
        nonblocking: cfg.nonblocked,
        udp_buffer_size: cfg.udp_buffer_size,
        rx_mc_if: cfg.rx_mc_if,
        tx_mc_if: cfg.tx_mc_if,
        mc_loopback_disable: cfg.mc_loopback_disable,
        skip_mc_join: cfg.stream_mode && cfg.role == Role::Client,
        // The direct backend has no readiness wait; bound its blocking
        // receive so termination latency stays within one timeout.
        read_timeout: match cfg.backend {
            Backend::Direct => cfg.timeout,
            _ => None,
        },
    };
    let set = SocketSet::open(&cfg.addrs, &opts)?;
    print_banner(&cfg, &set);

    let mut pattern_buf = vec![0u8; cfg.max_buffer_size];
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    pattern::write_pattern(&mut pattern_buf, seed);

    if cfg.pre_warmup_wait > 0 {
        std::thread::sleep(Duration::from_secs(cfg.pre_warmup_wait));
    }
    if cfg.do_warmup {
        socket::warmup(&set, &pattern_buf, cfg.msg_size)?;
    }

    match cfg.role {
        Role::Client => run_client(&cfg, set, pattern_buf, flag),
        Role::Server if cfg.threads_num > 1 => {
            let stats = dispatch::run_server_threads(
                Arc::new(set),
                &server_config(&cfg, false),
                cfg.threads_num,
                flag,
            )?;
            report::print_server_summary(&cfg, &stats, flag);
            Ok(())
        }
        Role::Server => run_single_server(&cfg, set, flag, false),
        Role::Bridge => run_single_server(&cfg, set, flag, true),
    }
}

fn print_banner(cfg: &RunConfig, set: &SocketSet) {
    match cfg.role {
        Role::Client => println!("udpulse: [CLIENT] send on:"),
        Role::Server => println!("udpulse: [SERVER] listen on:"),
        Role::Bridge => println!(
            "udpulse: [BRIDGE] transferring packets from {} to {} on:",
            cfg.rx_mc_if, cfg.tx_mc_if
        ),
    }
    for (i, (_, entry)) in set.iter().enumerate() {
        println!(
            "[{i:2}] IP = {:<15} PORT = {:5}",
            entry.addr.ip(),
            entry.addr.port()
        );
    }
}

fn server_config(cfg: &RunConfig, bridge: bool) -> ServerConfig {
    ServerConfig {
        bridge,
        backend: cfg.backend,
        timeout: cfg.timeout,
        max_buffer_size: cfg.max_buffer_size,
        stream_mode: cfg.stream_mode,
        force_unicast_reply: cfg.force_unicast_reply,
        mc_loop_disable: cfg.mc_loopback_disable,
        activity: cfg.activity,
    }
}

fn run_single_server(cfg: &RunConfig, set: SocketSet, flag: ShutdownFlag, bridge: bool) -> Result<()> {
    let engine = ServerEngine::new(&set, set.full_range(), server_config(cfg, bridge), flag);
    let stats = engine.run()?;
    report::print_server_summary(cfg, &stats, flag);
    Ok(())
}

fn run_client(cfg: &RunConfig, set: SocketSet, pattern_buf: Vec<u8>, flag: ShutdownFlag) -> Result<()> {
    // Let warmup traffic and multicast joins settle before measuring.
    std::thread::sleep(Duration::from_secs(2));
    if flag.is_raised() {
        return Ok(());
    }

    shutdown::arm_duration_timer(cfg.duration_secs)?;

    let client_cfg = ClientConfig {
        backend: cfg.backend,
        timeout: cfg.timeout,
        msg_size: cfg.msg_size,
        msg_size_range: cfg.msg_size_range,
        burst_size: cfg.burst_size,
        stream_mode: cfg.stream_mode,
        srv_num: cfg.srv_num,
        cycle_duration_nsec: cfg.cycle_duration_nsec,
        data_integrity: cfg.data_integrity,
        spike_capacity: cfg.spike_capacity,
        mc_loop_disable: cfg.mc_loopback_disable,
        activity: cfg.activity,
    };
    let engine = ClientEngine::new(&set, client_cfg, pattern_buf, flag);
    let outcome = engine.run()?;

    report::print_client_summary(cfg, &outcome, flag);
    if let Some(path) = &cfg.json_report {
        report::write_json_report(path, cfg, &outcome)?;
    }
    Ok(())
}
