//! Multithreaded server dispatcher.
//!
//! Splits the socket set into contiguous fd windows, one worker per window.
//! Workers share nothing but the read-only socket table and the termination
//! flag; each owns its mux instance, message buffer, and counters. On
//! shutdown the main thread nudges every worker with a thread-directed
//! SIGINT (unblocking an infinite wait), joins them, and sums the counters
//! it collects over a channel.

use anyhow::{Context, Result};
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::time::Duration;

use crate::server::{ServerConfig, ServerEngine, ServerStats};
use crate::shutdown::ShutdownFlag;
use crate::socket::{FdRange, SocketSet};

/// Carve the sparse fd table into `threads` contiguous windows.
///
/// The socket count divides evenly across workers with the remainder spread
/// one-per-worker from the front; each window is found by scanning for its
/// share of populated entries.
pub fn partition(set: &SocketSet, threads: usize) -> Vec<FdRange> {
    let workers = threads.clamp(1, set.len());
    let base = set.len() / workers;
    let remainder = set.len() % workers;

    let fds: Vec<_> = set.fds().collect();
    let mut ranges = Vec::with_capacity(workers);
    let mut cursor = 0usize;
    for i in 0..workers {
        let len = base + usize::from(i < remainder);
        let window = &fds[cursor..cursor + len];
        ranges.push(FdRange {
            fd_min: window[0],
            fd_max: window[len - 1],
            len,
        });
        cursor += len;
    }
    ranges
}

/// Run the server engine across `threads` workers and aggregate their
/// counters once the termination flag unwinds them.
pub fn run_server_threads(
    set: Arc<SocketSet>,
    cfg: &ServerConfig,
    threads: usize,
    flag: ShutdownFlag,
) -> Result<ServerStats> {
    let ranges = partition(&set, threads);
    tracing::info!(
        "running {} threads to manage {} sockets",
        ranges.len(),
        set.len()
    );

    let (stats_tx, stats_rx) = crossbeam_channel::bounded::<ServerStats>(ranges.len());

    let mut handles = Vec::with_capacity(ranges.len());
    for (i, range) in ranges.into_iter().enumerate() {
        let set = set.clone();
        let cfg = cfg.clone();
        let tx = stats_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("echo-worker-{i}"))
            .spawn(move || {
                let engine = ServerEngine::new(&set, range, cfg, flag);
                match engine.run() {
                    Ok(stats) => {
                        let _ = tx.send(stats);
                    }
                    Err(err) => {
                        tracing::error!("worker {i} failed: {err:#}");
                        let _ = tx.send(ServerStats::default());
                    }
                }
            })
            .context("failed to spawn server worker")?;
        handles.push(handle);
    }
    drop(stats_tx);

    while !flag.is_raised() {
        std::thread::sleep(Duration::from_secs(1));
    }

    for handle in handles {
        // Unblock a worker parked in an infinite wait.
        unsafe {
            libc::pthread_kill(handle.as_pthread_t(), libc::SIGINT);
        }
        if let Err(panic) = handle.join() {
            tracing::error!("worker panicked: {panic:?}");
        }
    }

    let mut total = ServerStats::default();
    for stats in stats_rx.iter() {
        total.packet_counter += stats.packet_counter;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Backend;
    use crate::shutdown;
    use crate::socket::SocketOptions;
    use crate::wire::{CLIENT_MASK, MASK_BYTE, SERVER_MASK};
    use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

    fn open_set(ports: &[u16]) -> SocketSet {
        let addrs: Vec<_> = ports
            .iter()
            .map(|&p| SocketAddrV4::new(Ipv4Addr::LOCALHOST, p))
            .collect();
        SocketSet::open(&addrs, &SocketOptions::default()).unwrap()
    }

    #[test]
    fn test_partition_spreads_remainder() {
        let set = open_set(&[47700, 47701, 47702, 47703, 47704]);
        let ranges = partition(&set, 2);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].len, 3);
        assert_eq!(ranges[1].len, 2);

        // Every fd lands in exactly one window.
        let mut covered: Vec<_> = ranges
            .iter()
            .flat_map(|r| set.fds_in(*r).collect::<Vec<_>>())
            .collect();
        covered.sort_unstable();
        let all: Vec<_> = set.fds().collect();
        assert_eq!(covered, all);
    }

    #[test]
    fn test_partition_clamps_to_socket_count() {
        let set = open_set(&[47710, 47711]);
        let ranges = partition(&set, 8);
        assert_eq!(ranges.len(), 2);
        assert!(ranges.iter().all(|r| r.len == 1));
    }

    #[test]
    fn test_workers_echo_and_counters_aggregate() {
        // pthread_kill(SIGINT) lands on worker threads; route it to the
        // global flag instead of the default terminate action.
        shutdown::install_handlers(false);

        let ports = [47720u16, 47721, 47722];
        let set = Arc::new(open_set(&ports));
        let flag = ShutdownFlag::for_testing();
        let cfg = ServerConfig {
            bridge: false,
            backend: Backend::Poll,
            timeout: Some(Duration::from_millis(10)),
            max_buffer_size: 256,
            stream_mode: false,
            force_unicast_reply: false,
            mc_loop_disable: false,
            activity: None,
        };

        let runner = std::thread::spawn({
            let set = set.clone();
            let cfg = cfg.clone();
            move || run_server_threads(set, &cfg, 2, flag).unwrap()
        });

        let peer_ip = Ipv4Addr::new(127, 0, 0, 2);
        for &port in &ports {
            let raw = socket2::Socket::new(
                socket2::Domain::IPV4,
                socket2::Type::DGRAM,
                Some(socket2::Protocol::UDP),
            )
            .unwrap();
            raw.set_reuse_address(true).unwrap();
            raw.bind(&SocketAddrV4::new(peer_ip, port).into()).unwrap();
            let peer: UdpSocket = raw.into();
            peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            peer.send_to(
                &[1, CLIENT_MASK, 7, 7],
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            )
            .unwrap();
            let mut buf = [0u8; 64];
            let (n, _) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(n, 4);
            assert_eq!(buf[MASK_BYTE], SERVER_MASK);
        }

        flag.raise();
        let total = runner.join().unwrap();
        assert_eq!(total.packet_counter, 3);
    }
}
