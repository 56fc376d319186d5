//! Server and bridge engines.
//!
//! The echo loop: wait for readiness, receive, validate the role mask,
//! rewrite it, send back to the origin. The bridge variant runs the same
//! skeleton but forwards the payload untouched — no mask inspection, no
//! rewrite. Both poll the termination flag between every step so a signal
//! unwinds within one mux timeout.

use anyhow::{Context, Result};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::mux::{Backend, Multiplexer};
use crate::shutdown::ShutdownFlag;
use crate::socket::{self, FdRange, SocketEntry, SocketSet};
use crate::stats::{ActivityConfig, ActivityPrinter};
use crate::wire::{CLIENT_MASK, MASK_BYTE, MIN_PAYLOAD_SIZE, SERVER_MASK};

#[derive(Clone)]
pub struct ServerConfig {
    /// Bridge mode: forward payloads unmodified.
    pub bridge: bool,
    pub backend: Backend,
    pub timeout: Option<Duration>,
    /// Receive buffer size; the reply reuses the received length.
    pub max_buffer_size: usize,
    /// Count only, never echo.
    pub stream_mode: bool,
    /// Reply to the datagram source even for multicast-bound sockets.
    pub force_unicast_reply: bool,
    /// With loopback disabled a foreign mask is a configuration problem
    /// worth logging, not just noise.
    pub mc_loop_disable: bool,
    pub activity: Option<ActivityConfig>,
}

/// Per-run (per-worker) counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub packet_counter: u64,
}

/// Where an echo goes: multicast entries answer to the group, unicast
/// entries (or forced-unicast config) answer to the sender — always at the
/// entry's own port, which both ends of the benchmark bind.
fn reply_dest(entry: &SocketEntry, src: &SocketAddrV4, force_unicast: bool) -> SocketAddrV4 {
    if !entry.is_multicast || force_unicast {
        SocketAddrV4::new(*src.ip(), entry.addr.port())
    } else {
        entry.addr
    }
}

pub struct ServerEngine<'a> {
    set: &'a SocketSet,
    range: FdRange,
    cfg: ServerConfig,
    flag: ShutdownFlag,
    msgbuf: Vec<u8>,
    activity: Option<ActivityPrinter>,
    stats: ServerStats,
}

impl<'a> ServerEngine<'a> {
    pub fn new(set: &'a SocketSet, range: FdRange, cfg: ServerConfig, flag: ShutdownFlag) -> Self {
        let msgbuf = vec![0u8; cfg.max_buffer_size];
        let activity = cfg
            .activity
            .map(|a| ActivityPrinter::new(a.ratio, a.detailed));
        ServerEngine {
            set,
            range,
            cfg,
            flag,
            msgbuf,
            activity,
            stats: ServerStats::default(),
        }
    }

    /// Run until the termination flag is raised; returns this worker's
    /// counters.
    pub fn run(mut self) -> Result<ServerStats> {
        let mut mux = Multiplexer::new(self.cfg.backend, self.set, self.range, self.cfg.timeout)?;
        tracing::info!(
            "using {}() to block on socket(s), fds {}..={}",
            mux.backend().name(),
            self.range.fd_min,
            self.range.fd_max
        );

        while !self.flag.is_raised() {
            let ready = mux.wait()?;
            if self.flag.is_raised() {
                break;
            }
            if ready == 0 {
                continue;
            }
            for fd in mux.ready() {
                self.receive_then_send(fd)?;
                if self.flag.is_raised() {
                    break;
                }
            }
        }
        Ok(self.stats)
    }

    fn receive_then_send(&mut self, fd: RawFd) -> Result<()> {
        let Some((nbytes, src)) = socket::recv_from(fd, &mut self.msgbuf)
            .with_context(|| format!("recvfrom on fd {fd}"))?
        else {
            return Ok(());
        };
        if self.flag.is_raised() {
            return Ok(());
        }
        anyhow::ensure!(
            nbytes >= MIN_PAYLOAD_SIZE,
            "short datagram on fd {fd}: {nbytes} bytes"
        );

        if !self.cfg.bridge {
            if self.msgbuf[MASK_BYTE] != CLIENT_MASK {
                if self.cfg.mc_loop_disable {
                    tracing::error!("got != CLIENT_MASK");
                }
                return Ok(());
            }
            self.msgbuf[MASK_BYTE] = SERVER_MASK;
        }

        if !self.cfg.stream_mode {
            let entry = self
                .set
                .get(fd)
                .with_context(|| format!("no socket entry for ready fd {fd}"))?;
            let dest = reply_dest(entry, &src, self.cfg.force_unicast_reply);
            socket::send_to(fd, &self.msgbuf[..nbytes], &dest)
                .with_context(|| format!("sendto {dest} on fd {fd}"))?;
        }

        self.stats.packet_counter += 1;
        if let Some(activity) = &mut self.activity {
            activity.tick(self.stats.packet_counter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketOptions;
    use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
    use std::time::Duration;

    // Engine sockets bind the wildcard address; test peers bind a specific
    // 127.0.0.2 address on the same port so loopback delivery is
    // unambiguous in both directions.
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

    fn test_config(bridge: bool) -> ServerConfig {
        ServerConfig {
            bridge,
            backend: Backend::Select,
            timeout: Some(Duration::from_millis(10)),
            max_buffer_size: 1024,
            stream_mode: false,
            force_unicast_reply: false,
            mc_loop_disable: false,
            activity: None,
        }
    }

    fn run_engine_against_peer(port: u16, cfg: ServerConfig, payload: &[u8]) -> (Vec<u8>, u64) {
        let set =
            SocketSet::open(&[SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)], &SocketOptions::default())
                .unwrap();
        let flag = ShutdownFlag::for_testing();
        let range = set.full_range();

        let handle = std::thread::spawn({
            let payload = payload.to_vec();
            move || {
                let raw = socket2::Socket::new(
                    socket2::Domain::IPV4,
                    socket2::Type::DGRAM,
                    Some(socket2::Protocol::UDP),
                )
                .unwrap();
                raw.set_reuse_address(true).unwrap();
                raw.bind(&SocketAddrV4::new(PEER_IP, port).into()).unwrap();
                let peer: UdpSocket = raw.into();
                peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                peer.send_to(&payload, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
                    .unwrap();
                let mut buf = [0u8; 1024];
                match peer.recv_from(&mut buf) {
                    Ok((n, _)) => buf[..n].to_vec(),
                    Err(_) => Vec::new(),
                }
            }
        });

        let engine = ServerEngine::new(&set, range, cfg, flag);
        let stats_handle = std::thread::scope(|s| {
            let worker = s.spawn(|| engine.run().unwrap());
            let reply = handle.join().unwrap();
            flag.raise();
            let stats = worker.join().unwrap();
            (reply, stats)
        });
        (stats_handle.0, stats_handle.1.packet_counter)
    }

    #[test]
    fn test_echo_rewrites_mask_and_preserves_rest() {
        let payload = [42u8, CLIENT_MASK, 1, 2, 3, 4];
        let (reply, counted) = run_engine_against_peer(47500, test_config(false), &payload);
        assert_eq!(reply.len(), payload.len());
        assert_eq!(reply[0], 42);
        assert_eq!(reply[MASK_BYTE], SERVER_MASK);
        assert_eq!(&reply[2..], &payload[2..]);
        assert_eq!(counted, 1);
    }

    #[test]
    fn test_foreign_mask_is_discarded() {
        let payload = [7u8, 0x77, 9, 9];
        let (reply, counted) = run_engine_against_peer(47510, test_config(false), &payload);
        assert!(reply.is_empty());
        assert_eq!(counted, 0);
    }

    #[test]
    fn test_echo_of_an_echo_is_discarded() {
        // A reply that loops back must not be echoed again.
        let payload = [7u8, SERVER_MASK, 1, 2];
        let (reply, counted) = run_engine_against_peer(47520, test_config(false), &payload);
        assert!(reply.is_empty());
        assert_eq!(counted, 0);
    }

    #[test]
    fn test_bridge_forwards_payload_untouched() {
        let payload = [13u8, 0x13, 5, 6, 7];
        let (reply, counted) = run_engine_against_peer(47530, test_config(true), &payload);
        assert_eq!(reply, payload);
        assert_eq!(counted, 1);
    }

    #[test]
    fn test_stream_mode_counts_without_echo() {
        let mut cfg = test_config(false);
        cfg.stream_mode = true;
        let payload = [1u8, CLIENT_MASK, 0, 0];
        let (reply, counted) = run_engine_against_peer(47540, cfg, &payload);
        assert!(reply.is_empty());
        assert_eq!(counted, 1);
    }

    #[test]
    fn test_reply_dest_policy() {
        let set = SocketSet::open(
            &[SocketAddrV4::new(Ipv4Addr::LOCALHOST, 47550)],
            &SocketOptions::default(),
        )
        .unwrap();
        let entry = set.get(set.fd_min()).unwrap();
        let src = SocketAddrV4::new(PEER_IP, 39999);

        // Unicast entry: reply to the sender's address at the entry port.
        let dest = reply_dest(entry, &src, false);
        assert_eq!(dest, SocketAddrV4::new(PEER_IP, 47550));
        // Forced unicast behaves the same.
        assert_eq!(reply_dest(entry, &src, true), dest);
    }
}
