//! Socket set construction and datagram I/O.
//!
//! Each benchmark destination gets one UDP socket bound to
//! `INADDR_ANY:port`. The set is a sparse fd-indexed table; after every
//! socket is open the entries are threaded into a single `next_fd` cycle in
//! ascending fd order, which is the client's rotation structure. Entries are
//! immutable once the cycle is closed, so the set can be shared read-only
//! across server workers.
//!
//! Construction failures are fatal by design — the benchmark cannot produce
//! meaningful numbers with a degraded set. Steady-state receive treats
//! `EAGAIN`/`EINTR` as "try again"; send retries `EINTR` and reports
//! everything else to the caller.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::io;
use std::mem::size_of;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Socket-level knobs applied to every socket in the set.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub nonblocking: bool,
    /// Requested `SO_RCVBUF`/`SO_SNDBUF`; `None` keeps the system default.
    pub udp_buffer_size: Option<usize>,
    /// Interface address for multicast membership.
    pub rx_mc_if: Ipv4Addr,
    /// Interface address for outgoing multicast (`IP_MULTICAST_IF`).
    pub tx_mc_if: Ipv4Addr,
    pub mc_loopback_disable: bool,
    /// A send-only stream client does not join groups it never reads from.
    pub skip_mc_join: bool,
    /// Bounds the blocking receive of the direct backend.
    pub read_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            nonblocking: false,
            udp_buffer_size: None,
            rx_mc_if: Ipv4Addr::UNSPECIFIED,
            tx_mc_if: Ipv4Addr::UNSPECIFIED,
            mc_loopback_disable: false,
            skip_mc_join: false,
            read_timeout: None,
        }
    }
}

/// One open socket and its benchmark destination.
pub struct SocketEntry {
    pub socket: Socket,
    pub addr: SocketAddrV4,
    pub is_multicast: bool,
    /// Circular link to the next entry, ascending fd order with wrap-around.
    pub next_fd: RawFd,
}

/// A contiguous fd window over the sparse table: the unit of work a mux
/// instance or a server worker operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdRange {
    pub fd_min: RawFd,
    pub fd_max: RawFd,
    pub len: usize,
}

/// Sparse fd-indexed table of open sockets.
pub struct SocketSet {
    entries: BTreeMap<RawFd, SocketEntry>,
    fd_min: RawFd,
    fd_max: RawFd,
}

impl SocketSet {
    /// Open one socket per destination and close the rotation cycle.
    pub fn open(addrs: &[SocketAddrV4], opts: &SocketOptions) -> Result<Self> {
        anyhow::ensure!(!addrs.is_empty(), "no destinations to open sockets for");

        let mut opened: Vec<(RawFd, SocketEntry)> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let socket = prepare_socket(addr, opts)
                .with_context(|| format!("preparing socket for {addr}"))?;
            let fd = socket.as_raw_fd();
            opened.push((
                fd,
                SocketEntry {
                    socket,
                    addr: *addr,
                    is_multicast: addr.ip().is_multicast(),
                    next_fd: fd,
                },
            ));
        }

        opened.sort_by_key(|(fd, _)| *fd);
        let fd_min = opened.first().expect("at least one socket").0;
        let fd_max = opened.last().expect("at least one socket").0;
        for i in 0..opened.len() {
            let next = if i + 1 < opened.len() {
                opened[i + 1].0
            } else {
                fd_min
            };
            opened[i].1.next_fd = next;
        }

        Ok(SocketSet {
            entries: opened.into_iter().collect(),
            fd_min,
            fd_max,
        })
    }

    pub fn fd_min(&self) -> RawFd {
        self.fd_min
    }

    pub fn fd_max(&self) -> RawFd {
        self.fd_max
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, fd: RawFd) -> Option<&SocketEntry> {
        self.entries.get(&fd)
    }

    /// All descriptors in ascending order.
    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.entries.keys().copied()
    }

    /// Descriptors within a worker's window, ascending.
    pub fn fds_in(&self, range: FdRange) -> impl Iterator<Item = RawFd> + '_ {
        self.entries.range(range.fd_min..=range.fd_max).map(|(fd, _)| *fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &SocketEntry)> {
        self.entries.iter().map(|(fd, e)| (*fd, e))
    }

    /// The window covering the whole set.
    pub fn full_range(&self) -> FdRange {
        FdRange {
            fd_min: self.fd_min,
            fd_max: self.fd_max,
            len: self.entries.len(),
        }
    }
}

/// Create and configure one UDP socket for `addr`.
fn prepare_socket(addr: &SocketAddrV4, opts: &SocketOptions) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    if opts.nonblocking {
        socket.set_nonblocking(true)?;
    }
    socket.set_reuse_address(true)?;

    if let Some(size) = opts.udp_buffer_size {
        socket.set_recv_buffer_size(size)?;
        socket.set_send_buffer_size(size)?;
        let rcv = socket.recv_buffer_size()?;
        let snd = socket.send_buffer_size()?;
        tracing::info!(
            fd = socket.as_raw_fd(),
            rcv_bytes = rcv,
            snd_bytes = snd,
            "UDP buffer sizes"
        );
        // The kernel reports double the granted size; anything below that
        // means the request was clamped by rmem_max/wmem_max.
        if rcv < size * 2 || snd < size * 2 {
            tracing::warn!(
                requested = size,
                "failed setting receive or send udp buffer size (check 'sysctl net.core.rmem_max')"
            );
        }
    }

    if let Some(timeout) = opts.read_timeout {
        socket.set_read_timeout(Some(timeout))?;
    }

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port());
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("bind {bind_addr}"))?;

    if addr.ip().is_multicast() {
        if !opts.skip_mc_join {
            socket
                .join_multicast_v4(addr.ip(), &opts.rx_mc_if)
                .with_context(|| format!("IP_ADD_MEMBERSHIP {} on {}", addr.ip(), opts.rx_mc_if))?;
        }
        if opts.tx_mc_if != Ipv4Addr::UNSPECIFIED {
            socket
                .set_multicast_if_v4(&opts.tx_mc_if)
                .with_context(|| format!("IP_MULTICAST_IF {}", opts.tx_mc_if))?;
        }
        if opts.mc_loopback_disable {
            socket.set_multicast_loop_v4(false)?;
        }
    }

    Ok(socket)
}

fn sockaddr_from(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn sockaddr_to(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

/// Receive one datagram.
///
/// `Ok(None)` covers the benign cases: `EAGAIN`/`EWOULDBLOCK` (nonblocking or
/// read-timeout expiry) and `EINTR`. Anything else is a real error the
/// caller treats as fatal.
pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
    let mut src: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut src_len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut src as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut src_len,
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
                Ok(None)
            }
            _ => Err(err),
        };
    }
    Ok(Some((n as usize, sockaddr_to(&src))))
}

/// Send one datagram, retrying `EINTR`.
pub fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddrV4) -> io::Result<usize> {
    let dest = sockaddr_from(addr);
    loop {
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &dest as *const libc::sockaddr_in as *const libc::sockaddr,
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Send warmup datagrams: two per multicast destination, addressed to the
/// group at a port nothing listens on.
pub fn warmup(set: &SocketSet, pattern: &[u8], msg_size: usize) -> Result<()> {
    tracing::info!("warmup stage (sending a few dummy packets)...");
    for (fd, entry) in set.iter() {
        if !entry.is_multicast {
            continue;
        }
        let dest = SocketAddrV4::new(*entry.addr.ip(), crate::wire::WARMUP_PORT);
        for _ in 0..2 {
            send_to(fd, &pattern[..msg_size], &dest)
                .with_context(|| format!("warmup send on fd {fd}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn test_rotation_is_a_single_cycle() {
        let addrs = [loopback(47311), loopback(47312), loopback(47313)];
        let set = SocketSet::open(&addrs, &SocketOptions::default()).unwrap();
        assert_eq!(set.len(), 3);

        let mut visited = Vec::new();
        let mut fd = set.fd_min();
        loop {
            visited.push(fd);
            fd = set.get(fd).unwrap().next_fd;
            if fd == set.fd_min() {
                break;
            }
        }
        assert_eq!(visited.len(), set.len());
        visited.sort_unstable();
        visited.dedup();
        assert_eq!(visited.len(), set.len());
    }

    #[test]
    fn test_single_entry_links_to_itself() {
        let set = SocketSet::open(&[loopback(47321)], &SocketOptions::default()).unwrap();
        let fd = set.fd_min();
        assert_eq!(set.get(fd).unwrap().next_fd, fd);
        assert_eq!(set.fd_min(), set.fd_max());
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let addrs = [loopback(47331)];
        let set = SocketSet::open(&addrs, &SocketOptions::default()).unwrap();
        let fd = set.fd_min();

        let payload = [7u8, 0x55, 3, 4];
        send_to(fd, &payload, &loopback(47331)).unwrap();

        let mut buf = [0u8; 64];
        let (n, src) = recv_from(fd, &mut buf).unwrap().unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &payload);
        assert_eq!(*src.ip(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_nonblocking_recv_returns_none() {
        let opts = SocketOptions {
            nonblocking: true,
            ..SocketOptions::default()
        };
        let set = SocketSet::open(&[loopback(47341)], &opts).unwrap();
        let mut buf = [0u8; 16];
        assert!(recv_from(set.fd_min(), &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_fds_in_range() {
        let addrs = [loopback(47351), loopback(47352), loopback(47353)];
        let set = SocketSet::open(&addrs, &SocketOptions::default()).unwrap();
        let all: Vec<_> = set.fds().collect();
        let window = FdRange {
            fd_min: all[0],
            fd_max: all[1],
            len: 2,
        };
        let sub: Vec<_> = set.fds_in(window).collect();
        assert_eq!(sub, &all[..2]);
    }
}
