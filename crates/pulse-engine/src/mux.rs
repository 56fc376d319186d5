//! Readiness multiplexer.
//!
//! One `wait` operation over four backends: direct single-socket receive,
//! `select`, `poll`, and `epoll`. The backend decides the iteration shape —
//! direct yields its one fd, select scans `[fd_min, fd_max]` against the
//! readable bitset, poll walks its stable array, epoll walks only the
//! returned events — and [`Multiplexer::ready`] exposes all four behind one
//! iterator in the backend's natural order.
//!
//! A zero return with a timeout configured means "no work"; with an infinite
//! timeout it is reported as an error and the loop carries on. `EINTR` is
//! benign and surfaces as an empty ready set so the caller re-checks the
//! termination flag.

use anyhow::{bail, Context, Result};
use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;

use crate::socket::{FdRange, SocketSet};

/// How the engine blocks on its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// No readiness wait; the caller's blocking receive is the wait.
    /// Only valid for a single-socket set.
    Direct,
    Select,
    Poll,
    Epoll,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Direct => "recvfrom",
            Backend::Select => "select",
            Backend::Poll => "poll",
            Backend::Epoll => "epoll",
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" | "select" => Ok(Backend::Select),
            "p" | "poll" => Ok(Backend::Poll),
            "e" | "epoll" => Ok(Backend::Epoll),
            other => bail!("invalid io handler type: {other} (expected s|select|p|poll|e|epoll)"),
        }
    }
}

/// Owns the epoll instance so it closes with the multiplexer.
struct EpollFd(RawFd);

impl Drop for EpollFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

enum Inner {
    Direct {
        fd: RawFd,
    },
    Select {
        /// Registered set; the kernel mutates the working copy every call.
        template: libc::fd_set,
        current: libc::fd_set,
        fd_min: RawFd,
        fd_max: RawFd,
    },
    Poll {
        fds: Vec<libc::pollfd>,
    },
    Epoll {
        epfd: EpollFd,
        events: Vec<libc::epoll_event>,
    },
}

pub struct Multiplexer {
    inner: Inner,
    timeout: Option<Duration>,
    /// Readiness count from the last `wait`.
    last_ready: usize,
}

impl Multiplexer {
    /// Build per-backend state for the descriptors of `range`.
    pub fn new(
        backend: Backend,
        set: &SocketSet,
        range: FdRange,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let inner = match backend {
            Backend::Direct => {
                anyhow::ensure!(
                    range.len == 1,
                    "direct receive requires exactly one socket, got {}",
                    range.len
                );
                Inner::Direct { fd: range.fd_min }
            }
            Backend::Select => {
                anyhow::ensure!(
                    (range.fd_max as usize) < libc::FD_SETSIZE,
                    "fd {} exceeds FD_SETSIZE",
                    range.fd_max
                );
                let mut template: libc::fd_set = unsafe { std::mem::zeroed() };
                unsafe {
                    libc::FD_ZERO(&mut template);
                    for fd in set.fds_in(range) {
                        libc::FD_SET(fd, &mut template);
                    }
                }
                Inner::Select {
                    template,
                    current: template,
                    fd_min: range.fd_min,
                    fd_max: range.fd_max,
                }
            }
            Backend::Poll => {
                let fds = set
                    .fds_in(range)
                    .map(|fd| libc::pollfd {
                        fd,
                        events: libc::POLLIN | libc::POLLPRI,
                        revents: 0,
                    })
                    .collect();
                Inner::Poll { fds }
            }
            Backend::Epoll => {
                let epfd = unsafe { libc::epoll_create1(0) };
                if epfd < 0 {
                    return Err(io::Error::last_os_error()).context("epoll_create1");
                }
                let epfd = EpollFd(epfd);
                for fd in set.fds_in(range) {
                    let mut ev = libc::epoll_event {
                        events: (libc::EPOLLIN | libc::EPOLLPRI) as u32,
                        u64: fd as u64,
                    };
                    let rc = unsafe { libc::epoll_ctl(epfd.0, libc::EPOLL_CTL_ADD, fd, &mut ev) };
                    if rc != 0 {
                        return Err(io::Error::last_os_error())
                            .with_context(|| format!("epoll_ctl ADD fd {fd}"));
                    }
                }
                Inner::Epoll {
                    epfd,
                    events: vec![unsafe { std::mem::zeroed() }; range.len],
                }
            }
        };
        Ok(Multiplexer {
            inner,
            timeout,
            last_ready: 0,
        })
    }

    pub fn backend(&self) -> Backend {
        match self.inner {
            Inner::Direct { .. } => Backend::Direct,
            Inner::Select { .. } => Backend::Select,
            Inner::Poll { .. } => Backend::Poll,
            Inner::Epoll { .. } => Backend::Epoll,
        }
    }

    fn timeout_msec(&self) -> libc::c_int {
        match self.timeout {
            Some(t) => t.as_millis() as libc::c_int,
            None => -1,
        }
    }

    /// Block until at least one descriptor is readable or the timeout
    /// expires; returns the ready count (0 = no work).
    pub fn wait(&mut self) -> Result<usize> {
        let timeout = self.timeout;
        let timeout_msec = self.timeout_msec();

        let res = match &mut self.inner {
            // The subsequent blocking receive is the wait.
            Inner::Direct { .. } => 1,
            Inner::Select {
                template,
                current,
                fd_max,
                ..
            } => {
                *current = *template;
                let mut tv;
                let tv_ptr = match timeout {
                    Some(t) => {
                        tv = libc::timeval {
                            tv_sec: t.as_secs() as libc::time_t,
                            tv_usec: t.subsec_micros() as libc::suseconds_t,
                        };
                        &mut tv as *mut libc::timeval
                    }
                    None => std::ptr::null_mut(),
                };
                let rc = unsafe {
                    libc::select(
                        *fd_max + 1,
                        current as *mut libc::fd_set,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        tv_ptr,
                    )
                };
                check_wait_result(rc, "select")?
            }
            Inner::Poll { fds } => {
                let rc = unsafe {
                    libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_msec)
                };
                check_wait_result(rc, "poll")?
            }
            Inner::Epoll { epfd, events } => {
                let rc = unsafe {
                    libc::epoll_wait(
                        epfd.0,
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        timeout_msec,
                    )
                };
                check_wait_result(rc, "epoll_wait")?
            }
        };

        if res == 0 && timeout.is_none() && !matches!(self.inner, Inner::Direct { .. }) {
            tracing::error!("{}() returned without fd ready", self.backend().name());
        }
        self.last_ready = res;
        Ok(res)
    }

    /// Descriptors ready after the last `wait`, in backend order.
    pub fn ready(&self) -> Ready<'_> {
        Ready {
            mux: self,
            cursor: 0,
        }
    }
}

/// `EINTR` is an empty ready set; any other negative return is fatal.
fn check_wait_result(rc: libc::c_int, what: &str) -> Result<usize> {
    if rc >= 0 {
        return Ok(rc as usize);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        return Ok(0);
    }
    Err(err).context(what.to_string())
}

/// Iterator over the ready descriptors of the last `wait`.
pub struct Ready<'a> {
    mux: &'a Multiplexer,
    cursor: usize,
}

impl Iterator for Ready<'_> {
    type Item = RawFd;

    fn next(&mut self) -> Option<RawFd> {
        if self.mux.last_ready == 0 {
            return None;
        }
        match &self.mux.inner {
            Inner::Direct { fd } => {
                if self.cursor == 0 {
                    self.cursor = 1;
                    Some(*fd)
                } else {
                    None
                }
            }
            Inner::Select {
                current,
                fd_min,
                fd_max,
                ..
            } => {
                let mut fd = *fd_min + self.cursor as RawFd;
                while fd <= *fd_max {
                    self.cursor += 1;
                    let is_set =
                        unsafe { libc::FD_ISSET(fd, current as *const libc::fd_set as *mut _) };
                    if is_set {
                        return Some(fd);
                    }
                    fd = *fd_min + self.cursor as RawFd;
                }
                None
            }
            Inner::Poll { fds } => {
                while self.cursor < fds.len() {
                    let pfd = &fds[self.cursor];
                    self.cursor += 1;
                    if pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                        return Some(pfd.fd);
                    }
                }
                None
            }
            Inner::Epoll { events, .. } => {
                if self.cursor < self.mux.last_ready {
                    let fd = events[self.cursor].u64 as RawFd;
                    self.cursor += 1;
                    Some(fd)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{SocketOptions, SocketSet};
    use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn open_pair(base_port: u16) -> SocketSet {
        let addrs = [loopback(base_port), loopback(base_port + 1)];
        SocketSet::open(&addrs, &SocketOptions::default()).unwrap()
    }

    fn ready_after_send(backend: Backend, base_port: u16) -> Vec<RawFd> {
        let set = open_pair(base_port);
        let mut mux = Multiplexer::new(
            backend,
            &set,
            set.full_range(),
            Some(Duration::from_millis(500)),
        )
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[1, 2, 3], loopback(base_port)).unwrap();

        let n = mux.wait().unwrap();
        assert!(n >= 1);
        mux.ready().collect()
    }

    #[test]
    fn test_select_reports_ready_fd() {
        let ready = ready_after_send(Backend::Select, 47400);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_poll_reports_ready_fd() {
        let ready = ready_after_send(Backend::Poll, 47410);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_epoll_reports_ready_fd() {
        let ready = ready_after_send(Backend::Epoll, 47420);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_timeout_yields_no_work() {
        let set = open_pair(47430);
        for backend in [Backend::Select, Backend::Poll, Backend::Epoll] {
            let mut mux = Multiplexer::new(
                backend,
                &set,
                set.full_range(),
                Some(Duration::from_millis(10)),
            )
            .unwrap();
            assert_eq!(mux.wait().unwrap(), 0);
            assert_eq!(mux.ready().count(), 0);
        }
    }

    #[test]
    fn test_select_template_survives_repeated_waits() {
        let set = open_pair(47440);
        let mut mux = Multiplexer::new(
            Backend::Select,
            &set,
            set.full_range(),
            Some(Duration::from_millis(10)),
        )
        .unwrap();
        // First wait times out and the kernel zeroes the working set; the
        // template must still find the fd on the next round.
        assert_eq!(mux.wait().unwrap(), 0);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[9], loopback(47440)).unwrap();
        let n = mux.wait().unwrap();
        assert_eq!(n, 1);
        assert_eq!(mux.ready().count(), 1);
    }

    #[test]
    fn test_direct_requires_single_socket() {
        let set = open_pair(47450);
        assert!(Multiplexer::new(Backend::Direct, &set, set.full_range(), None).is_err());
    }

    #[test]
    fn test_direct_always_ready() {
        let set = SocketSet::open(&[loopback(47460)], &SocketOptions::default()).unwrap();
        let mut mux = Multiplexer::new(Backend::Direct, &set, set.full_range(), None).unwrap();
        assert_eq!(mux.wait().unwrap(), 1);
        let ready: Vec<_> = mux.ready().collect();
        assert_eq!(ready, vec![set.fd_min()]);
    }
}
