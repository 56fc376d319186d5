//! Signal-driven termination.
//!
//! Handlers store into two process-wide atomics and nothing else; every loop
//! in the engine polls the flag and unwinds on its own, and the summary is
//! printed by the main thread after the loops exit. Handlers are installed
//! without `SA_RESTART` so an infinite readiness wait is still unblocked by
//! a thread-directed signal.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static RAISED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(signum: libc::c_int) {
    LAST_SIGNAL.store(signum, Ordering::Relaxed);
    RAISED.store(true, Ordering::Relaxed);
}

/// Handle to a termination flag polled by the engine loops.
///
/// [`ShutdownFlag::global`] is the process-wide flag wired to the signal
/// handlers; tests use [`ShutdownFlag::for_testing`] to drive an engine
/// without touching process signal state.
#[derive(Clone, Copy)]
pub struct ShutdownFlag {
    raised: &'static AtomicBool,
    signal: &'static AtomicI32,
}

impl ShutdownFlag {
    pub fn global() -> Self {
        ShutdownFlag {
            raised: &RAISED,
            signal: &LAST_SIGNAL,
        }
    }

    /// A private flag backed by leaked atomics; no signal wiring.
    pub fn for_testing() -> Self {
        ShutdownFlag {
            raised: Box::leak(Box::new(AtomicBool::new(false))),
            signal: Box::leak(Box::new(AtomicI32::new(0))),
        }
    }

    #[inline(always)]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Relaxed)
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::Relaxed);
    }

    /// The signal that raised the flag, if any.
    pub fn last_signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::Relaxed) {
            0 => None,
            s => Some(s),
        }
    }
}

/// Install SIGINT (and for the client SIGALRM) handlers that raise the
/// global flag.
pub fn install_handlers(with_alarm: bool) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_signal as *const () as libc::sighandler_t;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0; // no SA_RESTART: blocked waits must return EINTR
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        if with_alarm {
            libc::sigaction(libc::SIGALRM, &sa, std::ptr::null_mut());
        }
    }
}

/// Arm the one-shot test-duration timer; SIGALRM fires once after `secs`.
pub fn arm_duration_timer(secs: u64) -> anyhow::Result<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: secs as libc::time_t,
            tv_usec: 0,
        },
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc != 0 {
        anyhow::bail!("setitimer: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_flag_is_isolated() {
        let a = ShutdownFlag::for_testing();
        let b = ShutdownFlag::for_testing();
        a.raise();
        assert!(a.is_raised());
        assert!(!b.is_raised());
        assert_eq!(a.last_signal(), None);
    }

    #[test]
    fn test_copy_shares_state() {
        let a = ShutdownFlag::for_testing();
        let b = a;
        b.raise();
        assert!(a.is_raised());
    }
}
