//! Monotonic timestamps for the measurement paths.
//!
//! On Linux, `CLOCK_MONOTONIC` via `clock_gettime` — the same clock the
//! latency math and the cycle scheduler share. Other platforms fall back to
//! an `Instant`-based epoch.

/// Nanosecond monotonic timestamp.
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
