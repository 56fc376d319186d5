//! Client engine.
//!
//! The client rotates through its sockets, pinning one burst to each cycle:
//! optionally busy-wait until the cycle boundary, send `burst_size`
//! datagrams back-to-back, then (latency mode) collect one matched reply per
//! datagram before feeding the burst into the latency pipeline and rotating
//! to the next socket. Stream mode skips the reply side entirely.
//!
//! A reply matches when its mask is [`SERVER_MASK`], its sequence byte is
//! the next expected value, and its length equals the sent length. A stale
//! sequence is counted and dropped without advancing the burst. Matching
//! compares one byte, so with more than 254 datagrams in flight a wrapped
//! counter can alias — preserved behavior.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::clock;
use crate::mux::{Backend, Multiplexer};
use crate::pattern;
use crate::shutdown::ShutdownFlag;
use crate::socket::{self, SocketSet};
use crate::stats::{ActivityConfig, ActivityPrinter, LatencyPipeline};
use crate::wire::{SeqCounter, MASK_BYTE, SEQ_BYTE, SERVER_MASK};

/// Receive-path failures that abort the run with a dedicated exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    SizeMismatch { sent: usize, received: usize },
    DataIntegrity,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::SizeMismatch { sent, received } => write!(
                f,
                "received message size test failed (sent:{sent} received:{received})"
            ),
            VerifyError::DataIntegrity => write!(f, "data integrity test failed"),
        }
    }
}

impl std::error::Error for VerifyError {}

#[derive(Clone)]
pub struct ClientConfig {
    pub backend: Backend,
    pub timeout: Option<Duration>,
    pub msg_size: usize,
    /// `(min, max)` payload bounds when range mode is on; the size is
    /// re-randomized once per cycle.
    pub msg_size_range: Option<(usize, usize)>,
    pub burst_size: usize,
    pub stream_mode: bool,
    /// Matched replies required to retire one sent datagram.
    pub srv_num: usize,
    /// Minimum send+receive cycle duration; 0 = free-running.
    pub cycle_duration_nsec: u64,
    pub data_integrity: bool,
    /// Top-K spike capacity; `Some` switches on the detailed pipeline.
    pub spike_capacity: Option<usize>,
    pub mc_loop_disable: bool,
    pub activity: Option<ActivityConfig>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    pub packet_counter: u64,
    /// Drops, duplicates, or out-of-order replies.
    pub duplicate_packets: u64,
    pub cycle_counter: u64,
    pub cycle_wait_loops: u64,
    pub elapsed_usec: u64,
    /// Final payload size (range mode changes it along the way).
    pub msg_size: usize,
}

/// Everything the summary needs once the loop has unwound.
pub struct ClientOutcome {
    pub stats: ClientStats,
    pub pipeline: Option<LatencyPipeline>,
}

pub struct ClientEngine<'a> {
    set: &'a SocketSet,
    cfg: ClientConfig,
    flag: ShutdownFlag,
    /// Send buffer: byte 0 is the live sequence counter, byte 1 the client
    /// mask, the rest the integrity pattern.
    pattern: Vec<u8>,
    msgbuf: Vec<u8>,
    seq: SeqCounter,
    msg_size: usize,
    stats: ClientStats,
    pipeline: Option<LatencyPipeline>,
    activity: Option<ActivityPrinter>,
    cycle_start_nsec: u64,
    size_rng: StdRng,
}

impl<'a> ClientEngine<'a> {
    /// `pattern` is the filled pattern buffer; it must cover the largest
    /// payload the configuration can choose.
    pub fn new(set: &'a SocketSet, cfg: ClientConfig, pattern: Vec<u8>, flag: ShutdownFlag) -> Self {
        let pipeline = cfg
            .spike_capacity
            .map(|k| LatencyPipeline::new(cfg.burst_size, k));
        let activity = cfg
            .activity
            .map(|a| ActivityPrinter::new(a.ratio, a.detailed));
        let msgbuf = vec![0u8; pattern.len()];
        let msg_size = cfg.msg_size;
        ClientEngine {
            set,
            cfg,
            flag,
            pattern,
            msgbuf,
            seq: SeqCounter::new(),
            msg_size,
            stats: ClientStats::default(),
            pipeline,
            activity,
            cycle_start_nsec: 0,
            size_rng: StdRng::seed_from_u64(clock::now_ns()),
        }
    }

    /// Run until the termination flag is raised.
    pub fn run(mut self) -> Result<ClientOutcome> {
        let mut mux = Multiplexer::new(
            self.cfg.backend,
            self.set,
            self.set.full_range(),
            self.cfg.timeout,
        )?;
        if !self.cfg.stream_mode {
            tracing::info!("using {}() to block on socket(s)", mux.backend().name());
        }
        tracing::info!("starting test...");

        if let Some(activity) = &mut self.activity {
            activity.start();
        }

        let start_ns = clock::now_ns();
        // Backdate so the first cycle fires immediately.
        self.cycle_start_nsec = start_ns.wrapping_sub(self.cfg.cycle_duration_nsec);

        let mut current_fd = self.set.fd_min();
        while !self.flag.is_raised() {
            let next_fd = self
                .set
                .get(current_fd)
                .expect("rotation only visits open sockets")
                .next_fd;
            self.send_then_receive(current_fd, &mut mux)?;
            current_fd = next_fd;
        }

        self.stats.elapsed_usec = clock::now_ns().saturating_sub(start_ns) / 1_000;
        self.stats.msg_size = self.msg_size;
        Ok(ClientOutcome {
            stats: self.stats,
            pipeline: self.pipeline,
        })
    }

    /// One cycle on one socket: burst out, then collect the matched replies.
    fn send_then_receive(&mut self, ifd: RawFd, mux: &mut Multiplexer) -> Result<()> {
        self.update_msg_size();
        self.advance_seq();
        let burst_start_seq = self.seq.current();

        if self.cfg.cycle_duration_nsec > 0 {
            self.cycle_wait();
        }

        if self.cfg.stream_mode {
            self.stats.cycle_counter += 1;
        }

        let dest = self
            .set
            .get(ifd)
            .expect("rotation only visits open sockets")
            .addr;
        let burst = self.cfg.burst_size;
        for i in 0..burst {
            if self.flag.is_raised() {
                break;
            }
            if self.cfg.stream_mode {
                self.stats.packet_counter += 1;
            }
            if let Some(pipeline) = &mut self.pipeline {
                pipeline.mark_send(i);
            }
            socket::send_to(ifd, &self.pattern[..self.msg_size], &dest)
                .with_context(|| format!("sendto {dest} on fd {ifd}"))?;
            self.advance_seq();
        }

        if self.cfg.stream_mode {
            if let Some(activity) = &mut self.activity {
                activity.tick(self.stats.packet_counter);
            }
            return Ok(());
        }

        // Replay the burst's sequence window for matching.
        self.rewind_seq(burst_start_seq);

        let mut matched = 0usize;
        while matched < burst && !self.flag.is_raised() {
            matched += self.receive_round(matched, mux)?;
        }
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.flush_burst(matched.min(burst));
        }

        self.stats.cycle_counter += 1;
        Ok(())
    }

    /// One readiness round; returns how many burst slots were retired.
    /// Replies may land on any ready socket in the set, not just the one
    /// the burst went out on.
    fn receive_round(&mut self, burst_index: usize, mux: &mut Multiplexer) -> Result<usize> {
        if let Some(activity) = &mut self.activity {
            activity.tick(self.stats.packet_counter);
        }

        loop {
            let ready = mux.wait()?;
            if self.flag.is_raised() {
                return Ok(0);
            }
            if ready > 0 {
                break;
            }
        }

        let mut retired = 0usize;
        for fd in mux.ready() {
            if self.receive_matched(fd, burst_index + retired)? {
                retired += 1;
            }
            if self.flag.is_raised() || burst_index + retired >= self.cfg.burst_size {
                break;
            }
        }
        Ok(retired)
    }

    /// Block on one fd until `srv_num` legal replies for the expected
    /// sequence arrive; returns false only when terminated mid-wait.
    fn receive_matched(&mut self, fd: RawFd, burst_index: usize) -> Result<bool> {
        for _ in 0..self.cfg.srv_num {
            loop {
                if self.flag.is_raised() {
                    return Ok(false);
                }
                let Some((nbytes, _src)) = socket::recv_from(fd, &mut self.msgbuf)
                    .with_context(|| format!("recvfrom on fd {fd}"))?
                else {
                    continue;
                };
                if self.flag.is_raised() {
                    return Ok(false);
                }

                if nbytes != self.msg_size {
                    return Err(VerifyError::SizeMismatch {
                        sent: self.msg_size,
                        received: nbytes,
                    }
                    .into());
                }
                if self.msgbuf[MASK_BYTE] != SERVER_MASK {
                    if self.cfg.mc_loop_disable {
                        tracing::error!("got != SERVER_MASK");
                    }
                    continue;
                }
                if self.msgbuf[SEQ_BYTE] != self.seq.current() {
                    self.stats.duplicate_packets += 1;
                    continue;
                }
                break;
            }

            if self.cfg.data_integrity
                && !pattern::verify(&self.pattern, &mut self.msgbuf, self.msg_size)
            {
                tracing::error!("data integrity test failed");
                return Err(VerifyError::DataIntegrity.into());
            }
        }

        self.stats.packet_counter += 1;
        let counter = self.stats.packet_counter;
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.mark_matched(burst_index, counter);
        }
        self.advance_seq();
        Ok(true)
    }

    /// Busy-wait to the cycle boundary, then advance it by exactly one
    /// duration. A loop counter that never moves means the duration is too
    /// short to matter — the summary warns about it.
    fn cycle_wait(&mut self) {
        let target = self.cycle_start_nsec.wrapping_add(self.cfg.cycle_duration_nsec);
        while !self.flag.is_raised() {
            if clock::now_ns() >= target {
                break;
            }
            self.stats.cycle_wait_loops += 1;
        }
        self.cycle_start_nsec = target;
    }

    fn update_msg_size(&mut self) {
        if let Some((min, max)) = self.cfg.msg_size_range {
            self.msg_size = self.size_rng.gen_range(min..=max);
        }
    }

    fn advance_seq(&mut self) {
        let v = self.seq.advance();
        self.pattern[SEQ_BYTE] = v;
    }

    fn rewind_seq(&mut self, value: u8) {
        self.seq.rewind_to(value);
        self.pattern[SEQ_BYTE] = value;
    }
}
