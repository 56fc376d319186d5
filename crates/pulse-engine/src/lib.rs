pub mod client;
pub mod clock;
pub mod dispatch;
pub mod mux;
pub mod pattern;
pub mod server;
pub mod shutdown;
pub mod socket;
pub mod stats;
pub mod wire;

pub use client::{ClientConfig, ClientEngine, ClientOutcome, ClientStats, VerifyError};
pub use mux::{Backend, Multiplexer};
pub use server::{ServerConfig, ServerEngine, ServerStats};
pub use shutdown::ShutdownFlag;
pub use socket::{FdRange, SocketEntry, SocketOptions, SocketSet};
pub use stats::{ActivityConfig, LatencyHistogram, LatencyPipeline, Spike, SpikeList};
