//! Baseband Processing Engine
//!
//! Frame-pipeline scheduler for a massive-MIMO base station: a fixed-depth
//! sliding window of per-frame buffers, a lock-free event/task queue fabric
//! feeding a worker pool, per-stage compute kernels and an asynchronous
//! sample recorder.

pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod doers;
pub mod fabric;
pub mod matmul;
pub mod recorder;
pub mod stats;
pub mod worker;

use thiserror::Error;

/// Subcarriers per 64-byte cache line of packed single-precision complex
/// samples.
pub const SCS_PER_CACHELINE: usize = 8;

/// Width of one partial-transpose block: received samples are stored as
/// contiguous runs of this many subcarriers per antenna, so gathering one
/// antenna's run stays cache-friendly at realistic antenna counts.
pub const TRANSPOSE_BLOCK_SIZE: usize = 8;

/// Antennas gathered per iteration on the vectorized path. The strided
/// gather is taken only when the antenna count is a multiple of this.
pub const SIMD_LANES: usize = 4;

/// Errors of the baseband engine.
///
/// Hot-path failures are signalled through boolean/optional returns; this
/// enum covers startup validation and the fatal dispatch conditions only.
#[derive(Error, Debug)]
pub enum PhyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Transmit queue full; air-interface timing can no longer be met")]
    TxQueueFull,

    #[error("Frame {0} exceeds the in-flight window")]
    WindowExceeded(common::FrameId),
}
