//! Compute Kernels ("Doers")
//!
//! One kernel per PHY stage. A worker thread is bound for its lifetime to
//! one doer instance; a doer consumes tasks of exactly one event type and
//! emits one completion event per task.

pub mod beamweight;
pub mod decode;
pub mod demul;
pub mod fft;
pub mod precode;

use num_complex::Complex32;

use common::{EventData, EventType, TaskTag};

pub use beamweight::DoBeamWeights;
pub use decode::DoDecode;
pub use demul::DoDemul;
pub use fft::{DoFft, DoIfft};
pub use precode::DoPrecode;

/// A bound unit of PHY-stage computation executed by one worker thread.
pub trait Doer: Send {
    /// The event type this doer consumes
    fn event_type(&self) -> EventType;

    /// Run one task to completion and return its completion event. There is
    /// no mid-task cancellation.
    fn launch(&mut self, tag: TaskTag) -> EventData;
}

/// Elementwise complex sign: `z / |z|`, with `sign(0) = 0` following the
/// numeric convention.
#[inline]
pub fn csign(z: Complex32) -> Complex32 {
    let n = z.norm();
    if n == 0.0 {
        Complex32::new(0.0, 0.0)
    } else {
        z / n
    }
}
