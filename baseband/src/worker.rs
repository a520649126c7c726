//! Worker Pool
//!
//! Long-lived compute threads. Each worker is bound at spawn time to one
//! pipeline stage and one schedule-queue shard, builds its doer once, and
//! then polls its task partition until shutdown. Workers never block on a
//! lock: an empty partition costs a short spin, then a yield.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::buffer::BasebandBuffer;
use crate::config::{FrameSchedule, PhyConfig};
use crate::doers::{DoBeamWeights, DoDecode, DoDemul, DoFft, DoIfft, DoPrecode, Doer};
use crate::fabric::EventFabric;
use crate::matmul::{select_backend, GemmBackend};
use crate::stats::Stats;
use common::DoerType;

/// Idle polls before a worker yields its timeslice.
const IDLE_SPIN_LIMIT: u32 = 64;

/// The pipeline stages a schedule actually exercises, in dispatch order.
/// FFT and beam weights always run; the data stages depend on the schedule
/// containing symbols of their direction.
pub fn required_stages(schedule: &FrameSchedule) -> Vec<DoerType> {
    let mut stages = vec![DoerType::Fft, DoerType::BeamWeights];
    if schedule.num_ul() > 0 {
        stages.push(DoerType::Demul);
        stages.push(DoerType::Decode);
    }
    if schedule.num_dl() > 0 {
        stages.push(DoerType::Precode);
        stages.push(DoerType::Ifft);
    }
    stages
}

/// Stage and shard of one worker: stage-major so the first `num_stages`
/// workers cover every stage of shard 0.
pub(crate) fn assignment(tid: usize, num_stages: usize, num_shards: usize) -> (usize, usize) {
    (tid % num_stages, (tid / num_stages) % num_shards)
}

/// Pin the calling thread to one core. Returns false when the platform or
/// the core id does not allow it.
#[cfg(target_os = "linux")]
pub fn pin_to_core(core: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

/// Pin the calling thread to one core. Returns false when the platform or
/// the core id does not allow it.
#[cfg(not(target_os = "linux"))]
pub fn pin_to_core(_core: usize) -> bool {
    false
}

fn build_doer(
    doer_type: DoerType,
    tid: usize,
    cfg: Arc<PhyConfig>,
    schedule: FrameSchedule,
    buffer: Arc<BasebandBuffer>,
    gemm: Arc<dyn GemmBackend>,
    stats: Arc<Stats>,
) -> Box<dyn Doer> {
    match doer_type {
        DoerType::Fft => Box::new(DoFft::new(tid, cfg, schedule, buffer, stats)),
        DoerType::BeamWeights => Box::new(DoBeamWeights::new(tid, cfg, buffer, stats)),
        DoerType::Demul => Box::new(DoDemul::new(tid, cfg, schedule, buffer, gemm, stats)),
        DoerType::Decode => Box::new(DoDecode::new(tid, cfg, schedule, buffer, stats)),
        DoerType::Precode => Box::new(DoPrecode::new(tid, cfg, schedule, buffer, gemm, stats)),
        DoerType::Ifft => Box::new(DoIfft::new(tid, cfg, schedule, buffer, stats)),
    }
}

/// The worker thread pool. Threads run from construction until `shutdown`.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `cfg.num_workers` stage-bound workers.
    pub fn spawn(
        cfg: Arc<PhyConfig>,
        schedule: FrameSchedule,
        buffer: Arc<BasebandBuffer>,
        fabric: Arc<EventFabric>,
        stats: Arc<Stats>,
    ) -> Self {
        let stages = required_stages(&schedule);
        let gemm = select_backend(cfg.matmul_backend);
        let stop = Arc::new(AtomicBool::new(false));

        let handles = (0..cfg.num_workers)
            .map(|tid| {
                let (stage_idx, shard) = assignment(tid, stages.len(), cfg.num_shards);
                let doer_type = stages[stage_idx];
                let cfg = cfg.clone();
                let schedule = schedule.clone();
                let buffer = buffer.clone();
                let fabric = fabric.clone();
                let gemm = gemm.clone();
                let stats = stats.clone();
                let stop = stop.clone();

                std::thread::Builder::new()
                    .name(format!("worker-{tid}"))
                    .spawn(move || {
                        if let Some(offset) = cfg.core_offset {
                            if pin_to_core(offset + tid) {
                                debug!(tid, core = offset + tid, "worker pinned");
                            } else {
                                warn!(tid, core = offset + tid, "worker pinning failed");
                            }
                        }
                        debug!(tid, ?doer_type, shard, "worker started");

                        let mut doer =
                            build_doer(doer_type, tid, cfg, schedule, buffer, gemm, stats);
                        let event_type = doer.event_type();

                        let mut idle_spins = 0u32;
                        while !stop.load(Ordering::Acquire) {
                            match fabric.try_dequeue(shard, event_type) {
                                Some(ev) => {
                                    idle_spins = 0;
                                    let comp = doer.launch(ev.tag);
                                    // Completion delivery is mandatory:
                                    // losing one would stall the frame, so
                                    // spin until the queue accepts it.
                                    while !fabric.push_completion(shard, comp) {
                                        std::hint::spin_loop();
                                    }
                                }
                                None => {
                                    idle_spins += 1;
                                    if idle_spins < IDLE_SPIN_LIMIT {
                                        std::hint::spin_loop();
                                    } else {
                                        std::thread::yield_now();
                                    }
                                }
                            }
                        }
                        debug!(tid, "worker stopped");
                    })
                    .expect("worker thread spawn")
            })
            .collect();

        Self { handles, stop }
    }

    /// Signal every worker to stop and join them.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
