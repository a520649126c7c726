//! Precode Kernel
//!
//! For one (frame, downlink symbol, subcarrier block) task: multiply each
//! subcarrier's modulated UE vector by the downlink beam matrix and scatter
//! the resulting antenna vector into the per-antenna frequency grids that
//! feed the IFFT stage.

use std::sync::Arc;
use std::time::Instant;

use num_complex::Complex32;
use tracing::trace;

use crate::buffer::BasebandBuffer;
use crate::config::{FrameSchedule, PhyConfig};
use crate::matmul::GemmBackend;
use crate::stats::{elapsed_ns, Stats};
use common::{DoerType, EventData, EventType, TaskTag};

use super::Doer;

/// The downlink precode doer. One instance per worker thread.
pub struct DoPrecode {
    tid: usize,
    cfg: Arc<PhyConfig>,
    schedule: FrameSchedule,
    buffer: Arc<BasebandBuffer>,
    gemm: Arc<dyn GemmBackend>,
    stats: Arc<Stats>,
    /// One precoded antenna vector
    precoded: Vec<Complex32>,
}

impl DoPrecode {
    pub fn new(
        tid: usize,
        cfg: Arc<PhyConfig>,
        schedule: FrameSchedule,
        buffer: Arc<BasebandBuffer>,
        gemm: Arc<dyn GemmBackend>,
        stats: Arc<Stats>,
    ) -> Self {
        let precoded = vec![Complex32::new(0.0, 0.0); cfg.bs_ant_num];
        Self { tid, cfg, schedule, buffer, gemm, stats, precoded }
    }
}

impl Doer for DoPrecode {
    fn event_type(&self) -> EventType {
        EventType::Precode
    }

    fn launch(&mut self, tag: TaskTag) -> EventData {
        let start = Instant::now();
        let frame_id = tag.frame_id;
        let symbol_id = tag.symbol_id;
        let base_sc = tag.index as usize;
        let slot = self.buffer.slot(frame_id);
        let dl_idx = self
            .schedule
            .dl_symbol_idx(symbol_id)
            .expect("precode task scheduled on a non-downlink symbol");

        trace!(tid = self.tid, frame_id, symbol_id, base_sc, "precode task");

        let ant = self.cfg.bs_ant_num;
        let ue = self.cfg.ue_num;
        let max_sc = self.cfg.demul_block_size.min(self.cfg.ofdm_data_num - base_sc);

        // SAFETY: beam weights and modulated data are read-only once precode
        // is scheduled; this task owns its subcarrier block's cells of every
        // antenna's frequency grid.
        let dl_mod = unsafe { self.buffer.dl_mod(slot, dl_idx) };

        let mut compute_ns = 0u64;
        for cur_sc in base_sc..base_sc + max_sc {
            let t0 = Instant::now();
            let beam = unsafe { self.buffer.dl_beam(slot, cur_sc) };
            let symbols = &dl_mod[cur_sc * ue..(cur_sc + 1) * ue];
            self.gemm.gemv(beam, ant, ue, symbols, &mut self.precoded);
            compute_ns += elapsed_ns(t0);

            for (a, &v) in self.precoded.iter().enumerate() {
                unsafe { self.buffer.dl_ifft_write(slot, dl_idx, a, cur_sc, v) };
            }
        }

        let total = elapsed_ns(start);
        self.stats
            .duration_stat(DoerType::Precode, self.tid)
            .record([total, total.saturating_sub(compute_ns), compute_ns]);
        EventData::new(EventType::Precode, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matmul::NaiveGemm;

    fn small_config() -> PhyConfig {
        PhyConfig {
            bs_ant_num: 4,
            ue_num: 2,
            ofdm_data_num: 64,
            pilot_spacing: 8,
            frame_schedule: "PPUD".to_string(),
            window_depth: 4,
            demul_block_size: 32,
            beam_block_size: 16,
            num_workers: 6,
            ..PhyConfig::default()
        }
    }

    struct Fixture {
        cfg: Arc<PhyConfig>,
        schedule: FrameSchedule,
        buffer: Arc<BasebandBuffer>,
    }

    impl Fixture {
        fn new() -> Self {
            let cfg = Arc::new(small_config());
            cfg.validate().unwrap();
            let schedule = cfg.schedule().unwrap();
            let buffer = Arc::new(BasebandBuffer::new(&cfg, &schedule).unwrap());
            Self { cfg, schedule, buffer }
        }

        fn doer(&self) -> DoPrecode {
            DoPrecode::new(
                0,
                self.cfg.clone(),
                self.schedule.clone(),
                self.buffer.clone(),
                Arc::new(NaiveGemm),
                Arc::new(Stats::new(1)),
            )
        }
    }

    #[test]
    fn test_identity_precoder_copies_ue_streams() {
        let fx = Fixture::new();
        let ant = fx.cfg.bs_ant_num;
        let ue = fx.cfg.ue_num;
        let n = fx.cfg.ofdm_data_num;

        // Precoder mapping UE u straight onto antenna u
        for sc in 0..n {
            let beam = unsafe { fx.buffer.dl_beam_mut(0, sc) };
            for u in 0..ue {
                beam[u * ue + u] = Complex32::new(1.0, 0.0);
            }
        }
        let dl_mod = unsafe { fx.buffer.dl_mod_mut(0, 0) };
        for sc in 0..n {
            for u in 0..ue {
                dl_mod[sc * ue + u] = Complex32::new(sc as f32, u as f32 + 1.0);
            }
        }

        // Symbol 3 is the downlink symbol; two blocks cover the plane
        let mut doer = fx.doer();
        for base in (0..n).step_by(fx.cfg.demul_block_size) {
            let comp = doer.launch(TaskTag::frame_symbol_index(0, 3, base as u16));
            assert_eq!(comp.event_type, EventType::Precode);
        }

        for sc in 0..n {
            for u in 0..ue {
                let grid = unsafe { fx.buffer.dl_ifft(0, 0, u) };
                assert_eq!(grid[sc], Complex32::new(sc as f32, u as f32 + 1.0));
            }
            // Antennas beyond the UE count get nothing from this precoder
            for a in ue..ant {
                let grid = unsafe { fx.buffer.dl_ifft(0, 0, a) };
                assert_eq!(grid[sc], Complex32::new(0.0, 0.0));
            }
        }
    }

    #[test]
    fn test_precoder_applies_beam_weights() {
        let fx = Fixture::new();
        let ant = fx.cfg.bs_ant_num;
        let ue = fx.cfg.ue_num;
        let sc = 5;

        let beam_vals: Vec<Complex32> = (0..ant * ue)
            .map(|i| Complex32::new(i as f32 * 0.5, 1.0 - i as f32 * 0.25))
            .collect();
        unsafe { fx.buffer.dl_beam_mut(0, sc) }.copy_from_slice(&beam_vals);
        let symbols = [Complex32::new(1.0, -2.0), Complex32::new(-0.5, 0.25)];
        let dl_mod = unsafe { fx.buffer.dl_mod_mut(0, 0) };
        dl_mod[sc * ue..(sc + 1) * ue].copy_from_slice(&symbols);

        let mut doer = fx.doer();
        doer.launch(TaskTag::frame_symbol_index(0, 3, 0));

        for a in 0..ant {
            let mut expect = Complex32::new(0.0, 0.0);
            for u in 0..ue {
                expect += beam_vals[a * ue + u] * symbols[u];
            }
            let got = unsafe { fx.buffer.dl_ifft(0, 0, a) }[sc];
            assert!((got - expect).norm() < 1e-5, "ant {a}: {got} vs {expect}");
        }
    }
}
