//! Equalization + Demodulation Kernel
//!
//! For one (frame, uplink symbol, subcarrier block) task: gather each
//! subcarrier's received samples across all base-station antennas out of the
//! partial-transpose layout, left-multiply by the subcarrier's beam matrix
//! to get one value per UE, and accumulate the pilot-based phase-shift
//! correction.

use std::sync::Arc;
use std::time::Instant;

use num_complex::Complex32;
use tracing::trace;

use crate::buffer::BasebandBuffer;
use crate::config::{FrameSchedule, PhyConfig};
use crate::matmul::GemmBackend;
use crate::stats::{elapsed_ns, Stats};
use crate::{SCS_PER_CACHELINE, SIMD_LANES, TRANSPOSE_BLOCK_SIZE};
use common::{DoerType, EventData, EventType, TaskTag};

use super::{csign, Doer};

/// Prefer the strided gather whenever the antenna count allows it.
const USE_STRIDED_GATHER: bool = true;

/// The equalization/demodulation doer. One instance per worker thread.
pub struct DoDemul {
    tid: usize,
    cfg: Arc<PhyConfig>,
    schedule: FrameSchedule,
    buffer: Arc<BasebandBuffer>,
    gemm: Arc<dyn GemmBackend>,
    stats: Arc<Stats>,
    /// Gather scratch: one cache-line run of subcarriers, all antennas,
    /// subcarrier-major
    gather: Vec<Complex32>,
    /// One equalized vector, UE-length
    equaled: Vec<Complex32>,
    /// Known UE pilots, subcarrier-major
    pilot_table: Vec<Complex32>,
    /// Taken when the antenna count is a multiple of the lane width; the
    /// scalar fallback produces identical scratch contents
    pub(crate) strided_gather: bool,
}

impl DoDemul {
    pub fn new(
        tid: usize,
        cfg: Arc<PhyConfig>,
        schedule: FrameSchedule,
        buffer: Arc<BasebandBuffer>,
        gemm: Arc<dyn GemmBackend>,
        stats: Arc<Stats>,
    ) -> Self {
        let gather = vec![Complex32::new(0.0, 0.0); SCS_PER_CACHELINE * cfg.bs_ant_num];
        let equaled = vec![Complex32::new(0.0, 0.0); cfg.ue_num];
        let pilot_table = cfg.ue_pilot_table();
        let strided_gather = USE_STRIDED_GATHER && cfg.bs_ant_num % SIMD_LANES == 0;
        Self { tid, cfg, schedule, buffer, gemm, stats, gather, equaled, pilot_table, strided_gather }
    }
}

/// Populate `gather` as a subcarrier-major matrix with `SCS_PER_CACHELINE`
/// rows and `ant` columns, reading one cache-line run of subcarriers out of
/// the partial-transpose plane `rx`. Both paths produce numerically
/// identical scratch contents; the strided path is purely a performance
/// choice.
pub(crate) fn gather_block(
    gather: &mut [Complex32],
    rx: &[Complex32],
    ant: usize,
    base_sc: usize,
    strided: bool,
) {
    debug_assert_eq!(base_sc % SCS_PER_CACHELINE, 0);
    // All subcarriers of the run lie in the same partial-transpose block
    // since the transpose block size is a multiple of the run length.
    let block_base = (base_sc / TRANSPOSE_BLOCK_SIZE) * (TRANSPOSE_BLOCK_SIZE * ant);

    if strided {
        debug_assert_eq!(ant % SIMD_LANES, 0);
        // Fixed-stride gather, SIMD_LANES antennas and one subcarrier per
        // inner iteration
        for ant_i in (0..ant).step_by(SIMD_LANES) {
            for j in 0..SCS_PER_CACHELINE {
                let src = block_base + (base_sc + j) % TRANSPOSE_BLOCK_SIZE;
                let dst = j * ant + ant_i;
                for lane in 0..SIMD_LANES {
                    gather[dst + lane] = rx[src + (ant_i + lane) * TRANSPOSE_BLOCK_SIZE];
                }
            }
        }
    } else {
        for j in 0..SCS_PER_CACHELINE {
            for a in 0..ant {
                gather[j * ant + a] = rx[block_base
                    + a * TRANSPOSE_BLOCK_SIZE
                    + (base_sc + j) % TRANSPOSE_BLOCK_SIZE];
            }
        }
    }
}

impl Doer for DoDemul {
    fn event_type(&self) -> EventType {
        EventType::Demul
    }

    fn launch(&mut self, tag: TaskTag) -> EventData {
        let start = Instant::now();
        let frame_id = tag.frame_id;
        let symbol_id = tag.symbol_id;
        let base_sc = tag.index as usize;

        let slot = self.buffer.slot(frame_id);
        let ul_idx = self
            .schedule
            .ul_symbol_idx(symbol_id)
            .expect("demul task scheduled on a non-uplink symbol");

        trace!(tid = self.tid, frame_id, symbol_id, base_sc, "demul task");

        let ant = self.cfg.bs_ant_num;
        let ue = self.cfg.ue_num;
        let pilot_spacing = self.cfg.pilot_spacing;
        let max_sc = self.cfg.demul_block_size.min(self.cfg.ofdm_data_num - base_sc);
        debug_assert_eq!(max_sc % SCS_PER_CACHELINE, 0);

        let block = base_sc / self.cfg.demul_block_size;

        // SAFETY: the dispatcher issues at most one writer per tensor
        // coordinate; this task owns its (symbol, subcarrier block) region
        // of `equal` and its own phase partial cell, and `rx` has no
        // remaining writers once demul is scheduled.
        let rx = unsafe { self.buffer.rx_symbol(slot, symbol_id) };
        let equal = unsafe { self.buffer.equal_block_mut(slot, ul_idx, base_sc, max_sc) };
        let acc = unsafe { self.buffer.phase_partial_mut(slot, ul_idx, block) };

        // This frame's partial starts from exactly zero; whatever the slot's
        // previous occupant left behind is overwritten before any pilot
        // contributes.
        acc.fill(Complex32::new(0.0, 0.0));

        let mut gather_ns = 0u64;
        let mut compute_ns = 0u64;

        // Iterate through cache-line runs
        for i in (0..max_sc).step_by(SCS_PER_CACHELINE) {
            let t0 = Instant::now();
            gather_block(&mut self.gather, rx, ant, base_sc + i, self.strided_gather);
            gather_ns += elapsed_ns(t0);

            let t1 = Instant::now();
            for j in 0..SCS_PER_CACHELINE {
                let cur_sc = base_sc + i + j;

                // SAFETY: beam weights for this slot are read-only once
                // demul is scheduled.
                let beam = unsafe { self.buffer.ul_beam(slot, cur_sc) };
                let received = &self.gather[j * ant..(j + 1) * ant];
                self.gemm.gemv(beam, ue, ant, received, &mut self.equaled);
                let rel = i + j;
                equal[rel * ue..rel * ue + ue].copy_from_slice(&self.equaled);

                if cur_sc % pilot_spacing == 0 {
                    for u in 0..ue {
                        let pilot = self.pilot_table[cur_sc * ue + u];
                        acc[u] += csign(self.equaled[u] * pilot.conj());
                    }
                }
            }
            compute_ns += elapsed_ns(t1);
        }

        self.stats
            .duration_stat(DoerType::Demul, self.tid)
            .record([elapsed_ns(start), gather_ns, compute_ns]);
        EventData::new(EventType::Demul, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matmul::NaiveGemm;

    /// 4 antennas, 2 UEs, 64 subcarriers, pilot spacing 8, one uplink symbol
    fn small_config() -> PhyConfig {
        PhyConfig {
            bs_ant_num: 4,
            ue_num: 2,
            ofdm_data_num: 64,
            pilot_spacing: 8,
            frame_schedule: "PPU".to_string(),
            window_depth: 4,
            demul_block_size: 64,
            beam_block_size: 16,
            num_workers: 4,
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

        fn doer(&self) -> DoDemul {
            DoDemul::new(
                0,
                self.cfg.clone(),
                self.schedule.clone(),
                self.buffer.clone(),
                Arc::new(NaiveGemm),
                Arc::new(Stats::new(1)),
            )
        }

        /// Deterministic receive plane for one frame's uplink symbol
        fn fill_rx(&self, frame_id: u32) {
            let slot = self.buffer.slot(frame_id);
            let rx = unsafe { self.buffer.rx_symbol_mut(slot, 2) };
            for sc in 0..self.cfg.ofdm_data_num {
                for ant in 0..self.cfg.bs_ant_num {
                    let off = self.buffer.transpose_offset(sc, ant);
                    rx[off] = Complex32::new(
                        (sc as f32 + 1.0) * 0.1 + ant as f32,
                        (frame_id as f32 + 1.0) * 0.5 - sc as f32 * 0.01,
                    );
                }
            }
        }

        /// Beam matrix selecting antenna 0 for every UE on every subcarrier
        fn fill_identity_beam(&self, frame_id: u32) {
            let slot = self.buffer.slot(frame_id);
            for sc in 0..self.cfg.ofdm_data_num {
                let beam = unsafe { self.buffer.ul_beam_mut(slot, sc) };
                beam.fill(Complex32::new(0.0, 0.0));
                for u in 0..self.cfg.ue_num {
                    beam[u * self.cfg.bs_ant_num] = Complex32::new(1.0, 0.0);
                }
            }
        }

        fn rx_ant0(&self, frame_id: u32, sc: usize) -> Complex32 {
            let slot = self.buffer.slot(frame_id);
            let rx = unsafe { self.buffer.rx_symbol(slot, 2) };
            rx[self.buffer.transpose_offset(sc, 0)]
        }
    }

    #[test]
    fn test_gather_paths_identical() {
        let fx = Fixture::new();
        fx.fill_rx(0);
        let rx = unsafe { fx.buffer.rx_symbol(0, 2) };

        let ant = fx.cfg.bs_ant_num;
        let mut strided = vec![Complex32::new(0.0, 0.0); SCS_PER_CACHELINE * ant];
        let mut scalar = vec![Complex32::new(0.0, 0.0); SCS_PER_CACHELINE * ant];
        for base_sc in (0..fx.cfg.ofdm_data_num).step_by(SCS_PER_CACHELINE) {
            gather_block(&mut strided, rx, ant, base_sc, true);
            gather_block(&mut scalar, rx, ant, base_sc, false);
            assert_eq!(strided, scalar, "gather mismatch at base {base_sc}");
        }
    }

    #[test]
    fn test_equalization_deterministic_across_gather_paths() {
        let fx_a = Fixture::new();
        let fx_b = Fixture::new();
        for fx in [&fx_a, &fx_b] {
            fx.fill_rx(0);
            fx.fill_identity_beam(0);
        }
        let mut strided = fx_a.doer();
        assert!(strided.strided_gather);
        let mut scalar = fx_b.doer();
        scalar.strided_gather = false;

        let tag = TaskTag::frame_symbol_index(0, 2, 0);
        strided.launch(tag);
        scalar.launch(tag);

        let eq_a = unsafe { fx_a.buffer.equal_symbol(0, 0) };
        let eq_b = unsafe { fx_b.buffer.equal_symbol(0, 0) };
        for (a, b) in eq_a.iter().zip(eq_b.iter()) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn test_end_to_end_identity_beam() {
        let fx = Fixture::new();
        fx.fill_rx(0);
        fx.fill_identity_beam(0);

        let mut doer = fx.doer();
        let comp = doer.launch(TaskTag::frame_symbol_index(0, 2, 0));
        assert_eq!(comp.event_type, EventType::Demul);
        assert_eq!(comp.tag, TaskTag::frame_symbol_index(0, 2, 0));

        // Equalized output equals antenna 0's input on every subcarrier
        let ue = fx.cfg.ue_num;
        let equal = unsafe { fx.buffer.equal_symbol(0, 0) };
        for sc in 0..fx.cfg.ofdm_data_num {
            let expect = fx.rx_ant0(0, sc);
            for u in 0..ue {
                assert!(
                    (equal[sc * ue + u] - expect).norm() < 1e-5,
                    "sc {sc} ue {u}: {} vs {expect}",
                    equal[sc * ue + u]
                );
            }
        }

        // Phase-shift updates occur only at subcarriers 0, 8, ..., 56: the
        // accumulator must equal the sum of contributions at exactly those
        // positions.
        let pilots = fx.cfg.ue_pilot_table();
        let acc = unsafe { fx.buffer.phase_shift(0) };
        for u in 0..ue {
            let mut expect = Complex32::new(0.0, 0.0);
            for sc in (0..fx.cfg.ofdm_data_num).step_by(fx.cfg.pilot_spacing) {
                expect += csign(fx.rx_ant0(0, sc) * pilots[sc * ue + u].conj());
            }
            assert!((acc[u] - expect).norm() < 1e-4, "ue {u}: {} vs {expect}", acc[u]);
        }
    }

    #[test]
    fn test_phase_accumulator_isolation() {
        let fx = Fixture::new();

        // Leave a known residue in frame 0's accumulator
        let residue = Complex32::new(42.0, -7.0);
        unsafe { fx.buffer.phase_shift_mut(fx.buffer.slot(0)) }.fill(residue);
        // Junk in frame 1's slot that the reset must clear
        unsafe { fx.buffer.phase_shift_mut(fx.buffer.slot(1)) }.fill(Complex32::new(9.0, 9.0));

        fx.fill_rx(1);
        fx.fill_identity_beam(1);
        let mut doer = fx.doer();
        doer.launch(TaskTag::frame_symbol_index(1, 2, 0));

        // Frame 0's accumulator is untouched
        let prev = unsafe { fx.buffer.phase_shift(fx.buffer.slot(0)) };
        assert!(prev.iter().all(|&v| v == residue));

        // Frame 1's accumulator started from exactly zero: it equals the
        // pilot contributions alone, with no trace of the junk fill.
        let ue = fx.cfg.ue_num;
        let pilots = fx.cfg.ue_pilot_table();
        let acc = unsafe { fx.buffer.phase_shift(fx.buffer.slot(1)) };
        for u in 0..ue {
            let mut expect = Complex32::new(0.0, 0.0);
            for sc in (0..fx.cfg.ofdm_data_num).step_by(fx.cfg.pilot_spacing) {
                expect += csign(fx.rx_ant0(1, sc) * pilots[sc * ue + u].conj());
            }
            assert!((acc[u] - expect).norm() < 1e-4);
        }
    }
}
