//! Decode Kernel
//!
//! For one (frame, uplink symbol, UE) task: undo the residual phase drift
//! estimated by the pilot accumulator, quantize the equalized symbols to
//! hard values, and pack the hard decisions into bytes.

use std::sync::Arc;
use std::time::Instant;

use num_complex::Complex32;
use tracing::trace;

use crate::buffer::BasebandBuffer;
use crate::config::{FrameSchedule, PhyConfig};
use crate::stats::{elapsed_ns, Stats};
use common::utils::{hard_decide, pack_bits};
use common::{DoerType, EventData, EventType, TaskTag};

use super::{csign, Doer};

/// Fixed-point scale of the quantized hard values.
const DEMOD_SCALE: f32 = 32.0;

/// The decode doer. One instance per worker thread.
pub struct DoDecode {
    tid: usize,
    cfg: Arc<PhyConfig>,
    schedule: FrameSchedule,
    buffer: Arc<BasebandBuffer>,
    stats: Arc<Stats>,
}

impl DoDecode {
    pub fn new(
        tid: usize,
        cfg: Arc<PhyConfig>,
        schedule: FrameSchedule,
        buffer: Arc<BasebandBuffer>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { tid, cfg, schedule, buffer, stats }
    }
}

impl Doer for DoDecode {
    fn event_type(&self) -> EventType {
        EventType::Decode
    }

    fn launch(&mut self, tag: TaskTag) -> EventData {
        let start = Instant::now();
        let frame_id = tag.frame_id;
        let symbol_id = tag.symbol_id;
        let ue_id = tag.index as usize;
        let slot = self.buffer.slot(frame_id);
        let ul_idx = self
            .schedule
            .ul_symbol_idx(symbol_id)
            .expect("decode task scheduled on a non-uplink symbol");

        trace!(tid = self.tid, frame_id, symbol_id, ue_id, "decode task");

        let ue = self.cfg.ue_num;
        let n = self.cfg.ofdm_data_num;

        // SAFETY: the equalized plane and the phase partials are read-only
        // once all demul blocks of this symbol have completed; this task is
        // the sole writer of its (symbol, UE) output stripes.
        let equal = unsafe { self.buffer.equal_symbol(slot, ul_idx) };
        let demod = unsafe { self.buffer.demod_mut(slot, ul_idx, ue_id) };
        let acc: Complex32 = unsafe { self.buffer.phase_partials(slot, ul_idx) }
            .chunks_exact(ue)
            .map(|cell| cell[ue_id])
            .sum();

        // Rotate by the negative of the accumulated drift; with no pilot
        // evidence the accumulator is zero and no correction is applied.
        let correction = if acc == Complex32::new(0.0, 0.0) {
            Complex32::new(1.0, 0.0)
        } else {
            csign(acc).conj()
        };

        let t0 = Instant::now();
        for sc in 0..n {
            let corrected = equal[sc * ue + ue_id] * correction;
            let q = (corrected.re * DEMOD_SCALE).round();
            demod[sc] = q.clamp(i8::MIN as f32, i8::MAX as f32) as i8;
        }
        let quantize_ns = elapsed_ns(t0);

        let t1 = Instant::now();
        let bits = hard_decide(demod);
        let packed = pack_bits(&bits);
        let decoded = unsafe { self.buffer.decoded_mut(slot, ul_idx, ue_id) };
        for (d, b) in decoded.iter_mut().zip(packed.iter()) {
            *d = *b as i8;
        }
        let pack_ns = elapsed_ns(t1);

        self.stats
            .duration_stat(DoerType::Decode, self.tid)
            .record([elapsed_ns(start), quantize_ns, pack_ns]);
        EventData::new(EventType::Decode, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

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

        fn doer(&self) -> DoDecode {
            DoDecode::new(
                0,
                self.cfg.clone(),
                self.schedule.clone(),
                self.buffer.clone(),
                Arc::new(Stats::new(1)),
            )
        }
    }

    /// BPSK-style mapping used by the tests: bit 1 -> -1.0, bit 0 -> +1.0
    fn modulate(bit: bool) -> Complex32 {
        Complex32::new(if bit { -1.0 } else { 1.0 }, 0.0)
    }

    #[test]
    fn test_hard_decisions_and_packing() {
        let fx = Fixture::new();
        let ue = fx.cfg.ue_num;
        let n = fx.cfg.ofdm_data_num;
        let bits: Vec<bool> = (0..n).map(|sc| sc % 3 == 0).collect();

        let equal = unsafe { fx.buffer.equal_symbol_mut(0, 0) };
        for sc in 0..n {
            equal[sc * ue + 1] = modulate(bits[sc]);
        }

        let mut doer = fx.doer();
        let comp = doer.launch(TaskTag::frame_symbol_index(0, 2, 1));
        assert_eq!(comp.event_type, EventType::Decode);

        let demod = unsafe { fx.buffer.demod(0, 0, 1) };
        for sc in 0..n {
            assert_eq!(demod[sc], if bits[sc] { -32 } else { 32 });
        }

        let decoded = unsafe { fx.buffer.decoded(0, 0, 1) };
        let packed = pack_bits(&bits);
        assert_eq!(decoded.len(), packed.len());
        for (d, b) in decoded.iter().zip(packed.iter()) {
            assert_eq!(*d as u8, *b);
        }
    }

    #[test]
    fn test_phase_drift_is_corrected() {
        let fx = Fixture::new();
        let ue = fx.cfg.ue_num;
        let n = fx.cfg.ofdm_data_num;
        let bits: Vec<bool> = (0..n).map(|sc| sc % 5 < 2).collect();

        // Rotate every symbol by a drift large enough to flip naive real-part
        // decisions, and record the same drift in the accumulator.
        let drift = Complex32::from_polar(1.0, 0.6 * PI);
        let equal = unsafe { fx.buffer.equal_symbol_mut(0, 0) };
        for sc in 0..n {
            equal[sc * ue] = modulate(bits[sc]) * drift;
        }
        let acc = unsafe { fx.buffer.phase_shift_mut(0) };
        acc[0] = drift * 7.0;

        let mut doer = fx.doer();
        doer.launch(TaskTag::frame_symbol_index(0, 2, 0));

        let demod = unsafe { fx.buffer.demod(0, 0, 0) };
        for sc in 0..n {
            assert_eq!(demod[sc] < 0, bits[sc], "sc {sc}");
        }
    }

    #[test]
    fn test_quantizer_saturates() {
        let fx = Fixture::new();
        let ue = fx.cfg.ue_num;
        let equal = unsafe { fx.buffer.equal_symbol_mut(0, 0) };
        equal[0] = Complex32::new(100.0, 0.0);
        equal[ue] = Complex32::new(-100.0, 0.0);

        let mut doer = fx.doer();
        doer.launch(TaskTag::frame_symbol_index(0, 2, 0));

        let demod = unsafe { fx.buffer.demod(0, 0, 0) };
        assert_eq!(demod[0], i8::MAX);
        assert_eq!(demod[1], i8::MIN);
    }
}
