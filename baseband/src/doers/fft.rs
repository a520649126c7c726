//! FFT / IFFT Kernels
//!
//! `DoFft` moves one (frame, symbol, antenna) plane from time to frequency
//! domain and scatters it into the partial-transpose receive layout; for
//! pilot symbols it additionally derives that UE's channel estimate and
//! records the spectrum into its reciprocity-calibration plane. `DoIfft` is
//! the transmit mirror: one precoded frequency stripe back to time domain.

use std::sync::Arc;
use std::time::Instant;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use tracing::trace;

use crate::buffer::BasebandBuffer;
use crate::config::{FrameSchedule, PhyConfig};
use crate::stats::{elapsed_ns, Stats};
use common::{DoerType, EventData, EventType, SymbolType, TaskTag};

use super::Doer;

/// Forward-FFT doer. One instance per worker thread; the FFT plan and
/// scratch are allocated once at construction.
pub struct DoFft {
    tid: usize,
    cfg: Arc<PhyConfig>,
    schedule: FrameSchedule,
    buffer: Arc<BasebandBuffer>,
    stats: Arc<Stats>,
    fft: Arc<dyn Fft<f32>>,
    work: Vec<Complex32>,
    scratch: Vec<Complex32>,
    pilot_table: Vec<Complex32>,
}

impl DoFft {
    pub fn new(
        tid: usize,
        cfg: Arc<PhyConfig>,
        schedule: FrameSchedule,
        buffer: Arc<BasebandBuffer>,
        stats: Arc<Stats>,
    ) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(cfg.ofdm_data_num);
        let work = vec![Complex32::new(0.0, 0.0); cfg.ofdm_data_num];
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        let pilot_table = cfg.ue_pilot_table();
        Self { tid, cfg, schedule, buffer, stats, fft, work, scratch, pilot_table }
    }
}

impl Doer for DoFft {
    fn event_type(&self) -> EventType {
        EventType::Fft
    }

    fn launch(&mut self, tag: TaskTag) -> EventData {
        let start = Instant::now();
        let frame_id = tag.frame_id;
        let symbol_id = tag.symbol_id;
        let ant_id = tag.index as usize;
        let slot = self.buffer.slot(frame_id);

        trace!(tid = self.tid, frame_id, symbol_id, ant_id, "fft task");

        let n = self.cfg.ofdm_data_num;
        let ue = self.cfg.ue_num;

        // SAFETY: the time-domain plane is finalized before the FFT task is
        // issued, and this task is the sole writer of its antenna's cells
        // in the frequency plane.
        let t0 = Instant::now();
        self.work.copy_from_slice(unsafe { self.buffer.time_rx(slot, symbol_id, ant_id) });
        self.fft.process_with_scratch(&mut self.work, &mut self.scratch);
        let fft_ns = elapsed_ns(t0);

        let t1 = Instant::now();
        for sc in 0..n {
            unsafe { self.buffer.rx_write(slot, symbol_id, sc, ant_id, self.work[sc]) };
        }

        if self.schedule.symbol_type(symbol_id) == SymbolType::Pilot {
            let pilot_idx = self
                .schedule
                .pilot_idx(symbol_id)
                .expect("pilot symbol id present in the schedule");

            // Each pilot symbol belongs to one UE: its channel estimate is
            // the received spectrum rotated by the conjugate of the known
            // unit-modulus pilot.
            // SAFETY: one writer per (UE, antenna) cell column.
            for sc in 0..n {
                let h = self.work[sc] * self.pilot_table[sc * ue + pilot_idx].conj();
                unsafe { self.buffer.csi_write(slot, pilot_idx, sc, ant_id, h) };
            }

            // Record the pilot's spectrum into its calibration plane; the
            // per-pilot planes keep concurrent symbol tasks of one frame
            // order-independent; readers sum across pilots.
            // SAFETY: this task is the stripe's only writer.
            let calib = unsafe { self.buffer.calib_ul_mut(slot, pilot_idx, ant_id) };
            calib.copy_from_slice(&self.work);
        }
        let scatter_ns = elapsed_ns(t1);

        self.stats
            .duration_stat(DoerType::Fft, self.tid)
            .record([elapsed_ns(start), fft_ns, scatter_ns]);
        EventData::new(EventType::Fft, tag)
    }
}

/// Inverse-FFT doer for the downlink path.
pub struct DoIfft {
    tid: usize,
    cfg: Arc<PhyConfig>,
    schedule: FrameSchedule,
    buffer: Arc<BasebandBuffer>,
    stats: Arc<Stats>,
    ifft: Arc<dyn Fft<f32>>,
    work: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl DoIfft {
    pub fn new(
        tid: usize,
        cfg: Arc<PhyConfig>,
        schedule: FrameSchedule,
        buffer: Arc<BasebandBuffer>,
        stats: Arc<Stats>,
    ) -> Self {
        let ifft = FftPlanner::new().plan_fft_inverse(cfg.ofdm_data_num);
        let work = vec![Complex32::new(0.0, 0.0); cfg.ofdm_data_num];
        let scratch = vec![Complex32::new(0.0, 0.0); ifft.get_inplace_scratch_len()];
        Self { tid, cfg, schedule, buffer, stats, ifft, work, scratch }
    }
}

impl Doer for DoIfft {
    fn event_type(&self) -> EventType {
        EventType::Ifft
    }

    fn launch(&mut self, tag: TaskTag) -> EventData {
        let start = Instant::now();
        let frame_id = tag.frame_id;
        let symbol_id = tag.symbol_id;
        let ant_id = tag.index as usize;
        let slot = self.buffer.slot(frame_id);
        let dl_idx = self
            .schedule
            .dl_symbol_idx(symbol_id)
            .expect("ifft task scheduled on a non-downlink symbol");

        trace!(tid = self.tid, frame_id, symbol_id, ant_id, "ifft task");

        let n = self.cfg.ofdm_data_num;

        // SAFETY: the precoded stripe is finalized before the IFFT task is
        // issued; this task is the sole writer of its transmit stripe and
        // its (symbol, antenna) calibration stripe.
        let t0 = Instant::now();
        let grid = unsafe { self.buffer.dl_ifft(slot, dl_idx, ant_id) };
        self.work.copy_from_slice(grid);

        let calib = unsafe { self.buffer.calib_dl_mut(slot, dl_idx, ant_id) };
        calib.copy_from_slice(grid);
        let gather_ns = elapsed_ns(t0);

        let t1 = Instant::now();
        self.ifft.process_with_scratch(&mut self.work, &mut self.scratch);

        // The inverse transform is unnormalized; scale so a forward FFT of
        // the transmit plane reproduces the grid.
        let scale = 1.0 / n as f32;
        let tx = unsafe { self.buffer.tx_time_mut(slot, dl_idx, ant_id) };
        for (t, w) in tx.iter_mut().zip(&self.work) {
            *t = w * scale;
        }
        let ifft_ns = elapsed_ns(t1);

        self.stats
            .duration_stat(DoerType::Ifft, self.tid)
            .record([elapsed_ns(start), gather_ns, ifft_ns]);
        EventData::new(EventType::Ifft, tag)
    }
}
