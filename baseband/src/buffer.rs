//! Windowed Buffer Store
//!
//! Frame-indexed storage for every intermediate tensor of the pipeline.
//! All tensors are allocated once at construction, sized for `window_depth`
//! frames, and reused cyclically: the physical slot of a frame is
//! `frame_id % window_depth`. A slot is never overwritten for a new frame
//! before all readers of its previous occupant have observed completion;
//! that ordering is enforced by the dispatcher's completion protocol, not by
//! the store. Accessors perform debug-only bounds checks; misaddressing is a
//! programmer error, not a recoverable condition.

use std::cell::UnsafeCell;

use num_complex::Complex32;

use crate::config::{FrameSchedule, PhyConfig};
use crate::{PhyError, TRANSPOSE_BLOCK_SIZE};
use common::FrameId;

/// Fixed-size tensor shared between worker threads.
///
/// Every cell is wrapped in its own `UnsafeCell`, so references handed out
/// for disjoint regions of one tensor never alias. Each cell is logically
/// owned by whichever stage is its current writer; the dispatcher never
/// issues two writers for the same cell, which is the sole synchronization
/// mechanism for access.
pub(crate) struct SharedTensor<T> {
    data: Box<[UnsafeCell<T>]>,
}

// Exclusivity of written cells is guaranteed by the dispatch protocol.
unsafe impl<T: Send> Sync for SharedTensor<T> {}

impl<T: Copy + Default> SharedTensor<T> {
    fn new(len: usize) -> Self {
        Self { data: (0..len).map(|_| UnsafeCell::new(T::default())).collect() }
    }

    /// Borrow a region for reading.
    ///
    /// # Safety
    /// No stage may be writing any cell of the region, per the dispatch
    /// protocol.
    pub(crate) unsafe fn slice(&self, start: usize, len: usize) -> &[T] {
        debug_assert!(start + len <= self.data.len());
        std::slice::from_raw_parts(self.data.as_ptr().add(start) as *const T, len)
    }

    /// Borrow a region for writing.
    ///
    /// # Safety
    /// The caller must be the sole writer of every cell in the region and no
    /// other stage may be reading it, per the dispatch protocol.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, start: usize, len: usize) -> &mut [T] {
        debug_assert!(start + len <= self.data.len());
        std::slice::from_raw_parts_mut(self.data.as_ptr().add(start) as *mut T, len)
    }

    /// Write one cell. The scattered-layout writers go through this instead
    /// of a plane-wide mutable borrow, so concurrent tasks writing disjoint
    /// cells of one plane never hold overlapping references.
    ///
    /// # Safety
    /// The caller must be the cell's sole writer, per the dispatch protocol.
    pub(crate) unsafe fn write(&self, idx: usize, value: T) {
        debug_assert!(idx < self.data.len());
        *self.data[idx].get() = value;
    }
}

/// Tensor dimensions derived from the validated configuration.
#[derive(Debug, Clone)]
struct Dims {
    window: usize,
    ant: usize,
    ue: usize,
    sc: usize,
    symbols: usize,
    ul_syms: usize,
    dl_syms: usize,
    demul_blocks: usize,
    bits_bytes: usize,
}

/// The windowed buffer store: one owned-resource aggregate, constructed once
/// and passed by reference to workers.
pub struct BasebandBuffer {
    dims: Dims,
    /// Time-domain received samples per (slot, symbol, antenna)
    time_rx: SharedTensor<Complex32>,
    /// Frequency-domain received samples per (slot, symbol) in the
    /// partial-transpose layout
    rx: SharedTensor<Complex32>,
    /// Channel-state information per (slot, UE): subcarrier-major, antenna
    /// within
    csi: SharedTensor<Complex32>,
    /// Uplink beam weights per (slot, subcarrier): ue x ant row-major
    ul_beam: SharedTensor<Complex32>,
    /// Downlink beam weights per (slot, subcarrier): ant x ue row-major
    dl_beam: SharedTensor<Complex32>,
    /// Equalized symbols per (slot, uplink symbol): subcarrier-major, UE
    /// within
    equal: SharedTensor<Complex32>,
    /// Demodulated hard values per (slot, uplink symbol, UE)
    demod: SharedTensor<i8>,
    /// Decoded packed bits per (slot, uplink symbol, UE)
    decoded: SharedTensor<i8>,
    /// Pilot phase-shift partial accumulators per slot: uplink-symbol-major,
    /// demul-block within, UE innermost. Each cell has exactly one writer
    /// (its block's demul task); readers sum across blocks.
    ue_pilot: SharedTensor<Complex32>,
    /// Downlink modulated data per (slot, downlink symbol): subcarrier-major,
    /// UE within
    dl_mod: SharedTensor<Complex32>,
    /// Precoded frequency grid per (slot, downlink symbol): antenna-major
    dl_ifft: SharedTensor<Complex32>,
    /// Time-domain transmit samples per (slot, downlink symbol, antenna)
    tx_time: SharedTensor<Complex32>,
    /// Uplink calibration spectra per (slot, pilot, antenna); one writer per
    /// stripe, readers sum across pilots
    calib_ul: SharedTensor<Complex32>,
    /// Downlink calibration grids per (slot, downlink symbol, antenna); one
    /// writer per stripe, readers sum across symbols
    calib_dl: SharedTensor<Complex32>,
}

impl BasebandBuffer {
    /// Allocate every tensor for the configured window. Never reallocates
    /// afterwards.
    pub fn new(cfg: &PhyConfig, schedule: &FrameSchedule) -> Result<Self, PhyError> {
        cfg.validate()?;

        let dims = Dims {
            window: cfg.window_depth,
            ant: cfg.bs_ant_num,
            ue: cfg.ue_num,
            sc: cfg.ofdm_data_num,
            symbols: schedule.num_symbols(),
            ul_syms: schedule.num_ul(),
            dl_syms: schedule.num_dl(),
            demul_blocks: cfg.ofdm_data_num / cfg.demul_block_size,
            bits_bytes: (cfg.ofdm_data_num + 7) / 8,
        };
        let d = &dims;

        Ok(Self {
            time_rx: SharedTensor::new(d.window * d.symbols * d.ant * d.sc),
            rx: SharedTensor::new(d.window * d.symbols * d.sc * d.ant),
            csi: SharedTensor::new(d.window * d.ue * d.sc * d.ant),
            ul_beam: SharedTensor::new(d.window * d.sc * d.ue * d.ant),
            dl_beam: SharedTensor::new(d.window * d.sc * d.ant * d.ue),
            equal: SharedTensor::new(d.window * d.ul_syms * d.sc * d.ue),
            demod: SharedTensor::new(d.window * d.ul_syms * d.ue * d.sc),
            decoded: SharedTensor::new(d.window * d.ul_syms * d.ue * d.bits_bytes),
            ue_pilot: SharedTensor::new(d.window * d.ul_syms * d.demul_blocks * d.ue),
            dl_mod: SharedTensor::new(d.window * d.dl_syms * d.sc * d.ue),
            dl_ifft: SharedTensor::new(d.window * d.dl_syms * d.ant * d.sc),
            tx_time: SharedTensor::new(d.window * d.dl_syms * d.ant * d.sc),
            calib_ul: SharedTensor::new(d.window * d.ue * d.ant * d.sc),
            calib_dl: SharedTensor::new(d.window * d.dl_syms * d.ant * d.sc),
            dims,
        })
    }

    /// Physical storage slot of a frame
    pub fn slot(&self, frame_id: FrameId) -> usize {
        frame_id as usize % self.dims.window
    }

    /// Window depth the store was sized for
    pub fn window_depth(&self) -> usize {
        self.dims.window
    }

    /// Offset of one subcarrier/antenna sample inside a partial-transpose
    /// symbol plane: contiguous runs of `TRANSPOSE_BLOCK_SIZE` subcarriers
    /// per antenna.
    #[inline]
    pub fn transpose_offset(&self, sc: usize, ant: usize) -> usize {
        debug_assert!(sc < self.dims.sc && ant < self.dims.ant);
        (sc / TRANSPOSE_BLOCK_SIZE) * (TRANSPOSE_BLOCK_SIZE * self.dims.ant)
            + ant * TRANSPOSE_BLOCK_SIZE
            + sc % TRANSPOSE_BLOCK_SIZE
    }

    /// Time-domain receive plane for one (slot, symbol, antenna).
    ///
    /// # Safety
    /// Caller must hold the whole plane exclusively: no other writer or
    /// reader may be live per the dispatch protocol.
    pub unsafe fn time_rx_mut(&self, slot: usize, symbol_id: u8, ant: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && (symbol_id as usize) < d.symbols && ant < d.ant);
        let base = ((slot * d.symbols + symbol_id as usize) * d.ant + ant) * d.sc;
        self.time_rx.slice_mut(base, d.sc)
    }

    /// Read-only view of one time-domain receive plane.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn time_rx(&self, slot: usize, symbol_id: u8, ant: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && (symbol_id as usize) < d.symbols && ant < d.ant);
        let base = ((slot * d.symbols + symbol_id as usize) * d.ant + ant) * d.sc;
        self.time_rx.slice(base, d.sc)
    }

    /// Frequency-domain receive plane (partial-transpose layout) for one
    /// (slot, symbol). Single-threaded staging only; concurrent FFT tasks
    /// use [`Self::rx_write`] since their cells interleave.
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn rx_symbol_mut(&self, slot: usize, symbol_id: u8) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && (symbol_id as usize) < d.symbols);
        let base = (slot * d.symbols + symbol_id as usize) * d.sc * d.ant;
        self.rx.slice_mut(base, d.sc * d.ant)
    }

    /// Write one frequency-domain sample at its partial-transpose position.
    /// The FFT scatter goes through this since one symbol's antennas are
    /// written concurrently and their cells interleave across the plane.
    ///
    /// # Safety
    /// The (symbol, antenna) FFT task is the cell's only writer.
    pub unsafe fn rx_write(&self, slot: usize, symbol_id: u8, sc: usize, ant: usize, value: Complex32) {
        let d = &self.dims;
        debug_assert!(slot < d.window && (symbol_id as usize) < d.symbols);
        let base = (slot * d.symbols + symbol_id as usize) * d.sc * d.ant;
        self.rx.write(base + self.transpose_offset(sc, ant), value);
    }

    /// Read-only frequency-domain receive plane.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn rx_symbol(&self, slot: usize, symbol_id: u8) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && (symbol_id as usize) < d.symbols);
        let base = (slot * d.symbols + symbol_id as usize) * d.sc * d.ant;
        self.rx.slice(base, d.sc * d.ant)
    }

    /// CSI plane for one (slot, UE): entry `sc * ant + a`. Single-threaded
    /// staging only; concurrent FFT tasks use [`Self::csi_write`].
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn csi_mut(&self, slot: usize, ue: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ue < d.ue);
        let base = (slot * d.ue + ue) * d.sc * d.ant;
        self.csi.slice_mut(base, d.sc * d.ant)
    }

    /// Write one channel estimate. Per-antenna writers of one UE's plane run
    /// concurrently and their cells interleave, so estimates land cell-wise.
    ///
    /// # Safety
    /// The (pilot, antenna) FFT task is the cell's only writer.
    pub unsafe fn csi_write(&self, slot: usize, ue: usize, sc: usize, ant: usize, value: Complex32) {
        let d = &self.dims;
        debug_assert!(slot < d.window && ue < d.ue && sc < d.sc && ant < d.ant);
        let base = (slot * d.ue + ue) * d.sc * d.ant;
        self.csi.write(base + sc * d.ant + ant, value);
    }

    /// Read-only CSI plane for one (slot, UE).
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn csi(&self, slot: usize, ue: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ue < d.ue);
        let base = (slot * d.ue + ue) * d.sc * d.ant;
        self.csi.slice(base, d.sc * d.ant)
    }

    /// Uplink beam matrix (ue x ant, row-major) of one (slot, subcarrier).
    ///
    /// # Safety
    /// No stage may be writing the matrix.
    pub unsafe fn ul_beam(&self, slot: usize, sc: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && sc < d.sc);
        let base = (slot * d.sc + sc) * d.ue * d.ant;
        self.ul_beam.slice(base, d.ue * d.ant)
    }

    /// Mutable uplink beam matrix.
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn ul_beam_mut(&self, slot: usize, sc: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && sc < d.sc);
        let base = (slot * d.sc + sc) * d.ue * d.ant;
        self.ul_beam.slice_mut(base, d.ue * d.ant)
    }

    /// Downlink beam matrix (ant x ue, row-major) of one (slot, subcarrier).
    ///
    /// # Safety
    /// No stage may be writing the matrix.
    pub unsafe fn dl_beam(&self, slot: usize, sc: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && sc < d.sc);
        let base = (slot * d.sc + sc) * d.ant * d.ue;
        self.dl_beam.slice(base, d.ant * d.ue)
    }

    /// Mutable downlink beam matrix.
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn dl_beam_mut(&self, slot: usize, sc: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && sc < d.sc);
        let base = (slot * d.sc + sc) * d.ant * d.ue;
        self.dl_beam.slice_mut(base, d.ant * d.ue)
    }

    /// Equalized plane of one (slot, uplink symbol): entry `sc * ue + u`.
    /// Single-threaded staging only; concurrent demul tasks use
    /// [`Self::equal_block_mut`].
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn equal_symbol_mut(&self, slot: usize, ul_idx: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms);
        let base = (slot * d.ul_syms + ul_idx) * d.sc * d.ue;
        self.equal.slice_mut(base, d.sc * d.ue)
    }

    /// Equalized cells of one (slot, uplink symbol, subcarrier block): entry
    /// `(sc - base_sc) * ue + u`. Demul blocks of one symbol run
    /// concurrently; each receives only its own contiguous region.
    ///
    /// # Safety
    /// The block's demul task is the region's only writer.
    pub unsafe fn equal_block_mut(
        &self,
        slot: usize,
        ul_idx: usize,
        base_sc: usize,
        num_sc: usize,
    ) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms && base_sc + num_sc <= d.sc);
        let base = ((slot * d.ul_syms + ul_idx) * d.sc + base_sc) * d.ue;
        self.equal.slice_mut(base, num_sc * d.ue)
    }

    /// Read-only equalized plane.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn equal_symbol(&self, slot: usize, ul_idx: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms);
        let base = (slot * d.ul_syms + ul_idx) * d.sc * d.ue;
        self.equal.slice(base, d.sc * d.ue)
    }

    /// Demodulated hard values of one (slot, uplink symbol, UE).
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn demod_mut(&self, slot: usize, ul_idx: usize, ue: usize) -> &mut [i8] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms && ue < d.ue);
        let base = ((slot * d.ul_syms + ul_idx) * d.ue + ue) * d.sc;
        self.demod.slice_mut(base, d.sc)
    }

    /// Read-only demodulated values.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn demod(&self, slot: usize, ul_idx: usize, ue: usize) -> &[i8] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms && ue < d.ue);
        let base = ((slot * d.ul_syms + ul_idx) * d.ue + ue) * d.sc;
        self.demod.slice(base, d.sc)
    }

    /// Decoded packed bits of one (slot, uplink symbol, UE).
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn decoded_mut(&self, slot: usize, ul_idx: usize, ue: usize) -> &mut [i8] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms && ue < d.ue);
        let base = ((slot * d.ul_syms + ul_idx) * d.ue + ue) * d.bits_bytes;
        self.decoded.slice_mut(base, d.bits_bytes)
    }

    /// Read-only decoded bits.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn decoded(&self, slot: usize, ul_idx: usize, ue: usize) -> &[i8] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms && ue < d.ue);
        let base = ((slot * d.ul_syms + ul_idx) * d.ue + ue) * d.bits_bytes;
        self.decoded.slice(base, d.bits_bytes)
    }

    /// Phase-drift partial cell of one (slot, uplink symbol, demul block):
    /// one entry per UE.
    ///
    /// # Safety
    /// The block's demul task is the cell's only writer.
    pub unsafe fn phase_partial_mut(&self, slot: usize, ul_idx: usize, block: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms && block < d.demul_blocks);
        let base = ((slot * d.ul_syms + ul_idx) * d.demul_blocks + block) * d.ue;
        self.ue_pilot.slice_mut(base, d.ue)
    }

    /// All phase-drift partials of one (slot, uplink symbol), block-major
    /// with UE innermost.
    ///
    /// # Safety
    /// No demul task of the symbol may still be running.
    pub unsafe fn phase_partials(&self, slot: usize, ul_idx: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && ul_idx < d.ul_syms);
        let base = (slot * d.ul_syms + ul_idx) * d.demul_blocks * d.ue;
        self.ue_pilot.slice(base, d.demul_blocks * d.ue)
    }

    /// Whole phase-drift accumulator plane of one slot.
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn phase_shift_mut(&self, slot: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window);
        let len = d.ul_syms * d.demul_blocks * d.ue;
        self.ue_pilot.slice_mut(slot * len, len)
    }

    /// Read-only whole phase-drift accumulator plane of one slot.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn phase_shift(&self, slot: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window);
        let len = d.ul_syms * d.demul_blocks * d.ue;
        self.ue_pilot.slice(slot * len, len)
    }

    /// Downlink modulated data of one (slot, downlink symbol): entry
    /// `sc * ue + u`.
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn dl_mod_mut(&self, slot: usize, dl_idx: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms);
        let base = (slot * d.dl_syms + dl_idx) * d.sc * d.ue;
        self.dl_mod.slice_mut(base, d.sc * d.ue)
    }

    /// Read-only downlink modulated data.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn dl_mod(&self, slot: usize, dl_idx: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms);
        let base = (slot * d.dl_syms + dl_idx) * d.sc * d.ue;
        self.dl_mod.slice(base, d.sc * d.ue)
    }

    /// Precoded frequency stripe of one (slot, downlink symbol, antenna).
    /// Single-threaded staging only; concurrent precode tasks use
    /// [`Self::dl_ifft_write`].
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn dl_ifft_mut(&self, slot: usize, dl_idx: usize, ant: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms && ant < d.ant);
        let base = ((slot * d.dl_syms + dl_idx) * d.ant + ant) * d.sc;
        self.dl_ifft.slice_mut(base, d.sc)
    }

    /// Write one precoded sample. Precode blocks of one symbol run
    /// concurrently and each writes a slice of every antenna's stripe, so
    /// samples land cell-wise.
    ///
    /// # Safety
    /// The subcarrier's precode task is the cell's only writer.
    pub unsafe fn dl_ifft_write(&self, slot: usize, dl_idx: usize, ant: usize, sc: usize, value: Complex32) {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms && ant < d.ant && sc < d.sc);
        let base = ((slot * d.dl_syms + dl_idx) * d.ant + ant) * d.sc;
        self.dl_ifft.write(base + sc, value);
    }

    /// Read-only precoded frequency stripe.
    ///
    /// # Safety
    /// No stage may be writing the stripe.
    pub unsafe fn dl_ifft(&self, slot: usize, dl_idx: usize, ant: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms && ant < d.ant);
        let base = ((slot * d.dl_syms + dl_idx) * d.ant + ant) * d.sc;
        self.dl_ifft.slice(base, d.sc)
    }

    /// Time-domain transmit plane of one (slot, downlink symbol, antenna).
    ///
    /// # Safety
    /// See [`Self::time_rx_mut`].
    pub unsafe fn tx_time_mut(&self, slot: usize, dl_idx: usize, ant: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms && ant < d.ant);
        let base = ((slot * d.dl_syms + dl_idx) * d.ant + ant) * d.sc;
        self.tx_time.slice_mut(base, d.sc)
    }

    /// Read-only time-domain transmit plane.
    ///
    /// # Safety
    /// No stage may be writing the plane.
    pub unsafe fn tx_time(&self, slot: usize, dl_idx: usize, ant: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms && ant < d.ant);
        let base = ((slot * d.dl_syms + dl_idx) * d.ant + ant) * d.sc;
        self.tx_time.slice(base, d.sc)
    }

    /// Uplink calibration stripe of one (slot, pilot, antenna).
    ///
    /// # Safety
    /// The pilot's FFT task on this antenna is the stripe's only writer.
    pub unsafe fn calib_ul_mut(&self, slot: usize, pilot_idx: usize, ant: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && pilot_idx < d.ue && ant < d.ant);
        let base = ((slot * d.ue + pilot_idx) * d.ant + ant) * d.sc;
        self.calib_ul.slice_mut(base, d.sc)
    }

    /// Read-only uplink calibration stripe.
    ///
    /// # Safety
    /// No stage may be writing the stripe.
    pub unsafe fn calib_ul(&self, slot: usize, pilot_idx: usize, ant: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && pilot_idx < d.ue && ant < d.ant);
        let base = ((slot * d.ue + pilot_idx) * d.ant + ant) * d.sc;
        self.calib_ul.slice(base, d.sc)
    }

    /// Downlink calibration stripe of one (slot, downlink symbol, antenna).
    ///
    /// # Safety
    /// The symbol's IFFT task on this antenna is the stripe's only writer.
    pub unsafe fn calib_dl_mut(&self, slot: usize, dl_idx: usize, ant: usize) -> &mut [Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms && ant < d.ant);
        let base = ((slot * d.dl_syms + dl_idx) * d.ant + ant) * d.sc;
        self.calib_dl.slice_mut(base, d.sc)
    }

    /// Read-only downlink calibration stripe.
    ///
    /// # Safety
    /// No stage may be writing the stripe.
    pub unsafe fn calib_dl(&self, slot: usize, dl_idx: usize, ant: usize) -> &[Complex32] {
        let d = &self.dims;
        debug_assert!(slot < d.window && dl_idx < d.dl_syms && ant < d.ant);
        let base = ((slot * d.dl_syms + dl_idx) * d.ant + ant) * d.sc;
        self.calib_dl.slice(base, d.sc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_buffer() -> (PhyConfig, BasebandBuffer) {
        let cfg = PhyConfig::default();
        let schedule = cfg.schedule().unwrap();
        let buffer = BasebandBuffer::new(&cfg, &schedule).unwrap();
        (cfg, buffer)
    }

    #[test]
    fn test_slot_wraps_at_window_depth() {
        let (cfg, buffer) = test_buffer();
        assert_eq!(buffer.slot(0), 0);
        assert_eq!(buffer.slot(cfg.window_depth as u32), 0);
        assert_eq!(buffer.slot(cfg.window_depth as u32 + 3), 3);
    }

    #[test]
    fn test_transpose_offset_layout() {
        let (cfg, buffer) = test_buffer();
        // Within one block, one antenna's subcarriers are contiguous
        let a = buffer.transpose_offset(0, 1);
        let b = buffer.transpose_offset(1, 1);
        assert_eq!(b, a + 1);
        // Crossing a block boundary jumps by a whole block of all antennas
        let c = buffer.transpose_offset(TRANSPOSE_BLOCK_SIZE, 0);
        assert_eq!(c, TRANSPOSE_BLOCK_SIZE * cfg.bs_ant_num);
        // Offsets are unique across the plane
        let mut seen = vec![false; cfg.ofdm_data_num * cfg.bs_ant_num];
        for sc in 0..cfg.ofdm_data_num {
            for ant in 0..cfg.bs_ant_num {
                let off = buffer.transpose_offset(sc, ant);
                assert!(!seen[off]);
                seen[off] = true;
            }
        }
    }

    #[test]
    fn test_phase_accumulator_slots_are_disjoint() {
        let (_cfg, buffer) = test_buffer();
        unsafe {
            buffer.phase_shift_mut(0)[0] = Complex32::new(1.0, 2.0);
            buffer.phase_shift_mut(1).fill(Complex32::new(9.0, 9.0));
            assert_eq!(buffer.phase_shift(0)[0], Complex32::new(1.0, 2.0));
        }
    }

    #[test]
    fn test_concurrent_antenna_writers_fill_one_plane() {
        let (cfg, buffer) = test_buffer();
        let sc_num = cfg.ofdm_data_num;
        std::thread::scope(|s| {
            for ant in 0..cfg.bs_ant_num {
                let buffer = &buffer;
                s.spawn(move || {
                    for sc in 0..sc_num {
                        let v = Complex32::new(ant as f32, sc as f32);
                        unsafe { buffer.rx_write(0, 0, sc, ant, v) };
                    }
                });
            }
        });
        let plane = unsafe { buffer.rx_symbol(0, 0) };
        for ant in 0..cfg.bs_ant_num {
            for sc in 0..sc_num {
                let off = buffer.transpose_offset(sc, ant);
                assert_eq!(plane[off], Complex32::new(ant as f32, sc as f32));
            }
        }
    }

    #[test]
    fn test_tensors_zero_initialized() {
        let (_cfg, buffer) = test_buffer();
        unsafe {
            assert!(buffer.equal_symbol(0, 0).iter().all(|v| v.norm() == 0.0));
            assert!(buffer.demod(0, 0, 0).iter().all(|&v| v == 0));
        }
    }
}
