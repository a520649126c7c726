//! Frame Dispatcher
//!
//! Single-threaded control core of the pipeline. Consumes stage-completion
//! events from the queue fabric and decides, per frame, when each dependent
//! stage may be issued: all pilot FFTs gate the beam weights, beam weights
//! plus a symbol's FFTs gate its demul blocks, a symbol's demul blocks gate
//! its decodes, beam weights gate the precode blocks, precode gates the
//! IFFTs, and the IFFTs feed the transmit queue. This completion protocol is
//! what makes the buffer store's exclusive-writer contract hold: a stage is
//! never issued while a writer of its inputs is still running.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{FrameSchedule, PhyConfig};
use crate::fabric::EventFabric;
use crate::PhyError;
use common::{EventData, EventType, FrameId, SymbolType, TaskTag};

/// Per-frame progress bookkeeping, reused cyclically with the buffer slots.
struct FrameState {
    frame_id: FrameId,
    active: bool,
    started: Instant,
    /// Completed FFTs per symbol (antenna count when done)
    fft_done: Vec<usize>,
    pilots_done: usize,
    beam_blocks_done: usize,
    beams_ready: bool,
    /// Demul issued per uplink symbol
    demul_scheduled: Vec<bool>,
    /// Completed demul blocks per uplink symbol
    demul_done: Vec<usize>,
    /// Completed decodes per uplink symbol (UE count when done)
    decode_done: Vec<usize>,
    ul_symbols_decoded: usize,
    /// Completed precode blocks per downlink symbol
    precode_done: Vec<usize>,
    /// Completed IFFTs per downlink symbol (antenna count when done)
    ifft_done: Vec<usize>,
    dl_symbols_sent: usize,
}

impl FrameState {
    fn new(schedule: &FrameSchedule) -> Self {
        Self {
            frame_id: 0,
            active: false,
            started: Instant::now(),
            fft_done: vec![0; schedule.num_symbols()],
            pilots_done: 0,
            beam_blocks_done: 0,
            beams_ready: false,
            demul_scheduled: vec![false; schedule.num_ul()],
            demul_done: vec![0; schedule.num_ul()],
            decode_done: vec![0; schedule.num_ul()],
            ul_symbols_decoded: 0,
            precode_done: vec![0; schedule.num_dl()],
            ifft_done: vec![0; schedule.num_dl()],
            dl_symbols_sent: 0,
        }
    }

    fn reset(&mut self, frame_id: FrameId) {
        self.frame_id = frame_id;
        self.active = true;
        self.started = Instant::now();
        self.fft_done.fill(0);
        self.pilots_done = 0;
        self.beam_blocks_done = 0;
        self.beams_ready = false;
        self.demul_scheduled.fill(false);
        self.demul_done.fill(0);
        self.decode_done.fill(0);
        self.ul_symbols_decoded = 0;
        self.precode_done.fill(0);
        self.ifft_done.fill(0);
        self.dl_symbols_sent = 0;
    }

    fn is_complete(&self, schedule: &FrameSchedule) -> bool {
        self.ul_symbols_decoded == schedule.num_ul()
            && self.dl_symbols_sent == schedule.num_dl()
    }
}

/// The frame dispatcher. Owned and driven by one thread.
pub struct FrameDispatcher {
    cfg: Arc<PhyConfig>,
    schedule: FrameSchedule,
    fabric: Arc<EventFabric>,
    states: Vec<FrameState>,
    beam_blocks: usize,
    demul_blocks: usize,
    /// Next frame id the driver has not started yet
    cur_sche_frame_id: FrameId,
    /// Oldest frame still in flight
    cur_proc_frame_id: FrameId,
    frames_completed: u64,
}

impl FrameDispatcher {
    pub fn new(cfg: Arc<PhyConfig>, schedule: FrameSchedule, fabric: Arc<EventFabric>) -> Self {
        let states = (0..cfg.window_depth).map(|_| FrameState::new(&schedule)).collect();
        let beam_blocks = cfg.ofdm_data_num / cfg.beam_block_size;
        let demul_blocks = cfg.ofdm_data_num / cfg.demul_block_size;
        Self {
            cfg,
            schedule,
            fabric,
            states,
            beam_blocks,
            demul_blocks,
            cur_sche_frame_id: 0,
            cur_proc_frame_id: 0,
            frames_completed: 0,
        }
    }

    fn slot(&self, frame_id: FrameId) -> usize {
        frame_id as usize % self.cfg.window_depth
    }

    fn shard(&self, frame_id: FrameId) -> usize {
        frame_id as usize % self.cfg.num_shards
    }

    /// Whether a frame's buffer slot is free to take it. False while the
    /// slot's previous occupant is still in flight.
    pub fn can_accept(&self, frame_id: FrameId) -> bool {
        !self.states[self.slot(frame_id)].active
    }

    /// Oldest frame still in flight
    pub fn cur_proc_frame_id(&self) -> FrameId {
        self.cur_proc_frame_id
    }

    /// Next frame id not yet started
    pub fn cur_sche_frame_id(&self) -> FrameId {
        self.cur_sche_frame_id
    }

    /// Frames retired since startup
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    /// Whether no frame is in flight
    pub fn is_idle(&self) -> bool {
        self.states.iter().all(|s| !s.active)
    }

    /// Claim a frame's buffer slot. Fails when the slot's previous occupant
    /// has not retired: admitting the frame would overwrite live tensors.
    pub fn start_frame(&mut self, frame_id: FrameId) -> Result<(), PhyError> {
        let slot = self.slot(frame_id);
        if self.states[slot].active {
            return Err(PhyError::WindowExceeded(frame_id));
        }
        self.states[slot].reset(frame_id);
        if frame_id >= self.cur_sche_frame_id {
            self.cur_sche_frame_id = frame_id + 1;
        }
        debug!(frame_id, slot, "frame admitted");
        Ok(())
    }

    /// The driver signals that one received symbol's time-domain planes are
    /// in place: issue its per-antenna FFT tasks. Starts the frame on its
    /// first symbol.
    pub fn on_packet_rx(&mut self, frame_id: FrameId, symbol_id: u8) -> Result<(), PhyError> {
        let slot = self.slot(frame_id);
        if !self.states[slot].active || self.states[slot].frame_id != frame_id {
            self.start_frame(frame_id)?;
        }
        debug_assert_ne!(self.schedule.symbol_type(symbol_id), SymbolType::Downlink);

        let shard = self.shard(frame_id);
        for ant in 0..self.cfg.bs_ant_num {
            let tag = TaskTag::frame_symbol_index(frame_id, symbol_id, ant as u16);
            self.fabric.enqueue_or_drop(shard, EventData::new(EventType::Fft, tag));
        }
        Ok(())
    }

    /// Drain every shard's completion queue and apply the events. Returns
    /// the number of completions handled.
    pub fn poll(&mut self) -> Result<usize, PhyError> {
        let mut handled = 0;
        for shard in 0..self.fabric.num_shards() {
            while let Some(ev) = self.fabric.try_pop_completion(shard) {
                self.handle_completion(ev)?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    fn handle_completion(&mut self, ev: EventData) -> Result<(), PhyError> {
        let frame_id = ev.tag.frame_id;
        let slot = self.slot(frame_id);
        if !self.states[slot].active || self.states[slot].frame_id != frame_id {
            warn!(frame_id, event_type = ?ev.event_type, "completion for a retired frame");
            return Ok(());
        }

        match ev.event_type {
            EventType::Fft => self.on_fft_done(frame_id, ev.tag.symbol_id),
            EventType::BeamWeights => self.on_beam_done(frame_id),
            EventType::Demul => self.on_demul_done(frame_id, ev.tag.symbol_id),
            EventType::Decode => {
                self.on_decode_done(frame_id, ev.tag.symbol_id);
                self.maybe_retire(frame_id);
                Ok(())
            }
            EventType::Precode => self.on_precode_done(frame_id, ev.tag.symbol_id),
            EventType::Ifft => {
                self.on_ifft_done(frame_id, ev.tag)?;
                self.maybe_retire(frame_id);
                Ok(())
            }
            EventType::PacketRx | EventType::PacketTx => {
                warn!(event_type = ?ev.event_type, "unexpected completion type");
                Ok(())
            }
        }?;
        Ok(())
    }

    fn on_fft_done(&mut self, frame_id: FrameId, symbol_id: u8) -> Result<(), PhyError> {
        let slot = self.slot(frame_id);
        let st = &mut self.states[slot];
        st.fft_done[symbol_id as usize] += 1;
        if st.fft_done[symbol_id as usize] < self.cfg.bs_ant_num {
            return Ok(());
        }

        match self.schedule.symbol_type(symbol_id) {
            SymbolType::Pilot => {
                st.pilots_done += 1;
                if st.pilots_done == self.schedule.num_pilots() {
                    self.schedule_beam_weights(frame_id);
                }
            }
            SymbolType::Uplink => {
                if self.states[slot].beams_ready {
                    self.schedule_demul(frame_id, symbol_id);
                }
            }
            SymbolType::Downlink => unreachable!("downlink symbols carry no receive FFT"),
        }
        Ok(())
    }

    fn on_beam_done(&mut self, frame_id: FrameId) -> Result<(), PhyError> {
        let slot = self.slot(frame_id);
        let st = &mut self.states[slot];
        st.beam_blocks_done += 1;
        if st.beam_blocks_done < self.beam_blocks {
            return Ok(());
        }
        st.beams_ready = true;
        debug!(frame_id, "beam weights ready");

        // Uplink symbols whose FFTs finished while the beams were pending
        for (ul_idx, &symbol_id) in self.schedule.ul_ids().to_vec().iter().enumerate() {
            let st = &self.states[slot];
            if st.fft_done[symbol_id as usize] == self.cfg.bs_ant_num
                && !st.demul_scheduled[ul_idx]
            {
                self.schedule_demul(frame_id, symbol_id);
            }
        }
        // Downlink data was staged by the driver before the frame started
        for &symbol_id in &self.schedule.dl_ids().to_vec() {
            self.schedule_precode(frame_id, symbol_id);
        }
        Ok(())
    }

    fn on_demul_done(&mut self, frame_id: FrameId, symbol_id: u8) -> Result<(), PhyError> {
        let slot = self.slot(frame_id);
        let ul_idx = self
            .schedule
            .ul_symbol_idx(symbol_id)
            .expect("demul completion carries an uplink symbol");
        let st = &mut self.states[slot];
        st.demul_done[ul_idx] += 1;
        if st.demul_done[ul_idx] < self.demul_blocks {
            return Ok(());
        }

        let shard = self.shard(frame_id);
        for ue in 0..self.cfg.ue_num {
            let tag = TaskTag::frame_symbol_index(frame_id, symbol_id, ue as u16);
            self.fabric.enqueue_or_drop(shard, EventData::new(EventType::Decode, tag));
        }
        Ok(())
    }

    fn on_decode_done(&mut self, frame_id: FrameId, symbol_id: u8) {
        let slot = self.slot(frame_id);
        let ul_idx = self
            .schedule
            .ul_symbol_idx(symbol_id)
            .expect("decode completion carries an uplink symbol");
        let st = &mut self.states[slot];
        st.decode_done[ul_idx] += 1;
        if st.decode_done[ul_idx] == self.cfg.ue_num {
            st.ul_symbols_decoded += 1;
        }
    }

    fn on_precode_done(&mut self, frame_id: FrameId, symbol_id: u8) -> Result<(), PhyError> {
        let slot = self.slot(frame_id);
        let dl_idx = self
            .schedule
            .dl_symbol_idx(symbol_id)
            .expect("precode completion carries a downlink symbol");
        let st = &mut self.states[slot];
        st.precode_done[dl_idx] += 1;
        if st.precode_done[dl_idx] < self.demul_blocks {
            return Ok(());
        }

        let shard = self.shard(frame_id);
        for ant in 0..self.cfg.bs_ant_num {
            let tag = TaskTag::frame_symbol_index(frame_id, symbol_id, ant as u16);
            self.fabric.enqueue_or_drop(shard, EventData::new(EventType::Ifft, tag));
        }
        Ok(())
    }

    fn on_ifft_done(&mut self, frame_id: FrameId, tag: TaskTag) -> Result<(), PhyError> {
        // Every finished IFFT immediately becomes one transmit packet; a
        // full transmit queue means the radio front-end is not draining and
        // air-interface timing is already lost.
        if !self.fabric.enqueue_tx(EventData::new(EventType::PacketTx, tag)) {
            return Err(PhyError::TxQueueFull);
        }

        let slot = self.slot(frame_id);
        let dl_idx = self
            .schedule
            .dl_symbol_idx(tag.symbol_id)
            .expect("ifft completion carries a downlink symbol");
        let st = &mut self.states[slot];
        st.ifft_done[dl_idx] += 1;
        if st.ifft_done[dl_idx] == self.cfg.bs_ant_num {
            st.dl_symbols_sent += 1;
        }
        Ok(())
    }

    fn schedule_beam_weights(&mut self, frame_id: FrameId) {
        let shard = self.shard(frame_id);
        for base in (0..self.cfg.ofdm_data_num).step_by(self.cfg.beam_block_size) {
            let tag = TaskTag::frame_symbol_index(frame_id, 0, base as u16);
            self.fabric.enqueue_or_drop(shard, EventData::new(EventType::BeamWeights, tag));
        }
    }

    fn schedule_demul(&mut self, frame_id: FrameId, symbol_id: u8) {
        let slot = self.slot(frame_id);
        let ul_idx = self
            .schedule
            .ul_symbol_idx(symbol_id)
            .expect("demul scheduled on an uplink symbol");
        self.states[slot].demul_scheduled[ul_idx] = true;

        let shard = self.shard(frame_id);
        for base in (0..self.cfg.ofdm_data_num).step_by(self.cfg.demul_block_size) {
            let tag = TaskTag::frame_symbol_index(frame_id, symbol_id, base as u16);
            self.fabric.enqueue_or_drop(shard, EventData::new(EventType::Demul, tag));
        }
    }

    fn schedule_precode(&mut self, frame_id: FrameId, symbol_id: u8) {
        let shard = self.shard(frame_id);
        for base in (0..self.cfg.ofdm_data_num).step_by(self.cfg.demul_block_size) {
            let tag = TaskTag::frame_symbol_index(frame_id, symbol_id, base as u16);
            self.fabric.enqueue_or_drop(shard, EventData::new(EventType::Precode, tag));
        }
    }

    fn maybe_retire(&mut self, frame_id: FrameId) {
        let slot = self.slot(frame_id);
        if !self.states[slot].is_complete(&self.schedule) {
            return;
        }
        let st = &mut self.states[slot];
        st.active = false;
        self.frames_completed += 1;
        info!(
            frame_id,
            latency_us = st.started.elapsed().as_micros() as u64,
            "frame completed"
        );

        while self.cur_proc_frame_id < self.cur_sche_frame_id {
            let st = &self.states[self.slot(self.cur_proc_frame_id)];
            if st.active && st.frame_id == self.cur_proc_frame_id {
                break;
            }
            self.cur_proc_frame_id += 1;
        }
    }
}
