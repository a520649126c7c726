//! Engine Configuration
//!
//! Read-only for the process lifetime. All dimension invariants are checked
//! once at startup; a violation is fatal and never encountered per-task.

use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use crate::matmul::MatmulKind;
use crate::{PhyError, SCS_PER_CACHELINE, TRANSPOSE_BLOCK_SIZE};
use common::SymbolType;

/// Top-level PHY configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhyConfig {
    /// Number of base-station antennas
    #[serde(default = "default_bs_ant_num")]
    pub bs_ant_num: usize,
    /// Number of user equipments
    #[serde(default = "default_ue_num")]
    pub ue_num: usize,
    /// Number of data subcarriers per OFDM symbol
    #[serde(default = "default_ofdm_data_num")]
    pub ofdm_data_num: usize,
    /// Subcarrier stride between pilot positions used for phase tracking
    #[serde(default = "default_pilot_spacing")]
    pub pilot_spacing: usize,
    /// Frame symbol-type sequence, e.g. "PPUUD": one pilot symbol per UE,
    /// then uplink and downlink data symbols
    #[serde(default = "default_frame_schedule")]
    pub frame_schedule: String,
    /// Number of frames kept resident simultaneously in the buffer store
    #[serde(default = "default_window_depth")]
    pub window_depth: usize,
    /// Subcarriers per equalization/demodulation task
    #[serde(default = "default_demul_block_size")]
    pub demul_block_size: usize,
    /// Subcarriers per beam-weight task
    #[serde(default = "default_beam_block_size")]
    pub beam_block_size: usize,
    /// Worker thread count
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Schedule-queue shard count
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,
    /// First core to pin worker threads to; None disables pinning
    #[serde(default)]
    pub core_offset: Option<usize>,
    /// Matrix-multiply backend
    #[serde(default)]
    pub matmul_backend: MatmulKind,
    /// Capacity of each general compute queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Capacity of each per-shard completion queue
    #[serde(default = "default_queue_capacity")]
    pub comp_queue_capacity: usize,
    /// Capacity of the dedicated transmit queue, sized generously since a
    /// dropped transmit task is fatal
    #[serde(default = "default_tx_queue_capacity")]
    pub tx_queue_capacity: usize,
    /// Sample recorder options
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// Asynchronous sample recorder configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderConfig {
    /// Enable recording of received samples
    #[serde(default)]
    pub enabled: bool,
    /// Event queue capacity
    #[serde(default = "default_recorder_capacity")]
    pub capacity: usize,
    /// Block on a condition variable between events (low idle CPU) instead
    /// of busy-polling the queue (near-zero wake latency)
    #[serde(default = "default_wait_signal")]
    pub wait_signal: bool,
    /// Output path for recorded samples
    #[serde(default = "default_recorder_path")]
    pub path: String,
    /// Core to pin the recorder thread to; None disables pinning
    #[serde(default)]
    pub core: Option<usize>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: default_recorder_capacity(),
            wait_signal: default_wait_signal(),
            path: default_recorder_path(),
            core: None,
        }
    }
}

fn default_bs_ant_num() -> usize {
    8
}

fn default_ue_num() -> usize {
    2
}

fn default_ofdm_data_num() -> usize {
    1200
}

fn default_pilot_spacing() -> usize {
    16
}

fn default_frame_schedule() -> String {
    "PPUUD".to_string()
}

fn default_window_depth() -> usize {
    16
}

fn default_demul_block_size() -> usize {
    48
}

fn default_beam_block_size() -> usize {
    48
}

fn default_num_workers() -> usize {
    6
}

fn default_num_shards() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_tx_queue_capacity() -> usize {
    32768
}

fn default_recorder_capacity() -> usize {
    1024
}

fn default_wait_signal() -> bool {
    true
}

fn default_recorder_path() -> String {
    "samples.bin".to_string()
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            bs_ant_num: default_bs_ant_num(),
            ue_num: default_ue_num(),
            ofdm_data_num: default_ofdm_data_num(),
            pilot_spacing: default_pilot_spacing(),
            frame_schedule: default_frame_schedule(),
            window_depth: default_window_depth(),
            demul_block_size: default_demul_block_size(),
            beam_block_size: default_beam_block_size(),
            num_workers: default_num_workers(),
            num_shards: default_num_shards(),
            core_offset: None,
            matmul_backend: MatmulKind::default(),
            queue_capacity: default_queue_capacity(),
            comp_queue_capacity: default_queue_capacity(),
            tx_queue_capacity: default_tx_queue_capacity(),
            recorder: RecorderConfig::default(),
        }
    }
}

impl PhyConfig {
    /// Parse the frame schedule string.
    pub fn schedule(&self) -> Result<FrameSchedule, PhyError> {
        FrameSchedule::parse(&self.frame_schedule).ok_or_else(|| {
            PhyError::InvalidConfiguration(format!(
                "bad frame schedule {:?}: only 'P', 'U', 'D' symbols are allowed",
                self.frame_schedule
            ))
        })
    }

    /// Validate every dimension invariant. Fatal at startup on failure.
    pub fn validate(&self) -> Result<(), PhyError> {
        let fail = |msg: String| Err(PhyError::InvalidConfiguration(msg));

        if self.bs_ant_num == 0 || self.ue_num == 0 || self.ofdm_data_num == 0 {
            return fail("antenna, UE and subcarrier counts must be non-zero".into());
        }
        if self.ue_num > self.bs_ant_num {
            return fail(format!(
                "zero-forcing needs ue_num ({}) <= bs_ant_num ({})",
                self.ue_num, self.bs_ant_num
            ));
        }
        if self.window_depth == 0 {
            return fail("window_depth must be non-zero".into());
        }
        if self.pilot_spacing == 0 || self.ofdm_data_num % self.pilot_spacing != 0 {
            return fail(format!(
                "pilot_spacing ({}) must be non-zero and divide ofdm_data_num ({})",
                self.pilot_spacing, self.ofdm_data_num
            ));
        }
        if self.ofdm_data_num % TRANSPOSE_BLOCK_SIZE != 0 {
            return fail(format!(
                "ofdm_data_num ({}) must be a multiple of the transpose block size ({})",
                self.ofdm_data_num, TRANSPOSE_BLOCK_SIZE
            ));
        }
        if self.demul_block_size == 0 || self.demul_block_size % SCS_PER_CACHELINE != 0 {
            return fail(format!(
                "demul_block_size ({}) must be a non-zero multiple of {}",
                self.demul_block_size, SCS_PER_CACHELINE
            ));
        }
        if self.ofdm_data_num % self.demul_block_size != 0 {
            return fail(format!(
                "ofdm_data_num ({}) must divide into demul blocks of {}",
                self.ofdm_data_num, self.demul_block_size
            ));
        }
        if self.beam_block_size == 0 || self.ofdm_data_num % self.beam_block_size != 0 {
            return fail(format!(
                "ofdm_data_num ({}) must divide into beam blocks of {}",
                self.ofdm_data_num, self.beam_block_size
            ));
        }

        let schedule = self.schedule()?;
        if schedule.num_symbols() == 0 {
            return fail("frame schedule must contain at least one symbol".into());
        }
        if schedule.num_pilots() != self.ue_num {
            return fail(format!(
                "frame schedule has {} pilot symbols but {} UEs; one pilot per UE is required",
                schedule.num_pilots(),
                self.ue_num
            ));
        }

        // Packed-tag bit-field maxima
        if schedule.num_symbols() > 1 << common::TAG_SYMBOL_BITS {
            return fail("frame schedule exceeds the tag symbol field".into());
        }
        if self.ofdm_data_num > 1 << common::TAG_INDEX_BITS
            || self.bs_ant_num > 1 << common::TAG_INDEX_BITS
        {
            return fail("subcarrier/antenna count exceeds the tag index field".into());
        }

        if self.num_shards == 0 {
            return fail("num_shards must be non-zero".into());
        }
        let stages = crate::worker::required_stages(&schedule).len();
        if self.num_workers < stages * self.num_shards {
            return fail(format!(
                "{} workers cannot cover {} stages across {} shards",
                self.num_workers, stages, self.num_shards
            ));
        }

        if self.queue_capacity == 0 || self.comp_queue_capacity == 0 || self.tx_queue_capacity == 0
        {
            return fail("queue capacities must be non-zero".into());
        }

        Ok(())
    }

    /// Known UE-specific pilot table, subcarrier-major: entry
    /// `sc * ue_num + ue`. Unit-modulus chirp per UE.
    pub fn ue_pilot_table(&self) -> Vec<Complex32> {
        let n = self.ofdm_data_num as f32;
        let mut table = Vec::with_capacity(self.ofdm_data_num * self.ue_num);
        for sc in 0..self.ofdm_data_num {
            for ue in 0..self.ue_num {
                let phase = -PI * (ue as f32 + 1.0) * (sc as f32) * (sc as f32 + 1.0) / n;
                table.push(Complex32::from_polar(1.0, phase));
            }
        }
        table
    }
}

/// Parsed frame symbol-type sequence.
#[derive(Debug, Clone)]
pub struct FrameSchedule {
    symbols: Vec<SymbolType>,
    pilot_ids: Vec<u8>,
    ul_ids: Vec<u8>,
    dl_ids: Vec<u8>,
}

impl FrameSchedule {
    /// Parse a schedule string such as "PPUUD".
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() > 1 << common::TAG_SYMBOL_BITS {
            return None;
        }
        let mut symbols = Vec::with_capacity(s.len());
        let mut pilot_ids = Vec::new();
        let mut ul_ids = Vec::new();
        let mut dl_ids = Vec::new();
        for (i, c) in s.chars().enumerate() {
            let ty = SymbolType::from_char(c)?;
            match ty {
                SymbolType::Pilot => pilot_ids.push(i as u8),
                SymbolType::Uplink => ul_ids.push(i as u8),
                SymbolType::Downlink => dl_ids.push(i as u8),
            }
            symbols.push(ty);
        }
        Some(Self { symbols, pilot_ids, ul_ids, dl_ids })
    }

    /// Total symbols per frame
    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    /// Pilot symbols per frame
    pub fn num_pilots(&self) -> usize {
        self.pilot_ids.len()
    }

    /// Uplink data symbols per frame
    pub fn num_ul(&self) -> usize {
        self.ul_ids.len()
    }

    /// Downlink data symbols per frame
    pub fn num_dl(&self) -> usize {
        self.dl_ids.len()
    }

    /// Type of a symbol id
    pub fn symbol_type(&self, symbol_id: u8) -> SymbolType {
        self.symbols[symbol_id as usize]
    }

    /// Index of `symbol_id` among the pilot symbols
    pub fn pilot_idx(&self, symbol_id: u8) -> Option<usize> {
        self.pilot_ids.iter().position(|&s| s == symbol_id)
    }

    /// Index of `symbol_id` among the uplink symbols
    pub fn ul_symbol_idx(&self, symbol_id: u8) -> Option<usize> {
        self.ul_ids.iter().position(|&s| s == symbol_id)
    }

    /// Index of `symbol_id` among the downlink symbols
    pub fn dl_symbol_idx(&self, symbol_id: u8) -> Option<usize> {
        self.dl_ids.iter().position(|&s| s == symbol_id)
    }

    /// Pilot symbol ids in frame order
    pub fn pilot_ids(&self) -> &[u8] {
        &self.pilot_ids
    }

    /// Uplink symbol ids in frame order
    pub fn ul_ids(&self) -> &[u8] {
        &self.ul_ids
    }

    /// Downlink symbol ids in frame order
    pub fn dl_ids(&self) -> &[u8] {
        &self.dl_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = PhyConfig::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_schedule_parsing() {
        let sched = FrameSchedule::parse("PPUUD").unwrap();
        assert_eq!(sched.num_symbols(), 5);
        assert_eq!(sched.num_pilots(), 2);
        assert_eq!(sched.num_ul(), 2);
        assert_eq!(sched.num_dl(), 1);
        assert_eq!(sched.symbol_type(0), SymbolType::Pilot);
        assert_eq!(sched.ul_symbol_idx(2), Some(0));
        assert_eq!(sched.ul_symbol_idx(3), Some(1));
        assert_eq!(sched.ul_symbol_idx(4), None);
        assert_eq!(sched.dl_symbol_idx(4), Some(0));
        assert!(FrameSchedule::parse("PXU").is_none());
    }

    #[test]
    fn test_validation_rejects_bad_dimensions() {
        let mut cfg = PhyConfig::default();
        cfg.demul_block_size = 50; // not a multiple of SCS_PER_CACHELINE
        assert!(cfg.validate().is_err());

        let mut cfg = PhyConfig::default();
        cfg.ofdm_data_num = 1204; // not a multiple of the transpose block
        assert!(cfg.validate().is_err());

        let mut cfg = PhyConfig::default();
        cfg.ue_num = 16; // more UEs than antennas
        cfg.bs_ant_num = 8;
        assert!(cfg.validate().is_err());

        let mut cfg = PhyConfig::default();
        cfg.frame_schedule = "PUU".to_string(); // one pilot, two UEs
        assert!(cfg.validate().is_err());

        let mut cfg = PhyConfig::default();
        cfg.num_workers = 1; // cannot cover all stages
        assert!(cfg.validate().is_err());

        let mut cfg = PhyConfig::default();
        cfg.pilot_spacing = 7; // does not divide the data width
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pilot_table_is_unit_modulus() {
        let cfg = PhyConfig::default();
        let table = cfg.ue_pilot_table();
        assert_eq!(table.len(), cfg.ofdm_data_num * cfg.ue_num);
        for p in table {
            assert!((p.norm() - 1.0).abs() < 1e-5);
        }
    }
}
