//! Fundamental Pipeline Types
//!
//! Defines the frame/symbol vocabulary, event descriptors and the packed
//! task tag carried through the queue fabric.

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Frame identifier. Monotonically increasing; the physical buffer slot is
/// `frame_id % window_depth`.
pub type FrameId = u32;

/// Kind of an OFDM symbol within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolType {
    /// Uplink pilot symbol, used for channel estimation
    Pilot,
    /// Uplink data symbol
    Uplink,
    /// Downlink data symbol
    Downlink,
}

impl SymbolType {
    /// Parse a symbol type from its frame-schedule character
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'P' => Some(SymbolType::Pilot),
            'U' => Some(SymbolType::Uplink),
            'D' => Some(SymbolType::Downlink),
            _ => None,
        }
    }
}

/// Pipeline event type, one per queue-fabric partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum EventType {
    /// A radio packet landed in the current frame slot
    PacketRx = 0,
    /// Forward FFT of one (symbol, antenna)
    Fft = 1,
    /// Beam weight computation for one subcarrier group
    BeamWeights = 2,
    /// Equalization + demodulation of one subcarrier block
    Demul = 3,
    /// Bit decoding for one (symbol, UE)
    Decode = 4,
    /// Downlink precoding for one subcarrier group
    Precode = 5,
    /// Inverse FFT of one (symbol, antenna)
    Ifft = 6,
    /// Transmit a precoded symbol
    PacketTx = 7,
}

impl EventType {
    /// Number of distinct event types (queue fabric partition count per shard)
    pub const COUNT: usize = 8;
}

/// Compute stage identity for per-worker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DoerType {
    Fft = 0,
    BeamWeights = 1,
    Demul = 2,
    Decode = 3,
    Precode = 4,
    Ifft = 5,
}

impl DoerType {
    /// Number of distinct doer types
    pub const COUNT: usize = 6;
}

/// Bit-field widths of the packed task tag. Sized to the configured maxima:
/// 32-bit frame id, up to 256 symbols per frame, up to 65536 subcarriers or
/// antennas.
pub const TAG_FRAME_BITS: u32 = 32;
/// Symbol field width
pub const TAG_SYMBOL_BITS: u32 = 8;
/// Subcarrier/antenna field width
pub const TAG_INDEX_BITS: u32 = 16;

/// Compact task descriptor: one integer packing
/// `{frame_id, symbol_id, subcarrier_or_antenna_id}`.
///
/// The packed form is what travels through the queues; the named fields are
/// reconstructed exactly for all in-range values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTag {
    /// Frame identifier
    pub frame_id: FrameId,
    /// Symbol index within the frame
    pub symbol_id: u8,
    /// Subcarrier base or antenna index, depending on the stage
    pub index: u16,
}

impl TaskTag {
    /// Tag addressing a whole frame
    pub fn frame(frame_id: FrameId) -> Self {
        Self { frame_id, symbol_id: 0, index: 0 }
    }

    /// Tag addressing one symbol of a frame
    pub fn frame_symbol(frame_id: FrameId, symbol_id: u8) -> Self {
        Self { frame_id, symbol_id, index: 0 }
    }

    /// Tag addressing a (frame, symbol, subcarrier-base or antenna) triple
    pub fn frame_symbol_index(frame_id: FrameId, symbol_id: u8, index: u16) -> Self {
        Self { frame_id, symbol_id, index }
    }

    /// Pack into the wire integer
    pub fn pack(self) -> u64 {
        ((self.frame_id as u64) << (TAG_SYMBOL_BITS + TAG_INDEX_BITS))
            | ((self.symbol_id as u64) << TAG_INDEX_BITS)
            | self.index as u64
    }

    /// Reconstruct the triple from a packed tag
    pub fn unpack(tag: u64) -> Self {
        Self {
            frame_id: (tag >> (TAG_SYMBOL_BITS + TAG_INDEX_BITS)) as FrameId,
            symbol_id: ((tag >> TAG_INDEX_BITS) & ((1 << TAG_SYMBOL_BITS) - 1)) as u8,
            index: (tag & ((1 << TAG_INDEX_BITS) - 1)) as u16,
        }
    }
}

/// One work or completion descriptor carried by the queue fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventData {
    /// Which pipeline stage this event belongs to
    pub event_type: EventType,
    /// Task identity
    pub tag: TaskTag,
}

impl EventData {
    /// Create a new event descriptor
    pub fn new(event_type: EventType, tag: TaskTag) -> Self {
        Self { event_type, tag }
    }
}
