//! Transient per-block context threaded through `begin_block` / `run` /
//! `end_block`.

use crate::buffers::EventRecord;

/// Per-block state. Event and message vectors are pre-allocated and
/// reused; the audio thread only ever clears and refills them.
#[derive(Debug)]
pub struct BlockContext {
    pub block_size: u32,
    pub sample_pos: u64,
    /// Input events (e.g. MIDI) collected by the backend at `begin_block`.
    pub input_events: Vec<EventRecord>,
    /// Opaque messages received from an IPC peer for this block.
    pub messages_in: Vec<Vec<u8>>,
    /// Opaque messages to hand back to the peer at `end_block`.
    pub messages_out: Vec<Vec<u8>>,
}

impl BlockContext {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            sample_pos: 0,
            input_events: Vec::with_capacity(crate::buffers::MAX_EVENTS),
            messages_in: Vec::with_capacity(16),
            messages_out: Vec::with_capacity(16),
        }
    }
}
