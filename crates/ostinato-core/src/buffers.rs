//! Sample, control and event storage.
//!
//! Buffers are raw byte regions owned by a [`Program`](crate::Program).
//! Processors receive stable [`BufferPtr`]s at program initialisation and
//! cast them to the kind their port declares; there are no per-sample
//! accessors.

use crate::{Error, Result};
use std::ptr::NonNull;

/// Fixed size of an event buffer, large enough for one block's worth of
/// MIDI-style events.
pub const EVENT_BUFFER_SIZE: usize = 10240;

/// Maximum number of event records an event buffer can hold.
pub const MAX_EVENTS: usize = (EVENT_BUFFER_SIZE - 4) / 8;

/// Element kind stored in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// float32 PCM, one sample per frame.
    Audio,
    /// float32 control signal, one value per frame.
    ARateControl,
    /// Single float32 per block.
    KRateControl,
    /// Variable-length event stream (see [`EventRecord`]).
    Events,
}

impl BufferKind {
    /// Byte size of a buffer of this kind for the given block size.
    pub fn size(self, block_size: u32) -> usize {
        match self {
            BufferKind::Audio | BufferKind::ARateControl => block_size as usize * 4,
            BufferKind::KRateControl => 4,
            BufferKind::Events => EVENT_BUFFER_SIZE,
        }
    }
}

/// A short MIDI-style event tagged with its in-block sample offset.
///
/// Wire layout inside an event buffer: a `u32` record count followed by
/// 8-byte records `{frame_offset: u32 le, len: u8, data: [u8; 3]}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub frame_offset: u32,
    pub len: u8,
    pub data: [u8; 3],
}

impl EventRecord {
    pub fn from_bytes(frame_offset: u32, bytes: &[u8]) -> Self {
        let mut data = [0u8; 3];
        let len = bytes.len().min(3);
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            frame_offset,
            len: len as u8,
            data,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Raw view of a buffer: pointer, byte length and element kind.
///
/// Copyable handle passed to processors via `connect_port`. The pointed-to
/// region stays valid for the lifetime of the owning program.
#[derive(Debug, Clone, Copy)]
pub struct BufferPtr {
    ptr: NonNull<u8>,
    len: usize,
    kind: BufferKind,
}

// SAFETY: a BufferPtr is only dereferenced on the audio thread, and the
// spec serialises access so that each buffer is mutated by at most one
// opcode or port owner at a time within a block.
unsafe impl Send for BufferPtr {}
unsafe impl Sync for BufferPtr {}

impl BufferPtr {
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: see the Send/Sync contract above.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self) -> &mut [u8] {
        // SAFETY: see the Send/Sync contract above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// float32 view of an audio or control buffer.
    pub fn samples(&self) -> &[f32] {
        debug_assert!(self.kind != BufferKind::Events);
        // SAFETY: allocation is 4-byte aligned (backed by a Vec<f32>-sized
        // zeroed region allocated via Buffer::new) and len is a multiple of 4.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const f32, self.len / 4) }
    }

    /// Mutable float32 view of an audio or control buffer.
    #[allow(clippy::mut_from_ref)]
    pub fn samples_mut(&self) -> &mut [f32] {
        debug_assert!(self.kind != BufferKind::Events);
        // SAFETY: as `samples`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut f32, self.len / 4) }
    }

    /// Zero the buffer. For event buffers this resets the record count.
    pub fn clear(&self) {
        self.bytes_mut().fill(0);
    }

    /// Element-wise add `other` into this buffer. Event buffers are merged
    /// ordered by frame offset.
    pub fn mix_from(&self, other: &BufferPtr) -> Result<()> {
        if self.kind != other.kind || self.len != other.len {
            return Err(Error::invalid_argument("mix of mismatched buffers"));
        }
        match self.kind {
            BufferKind::Events => {
                let merged = merge_events(&other.read_events(), &self.read_events());
                self.write_events(&merged)
            }
            _ => {
                let dst = self.samples_mut();
                for (d, s) in dst.iter_mut().zip(other.samples()) {
                    *d += s;
                }
                Ok(())
            }
        }
    }

    /// Scale every sample by `factor`. Not defined for event buffers.
    pub fn mul(&self, factor: f32) -> Result<()> {
        if self.kind == BufferKind::Events {
            return Err(Error::invalid_argument("mul not supported for event buffers"));
        }
        for s in self.samples_mut() {
            *s *= factor;
        }
        Ok(())
    }

    /// Byte-for-byte copy from `other`.
    pub fn copy_from(&self, other: &BufferPtr) -> Result<()> {
        if self.kind != other.kind || self.len != other.len {
            return Err(Error::invalid_argument("copy of mismatched buffers"));
        }
        // SAFETY: regions may alias when both handles name the same buffer.
        unsafe {
            std::ptr::copy(other.ptr.as_ptr(), self.ptr.as_ptr(), self.len);
        }
        Ok(())
    }

    /// Decode the event records stored in an event buffer.
    pub fn read_events(&self) -> Vec<EventRecord> {
        debug_assert_eq!(self.kind, BufferKind::Events);
        let bytes = self.bytes();
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let count = count.min(MAX_EVENTS);
        let mut events = Vec::with_capacity(count);
        for i in 0..count {
            let rec = &bytes[4 + i * 8..4 + i * 8 + 8];
            events.push(EventRecord {
                frame_offset: u32::from_le_bytes(rec[0..4].try_into().unwrap()),
                len: rec[4].min(3),
                data: [rec[5], rec[6], rec[7]],
            });
        }
        events
    }

    /// Encode `events` into an event buffer, truncating at capacity.
    pub fn write_events(&self, events: &[EventRecord]) -> Result<()> {
        debug_assert_eq!(self.kind, BufferKind::Events);
        if events.len() > MAX_EVENTS {
            return Err(Error::invalid_argument("event buffer overflow"));
        }
        let bytes = self.bytes_mut();
        bytes[0..4].copy_from_slice(&(events.len() as u32).to_le_bytes());
        for (i, ev) in events.iter().enumerate() {
            let rec = &mut bytes[4 + i * 8..4 + i * 8 + 8];
            rec[0..4].copy_from_slice(&ev.frame_offset.to_le_bytes());
            rec[4] = ev.len;
            rec[5..8].copy_from_slice(&ev.data);
        }
        Ok(())
    }
}

fn merge_events(a: &[EventRecord], b: &[EventRecord]) -> Vec<EventRecord> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].frame_offset <= b[j].frame_offset {
            merged.push(a[i]);
            i += 1;
        } else {
            merged.push(b[j]);
            j += 1;
        }
    }
    merged.extend_from_slice(&a[i..]);
    merged.extend_from_slice(&b[j..]);
    merged.truncate(MAX_EVENTS);
    merged
}

/// Owned buffer storage. Allocated zeroed during program setup; the
/// backing region never moves afterwards.
///
/// Backed by f32 words so that sample views are always 4-byte aligned;
/// every kind's byte size is a multiple of 4.
#[derive(Debug)]
pub struct Buffer {
    kind: BufferKind,
    data: Box<[f32]>,
}

impl Buffer {
    pub fn new(kind: BufferKind, block_size: u32) -> Self {
        let size = kind.size(block_size);
        Self {
            kind,
            data: vec![0f32; size / 4].into_boxed_slice(),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.data.len() * 4
    }

    /// Stable raw view handed to processors and opcodes.
    pub fn ptr(&self) -> BufferPtr {
        BufferPtr {
            // SAFETY: boxed slice is never empty for any kind.
            ptr: unsafe { NonNull::new_unchecked(self.data.as_ptr() as *mut u8) },
            len: self.data.len() * 4,
            kind: self.kind,
        }
    }
}
