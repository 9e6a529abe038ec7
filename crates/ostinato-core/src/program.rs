//! A program: an immutable snapshot of a spec bound to allocated buffers
//! for one block size.

use crate::buffers::{Buffer, BufferPtr};
use crate::spec::Spec;
use crate::Result;

/// Immutable once `setup` completes; published to the audio thread
/// through the engine's triple slot. The init-phase opcodes (port
/// binding) run on the audio thread the first time the program is
/// processed, guarded by `initialized`.
#[derive(Debug)]
pub struct Program {
    version: u32,
    pub(crate) spec: Spec,
    block_size: u32,
    buffers: Vec<Buffer>,
    pub(crate) initialized: bool,
}

impl Program {
    pub(crate) fn new(version: u32, spec: Spec, block_size: u32) -> Self {
        tracing::info!(version, block_size, "created program");
        Self {
            version,
            spec,
            block_size,
            buffers: Vec::new(),
            initialized: false,
        }
    }

    /// Allocate every buffer the spec names.
    pub(crate) fn setup(&mut self) -> Result<()> {
        let mut total = 0usize;
        self.buffers.reserve(self.spec.num_buffers());
        for idx in 0..self.spec.num_buffers() {
            let (_, kind) = self.spec.buffer(idx);
            let buffer = Buffer::new(kind, self.block_size);
            total += buffer.size();
            self.buffers.push(buffer);
        }
        tracing::info!(
            version = self.version,
            bytes = total,
            "allocated program buffers"
        );
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub(crate) fn buffer_ptr(&self, idx: usize) -> BufferPtr {
        self.buffers[idx].ptr()
    }

    /// Zero all buffers. Runs on the audio thread when the program
    /// becomes current.
    pub(crate) fn clear_buffers(&self) {
        for buffer in &self.buffers {
            buffer.ptr().clear();
        }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        tracing::info!(version = self.version, "dropped program");
    }
}
