//! Shared host configuration visible to the engine, processors and backends.

use std::sync::atomic::{AtomicU32, Ordering};

/// Host-wide audio parameters.
///
/// The sample rate is fixed for the lifetime of the system. The block size
/// is an atomic: backends may change it between blocks (e.g. when an IPC
/// peer requests a different size) and the engine picks the new value up
/// the next time a program is built.
#[derive(Debug)]
pub struct HostSystem {
    sample_rate: u32,
    block_size: AtomicU32,
}

impl HostSystem {
    pub fn new(sample_rate: u32, block_size: u32) -> Self {
        Self {
            sample_rate,
            block_size: AtomicU32::new(block_size),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn set_block_size(&self, block_size: u32) {
        self.block_size.store(block_size, Ordering::Release);
    }
}
