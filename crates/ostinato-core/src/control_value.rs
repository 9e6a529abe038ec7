//! Named scalar parameters with generation counters for change detection.
//!
//! Control values are created by the control plane and updated only
//! between blocks: `Engine::set_*_control_value` enqueues a pending
//! update that the audio thread applies at the top of the next block.
//! Processors poll the generation to detect changes.

use crate::{Error, Result};
use atomic_float::AtomicF32;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// A control value update or reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlScalar {
    Float(f32),
    Int(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValueKind {
    Float,
    Int,
}

#[derive(Debug)]
enum Store {
    Float(AtomicF32),
    Int(AtomicI64),
}

/// Named scalar visible to processors.
///
/// The generation starts at 0 and is bumped by exactly one for every
/// applied update, so it is strictly increasing and equals the number of
/// updates applied so far.
#[derive(Debug)]
pub struct ControlValue {
    name: String,
    store: Store,
    generation: AtomicU32,
}

impl ControlValue {
    pub fn float(name: impl Into<String>, initial: f32) -> Self {
        Self {
            name: name.into(),
            store: Store::Float(AtomicF32::new(initial)),
            generation: AtomicU32::new(0),
        }
    }

    pub fn int(name: impl Into<String>, initial: i64) -> Self {
        Self {
            name: name.into(),
            store: Store::Int(AtomicI64::new(initial)),
            generation: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ControlValueKind {
        match self.store {
            Store::Float(_) => ControlValueKind::Float,
            Store::Int(_) => ControlValueKind::Int,
        }
    }

    /// Current value and generation.
    pub fn read(&self) -> (ControlScalar, u32) {
        let generation = self.generation.load(Ordering::Acquire);
        let value = match &self.store {
            Store::Float(v) => ControlScalar::Float(v.load(Ordering::Acquire)),
            Store::Int(v) => ControlScalar::Int(v.load(Ordering::Acquire)),
        };
        (value, generation)
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store a new value and bump the generation. Called by the audio
    /// thread between blocks.
    pub fn apply(&self, value: ControlScalar) -> Result<()> {
        match (&self.store, value) {
            (Store::Float(v), ControlScalar::Float(f)) => v.store(f, Ordering::Release),
            (Store::Int(v), ControlScalar::Int(i)) => v.store(i, Ordering::Release),
            _ => {
                return Err(Error::invalid_argument(format!(
                    "control value '{}' updated with mismatched type",
                    self.name
                )))
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
