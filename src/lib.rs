//! # Ostinato — real-time audio processing engine
//!
//! Ostinato executes a directed graph of signal-processing nodes on
//! fixed-size sample blocks, mixes their outputs and delivers them to a
//! hardware or IPC sink. It is built from two subsystems:
//!
//! - **ostinato-core** — the engine runtime: buffers, control values,
//!   processors, the opcode interpreter, and the triple-slot hand-off
//!   that swaps programs and live-code instances without blocking the
//!   audio thread.
//! - **ostinato-io** — the output paths: a cpal device backend with a
//!   MIDI input bridge, and a framed named-pipe IPC backend.
//!
//! ## Quick start
//!
//! ```no_run
//! use ostinato::prelude::*;
//!
//! let handle = EngineBuilder::new()
//!     .sample_rate(48_000)
//!     .block_size(256)
//!     .build()?;
//! let engine = handle.engine();
//!
//! // Describe a program: one sine into the left channel.
//! let mut spec = Spec::new();
//! spec.append_buffer("out_l", BufferKind::Audio)?;
//! spec.op_sine("out_l", 440.0)?;
//! spec.op_output("out_l", "left")?;
//! spec.op_end();
//! engine.set_spec(spec)?;
//! # Ok::<(), ostinato::Error>(())
//! ```
//!
//! Processors with swappable code use [`LiveCodeProcessor`]: the control
//! thread recompiles through its handle while the audio thread keeps
//! pulling frames.

/// Re-export of ostinato-core for direct access.
pub use ostinato_core as core;

pub use ostinato_core::{
    Backend, BlockContext, Buffer, BufferKind, BufferPtr, ControlScalar, ControlValue,
    ControlValueKind, Engine, Error, EventRecord, HostSystem, LiveCodeHandle, LiveCodeProcessor,
    NullBackend, OpCode, ParameterSpec, PortDirection, PortSpec, Processor, ProcessorCell,
    ProcessorCore, ProcessorSpec, ProcessorState, Program, Result, Spec, TripleSlot,
};

/// Re-export of ostinato-io for direct access.
pub use ostinato_io as io;

pub use ostinato_io::{AudioStream, BlockBuffer, BlockData, CpalBackend, IpcBackend, StreamCloser};

mod builder;

pub use builder::{BackendConfig, EngineBuilder, EngineHandle};

/// Convenience prelude for common imports.
pub mod prelude {
    pub use crate::{
        Backend, BackendConfig, BlockContext, BufferKind, ControlValue, Engine, EngineBuilder,
        EngineHandle, HostSystem, LiveCodeProcessor, NullBackend, PortDirection, PortSpec,
        Processor, ProcessorSpec, Spec,
    };
}
