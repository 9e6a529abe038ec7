//! # ostinato-core
//!
//! Runtime for a block-based audio processing engine: an [`Engine`]
//! interprets an immutable [`Spec`] over pre-allocated [`Buffer`]s,
//! invoking [`Processor`]s and routing the result into a [`Backend`].
//! Programs and live-code instances are swapped without blocking the
//! audio thread via the [`TripleSlot`] hand-off.

mod backend;
mod block_context;
mod buffers;
mod control_value;
mod engine;
mod error;
mod host;
mod live_code;
mod opcodes;
mod processor;
mod program;
mod slot;
mod spec;

pub use backend::{Backend, NullBackend};
pub use block_context::BlockContext;
pub use buffers::{Buffer, BufferKind, BufferPtr, EventRecord, EVENT_BUFFER_SIZE, MAX_EVENTS};
pub use control_value::{ControlScalar, ControlValue, ControlValueKind};
pub use engine::Engine;
pub use error::{Error, Result};
pub use host::HostSystem;
pub use live_code::{LiveCodeHandle, LiveCodeProcessor};
pub use processor::{
    ParameterSpec, PortDirection, PortSpec, Processor, ProcessorCell, ProcessorCore,
    ProcessorSpec, ProcessorState,
};
pub use program::Program;
pub use slot::TripleSlot;
pub use spec::{Op, OpArg, OpCode, Spec};
