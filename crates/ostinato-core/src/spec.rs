//! Program specifications: an opcode stream over named buffers, processor
//! references and control values.
//!
//! A `Spec` is produced by the control plane (ultimately by a layer
//! outside this crate) and interpreted by the engine. Names are resolved
//! to indices when opcodes are appended, so the audio thread never does
//! string lookups.

use crate::buffers::BufferKind;
use crate::control_value::ControlValue;
use crate::processor::ProcessorCell;
use crate::{Error, Result};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Noop,
    End,
    Copy,
    Clear,
    Mix,
    Mul,
    SetFloat,
    FetchControlValue,
    FetchEvents,
    Noise,
    Sine,
    Output,
    ConnectPort,
    Call,
}

/// A resolved opcode argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OpArg {
    Int(i64),
    Float(f32),
    Str(String),
    /// Index into the spec's buffer table.
    Buffer(usize),
    /// Index into the spec's processor table.
    Processor(usize),
    /// Index into the spec's control value table.
    ControlValue(usize),
}

impl OpArg {
    pub fn buffer(&self) -> usize {
        match self {
            OpArg::Buffer(idx) => *idx,
            other => panic!("expected buffer arg, got {other:?}"),
        }
    }

    pub fn processor(&self) -> usize {
        match self {
            OpArg::Processor(idx) => *idx,
            other => panic!("expected processor arg, got {other:?}"),
        }
    }

    pub fn control_value(&self) -> usize {
        match self {
            OpArg::ControlValue(idx) => *idx,
            other => panic!("expected control value arg, got {other:?}"),
        }
    }

    pub fn int(&self) -> i64 {
        match self {
            OpArg::Int(v) => *v,
            other => panic!("expected int arg, got {other:?}"),
        }
    }

    pub fn float(&self) -> f32 {
        match self {
            OpArg::Float(v) => *v,
            other => panic!("expected float arg, got {other:?}"),
        }
    }

    pub fn str(&self) -> &str {
        match self {
            OpArg::Str(v) => v,
            other => panic!("expected string arg, got {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Op {
    pub opcode: OpCode,
    pub args: SmallVec<[OpArg; 4]>,
}

/// Immutable instruction list plus the tables it indexes into.
#[derive(Debug, Default)]
pub struct Spec {
    ops: Vec<Op>,
    buffers: Vec<(String, BufferKind)>,
    buffer_map: HashMap<String, usize>,
    processors: Vec<Arc<ProcessorCell>>,
    processor_map: HashMap<u64, usize>,
    control_values: Vec<Arc<ControlValue>>,
    control_value_map: HashMap<String, usize>,
}

impl Spec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a buffer. Duplicate names are rejected.
    pub fn append_buffer(&mut self, name: impl Into<String>, kind: BufferKind) -> Result<()> {
        let name = name.into();
        if self.buffer_map.contains_key(&name) {
            return Err(Error::invalid_argument(format!(
                "duplicate buffer name '{name}'"
            )));
        }
        self.buffer_map.insert(name.clone(), self.buffers.len());
        self.buffers.push((name, kind));
        Ok(())
    }

    pub fn buffer_idx(&self, name: &str) -> Result<usize> {
        self.buffer_map
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("unknown buffer '{name}'")))
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, idx: usize) -> (&str, BufferKind) {
        let (name, kind) = &self.buffers[idx];
        (name, *kind)
    }

    /// Reference a processor so opcodes can name it. Idempotent per id.
    pub fn append_processor(&mut self, processor: Arc<ProcessorCell>) {
        if self.processor_map.contains_key(&processor.id()) {
            return;
        }
        self.processor_map.insert(processor.id(), self.processors.len());
        self.processors.push(processor);
    }

    pub fn processor_idx(&self, id: u64) -> Result<usize> {
        self.processor_map
            .get(&id)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("unknown processor {id:#x}")))
    }

    pub fn processor(&self, idx: usize) -> &Arc<ProcessorCell> {
        &self.processors[idx]
    }

    pub fn processors(&self) -> impl Iterator<Item = &Arc<ProcessorCell>> {
        self.processors.iter()
    }

    /// Reference a control value. Idempotent per name.
    pub fn append_control_value(&mut self, cv: Arc<ControlValue>) {
        if self.control_value_map.contains_key(cv.name()) {
            return;
        }
        self.control_value_map
            .insert(cv.name().to_string(), self.control_values.len());
        self.control_values.push(cv);
    }

    pub fn control_value(&self, idx: usize) -> &Arc<ControlValue> {
        &self.control_values[idx]
    }

    pub fn control_values(&self) -> impl Iterator<Item = &Arc<ControlValue>> {
        self.control_values.iter()
    }

    fn push(&mut self, opcode: OpCode, args: impl IntoIterator<Item = OpArg>) {
        self.ops.push(Op {
            opcode,
            args: args.into_iter().collect(),
        });
    }

    pub fn op_end(&mut self) {
        self.push(OpCode::End, []);
    }

    pub fn op_copy(&mut self, src: &str, dst: &str) -> Result<()> {
        let args = [
            OpArg::Buffer(self.buffer_idx(src)?),
            OpArg::Buffer(self.buffer_idx(dst)?),
        ];
        self.push(OpCode::Copy, args);
        Ok(())
    }

    pub fn op_clear(&mut self, buf: &str) -> Result<()> {
        let arg = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::Clear, [arg]);
        Ok(())
    }

    /// Add `src` into `dst`.
    pub fn op_mix(&mut self, src: &str, dst: &str) -> Result<()> {
        let args = [
            OpArg::Buffer(self.buffer_idx(src)?),
            OpArg::Buffer(self.buffer_idx(dst)?),
        ];
        self.push(OpCode::Mix, args);
        Ok(())
    }

    pub fn op_mul(&mut self, buf: &str, factor: f32) -> Result<()> {
        let arg = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::Mul, [arg, OpArg::Float(factor)]);
        Ok(())
    }

    pub fn op_set_float(&mut self, buf: &str, value: f32) -> Result<()> {
        let arg = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::SetFloat, [arg, OpArg::Float(value)]);
        Ok(())
    }

    pub fn op_fetch_control_value(&mut self, name: &str, buf: &str) -> Result<()> {
        let cv = OpArg::ControlValue(
            self.control_value_map
                .get(name)
                .copied()
                .ok_or_else(|| Error::invalid_argument(format!("unknown control value '{name}'")))?,
        );
        let buf = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::FetchControlValue, [cv, buf]);
        Ok(())
    }

    /// Materialise the block's input events into an event buffer.
    pub fn op_fetch_events(&mut self, buf: &str) -> Result<()> {
        let arg = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::FetchEvents, [arg]);
        Ok(())
    }

    pub fn op_noise(&mut self, buf: &str) -> Result<()> {
        let arg = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::Noise, [arg]);
        Ok(())
    }

    pub fn op_sine(&mut self, buf: &str, freq: f32) -> Result<()> {
        let arg = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::Sine, [arg, OpArg::Float(freq)]);
        Ok(())
    }

    /// Route a buffer into a backend channel.
    pub fn op_output(&mut self, buf: &str, channel: &str) -> Result<()> {
        let arg = OpArg::Buffer(self.buffer_idx(buf)?);
        self.push(OpCode::Output, [arg, OpArg::Str(channel.to_string())]);
        Ok(())
    }

    /// Bind a processor port to a buffer (init phase).
    pub fn op_connect_port(&mut self, processor_id: u64, port_idx: u32, buf: &str) -> Result<()> {
        let args = [
            OpArg::Processor(self.processor_idx(processor_id)?),
            OpArg::Int(port_idx as i64),
            OpArg::Buffer(self.buffer_idx(buf)?),
        ];
        self.push(OpCode::ConnectPort, args);
        Ok(())
    }

    pub fn op_call(&mut self, processor_id: u64) -> Result<()> {
        let arg = OpArg::Processor(self.processor_idx(processor_id)?);
        self.push(OpCode::Call, [arg]);
        Ok(())
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn op(&self, idx: usize) -> &Op {
        &self.ops[idx]
    }

    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.ops.iter()
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            write!(f, "{i:3} {:?}(", op.opcode)?;
            for (a, arg) in op.args.iter().enumerate() {
                if a > 0 {
                    write!(f, ", ")?;
                }
                match arg {
                    OpArg::Buffer(idx) => write!(f, "buf<{}>", self.buffers[*idx].0)?,
                    OpArg::Processor(idx) => {
                        write!(f, "proc<{:016x}>", self.processors[*idx].id())?
                    }
                    OpArg::ControlValue(idx) => {
                        write!(f, "cv<{}>", self.control_values[*idx].name())?
                    }
                    OpArg::Int(v) => write!(f, "{v}")?,
                    OpArg::Float(v) => write!(f, "{v}")?,
                    OpArg::Str(v) => write!(f, "\"{v}\"")?,
                }
            }
            writeln!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_resolution() {
        let mut spec = Spec::new();
        spec.append_buffer("out_l", BufferKind::Audio).unwrap();
        assert!(spec.append_buffer("out_l", BufferKind::Audio).is_err());
        spec.op_clear("out_l").unwrap();
        assert!(spec.op_clear("missing").is_err());
        assert_eq!(spec.num_ops(), 1);
        assert_eq!(spec.op(0).args[0], OpArg::Buffer(0));
    }

    #[test]
    fn test_display() {
        let mut spec = Spec::new();
        spec.append_buffer("out_l", BufferKind::Audio).unwrap();
        spec.op_sine("out_l", 440.0).unwrap();
        spec.op_output("out_l", "left").unwrap();
        spec.op_end();
        let dump = spec.to_string();
        assert!(dump.contains("Sine"));
        assert!(dump.contains("buf<out_l>"));
    }
}
