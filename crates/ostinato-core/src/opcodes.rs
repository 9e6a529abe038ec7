//! Opcode interpreter. One init pass binds ports the first time a program
//! runs; after that each block executes the run phase of every opcode in
//! spec order until `End`.

use crate::backend::Backend;
use crate::block_context::BlockContext;
use crate::buffers::BufferKind;
use crate::control_value::ControlScalar;
use crate::host::HostSystem;
use crate::program::Program;
use crate::spec::{Op, OpCode};
use crate::{Error, Result};

pub(crate) struct OpEnv<'a> {
    pub program: &'a Program,
    pub host: &'a HostSystem,
    pub backend: &'a mut dyn Backend,
    pub noise_state: &'a mut u64,
}

/// Init phase: runs once per program, on the audio thread.
pub(crate) fn init_op(program: &Program, op: &Op) -> Result<()> {
    if op.opcode != OpCode::ConnectPort {
        return Ok(());
    }
    let cell = program.spec.processor(op.args[0].processor());
    let port_idx = op.args[1].int() as u32;
    let buf = program.buffer_ptr(op.args[2].buffer());
    // SAFETY: audio thread; no other reference into the cell is alive.
    unsafe { cell.get_mut() }.connect_port(port_idx, buf)
}

/// Run phase. Returns true when an `End` opcode terminated the program.
pub(crate) fn run_op(env: &mut OpEnv<'_>, ctxt: &mut BlockContext, op: &Op) -> Result<bool> {
    match op.opcode {
        OpCode::Noop | OpCode::ConnectPort => {}
        OpCode::End => return Ok(true),
        OpCode::Copy => {
            let src = env.program.buffer_ptr(op.args[0].buffer());
            let dst = env.program.buffer_ptr(op.args[1].buffer());
            dst.copy_from(&src)?;
        }
        OpCode::Clear => {
            env.program.buffer_ptr(op.args[0].buffer()).clear();
        }
        OpCode::Mix => {
            let src = env.program.buffer_ptr(op.args[0].buffer());
            let dst = env.program.buffer_ptr(op.args[1].buffer());
            dst.mix_from(&src)?;
        }
        OpCode::Mul => {
            let buf = env.program.buffer_ptr(op.args[0].buffer());
            buf.mul(op.args[1].float())?;
        }
        OpCode::SetFloat => {
            let buf = env.program.buffer_ptr(op.args[0].buffer());
            if buf.kind() != BufferKind::KRateControl {
                return Err(Error::invalid_argument(
                    "SetFloat target must be a k-rate buffer".to_string(),
                ));
            }
            buf.samples_mut()[0] = op.args[1].float();
        }
        OpCode::FetchControlValue => {
            let cv = env.program.spec.control_value(op.args[0].control_value());
            let buf = env.program.buffer_ptr(op.args[1].buffer());
            if buf.kind() != BufferKind::KRateControl {
                return Err(Error::invalid_argument(
                    "FetchControlValue target must be a k-rate buffer".to_string(),
                ));
            }
            let (value, _) = cv.read();
            buf.samples_mut()[0] = match value {
                ControlScalar::Float(v) => v,
                ControlScalar::Int(v) => v as f32,
            };
        }
        OpCode::FetchEvents => {
            let buf = env.program.buffer_ptr(op.args[0].buffer());
            if buf.kind() != BufferKind::Events {
                return Err(Error::invalid_argument(
                    "FetchEvents target must be an event buffer".to_string(),
                ));
            }
            buf.write_events(&ctxt.input_events)?;
        }
        OpCode::Noise => {
            let buf = env.program.buffer_ptr(op.args[0].buffer());
            let samples = &mut buf.samples_mut()[..ctxt.block_size as usize];
            for s in samples {
                // xorshift64*, cheap enough for the audio thread.
                *env.noise_state ^= *env.noise_state << 13;
                *env.noise_state ^= *env.noise_state >> 7;
                *env.noise_state ^= *env.noise_state << 17;
                let unit = (*env.noise_state >> 40) as f32 / (1u64 << 24) as f32;
                *s = 2.0 * unit - 1.0;
            }
        }
        OpCode::Sine => {
            let buf = env.program.buffer_ptr(op.args[0].buffer());
            let freq = op.args[1].float();
            let rate = env.host.sample_rate() as f64;
            let samples = &mut buf.samples_mut()[..ctxt.block_size as usize];
            for (i, s) in samples.iter_mut().enumerate() {
                let n = ctxt.sample_pos + i as u64;
                *s = (2.0 * std::f64::consts::PI * freq as f64 * n as f64 / rate).sin() as f32;
            }
        }
        OpCode::Output => {
            let buf = env.program.buffer_ptr(op.args[0].buffer());
            let channel = op.args[1].str();
            match buf.kind() {
                BufferKind::Audio | BufferKind::ARateControl => {}
                _ => {
                    return Err(Error::invalid_argument(
                        "Output source must be an audio buffer".to_string(),
                    ))
                }
            }
            let samples = &buf.samples()[..ctxt.block_size as usize];
            env.backend.output(ctxt, channel, samples)?;
        }
        OpCode::Call => {
            let cell = env.program.spec.processor(op.args[0].processor());
            // SAFETY: audio thread; no other reference into the cell is alive.
            unsafe { cell.get_mut() }.run(ctxt)?;
        }
    }
    Ok(false)
}
