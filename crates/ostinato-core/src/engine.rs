//! The engine owns processors, control values and the active program,
//! and drives one block per backend cycle.
//!
//! Thread model: all mutation of the registries and all program
//! publication happen on a single logical control thread; `process_block`
//! is entered by a single audio thread and is not reentrant. The two
//! sides meet only at the program triple slot and the pending
//! control-value queue.

use crate::backend::Backend;
use crate::block_context::BlockContext;
use crate::control_value::{ControlScalar, ControlValue, ControlValueKind};
use crate::host::HostSystem;
use crate::opcodes::{init_op, run_op, OpEnv};
use crate::processor::{Processor, ProcessorCell};
use crate::program::Program;
use crate::slot::TripleSlot;
use crate::spec::Spec;
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const PENDING_CONTROL_UPDATES: usize = 256;

struct ActiveProcessor {
    cell: Arc<ProcessorCell>,
    ref_count: u32,
}

struct ActiveControlValue {
    value: Arc<ControlValue>,
    ref_count: u32,
}

struct ControlValueUpdate {
    value: Arc<ControlValue>,
    scalar: ControlScalar,
}

pub struct Engine {
    host: Arc<HostSystem>,
    processors: Mutex<HashMap<u64, ActiveProcessor>>,
    control_values: Mutex<HashMap<String, ActiveControlValue>>,
    programs: TripleSlot<Program>,
    program_version: AtomicU32,
    cv_updates_tx: Sender<ControlValueUpdate>,
    cv_updates_rx: Receiver<ControlValueUpdate>,
    noise_state: AtomicU64,
}

impl Engine {
    pub fn new(host: Arc<HostSystem>) -> Self {
        let (cv_updates_tx, cv_updates_rx) = bounded(PENDING_CONTROL_UPDATES);
        Self {
            host,
            processors: Mutex::new(HashMap::new()),
            control_values: Mutex::new(HashMap::new()),
            programs: TripleSlot::new(),
            program_version: AtomicU32::new(0),
            cv_updates_tx,
            cv_updates_rx,
            noise_state: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        }
    }

    pub fn host(&self) -> &Arc<HostSystem> {
        &self.host
    }

    pub fn set_block_size(&self, block_size: u32) {
        self.host.set_block_size(block_size);
    }

    /// Register a fully configured processor. The spec that references it
    /// must be set afterwards for it to become live.
    pub fn add_processor(&self, processor: Box<dyn Processor>) -> Result<Arc<ProcessorCell>> {
        let cell = ProcessorCell::new(processor);
        let mut processors = self.processors.lock();
        if processors.contains_key(&cell.id()) {
            return Err(Error::invalid_argument(format!(
                "duplicate processor {:#x}",
                cell.id()
            )));
        }
        tracing::info!(id = cell.id(), node_id = cell.node_id(), "added processor");
        processors.insert(
            cell.id(),
            ActiveProcessor {
                cell: cell.clone(),
                ref_count: 0,
            },
        );
        Ok(cell)
    }

    pub fn processor(&self, id: u64) -> Result<Arc<ProcessorCell>> {
        self.processors
            .lock()
            .get(&id)
            .map(|p| p.cell.clone())
            .ok_or_else(|| Error::invalid_argument(format!("unknown processor {id:#x}")))
    }

    pub fn add_control_value(&self, cv: ControlValue) -> Result<Arc<ControlValue>> {
        let mut control_values = self.control_values.lock();
        if control_values.contains_key(cv.name()) {
            return Err(Error::invalid_argument(format!(
                "duplicate control value '{}'",
                cv.name()
            )));
        }
        let value = Arc::new(cv);
        control_values.insert(
            value.name().to_string(),
            ActiveControlValue {
                value: value.clone(),
                ref_count: 0,
            },
        );
        Ok(value)
    }

    pub fn control_value(&self, name: &str) -> Result<Arc<ControlValue>> {
        self.control_values
            .lock()
            .get(name)
            .map(|cv| cv.value.clone())
            .ok_or_else(|| Error::invalid_argument(format!("unknown control value '{name}'")))
    }

    /// Enqueue a float update, applied by the audio thread between blocks.
    pub fn set_float_control_value(&self, name: &str, value: f32) -> Result<()> {
        self.enqueue_control_update(name, ControlValueKind::Float, ControlScalar::Float(value))
    }

    /// Enqueue an int update, applied by the audio thread between blocks.
    pub fn set_int_control_value(&self, name: &str, value: i64) -> Result<()> {
        self.enqueue_control_update(name, ControlValueKind::Int, ControlScalar::Int(value))
    }

    fn enqueue_control_update(
        &self,
        name: &str,
        kind: ControlValueKind,
        scalar: ControlScalar,
    ) -> Result<()> {
        let value = self.control_value(name)?;
        if value.kind() != kind {
            return Err(Error::invalid_argument(format!(
                "control value '{name}' updated with mismatched type"
            )));
        }
        self.cv_updates_tx
            .try_send(ControlValueUpdate { value, scalar })
            .map_err(|_| Error::invalid_state("control value queue full".to_string()))
    }

    /// Build a program for `spec`, activate it and publish it for the
    /// audio thread to pick up at the next block boundary.
    pub fn set_spec(&self, spec: Spec) -> Result<()> {
        let version = self.program_version.fetch_add(1, Ordering::Relaxed) + 1;
        let mut program = Program::new(version, spec, self.host.block_size());
        program.setup()?;
        self.activate_program(&program)?;

        // Reclaim a program the audio thread never picked up, and the one
        // it stopped using.
        let (stale, old) = self.programs.discard_stale();
        for evicted in [stale, old].into_iter().flatten() {
            self.deactivate_program(&evicted);
        }

        tracing::info!(version, "published program");
        self.programs.publish(Box::new(program));
        Ok(())
    }

    /// Reclaim the program the audio thread has stopped using. Call
    /// periodically from the control thread.
    pub fn run_maintenance(&self) {
        if let Some(old) = self.programs.take_old() {
            tracing::info!(version = old.version(), "retiring old program");
            self.deactivate_program(&old);
        }
    }

    pub fn has_current_program(&self) -> bool {
        self.programs.has_current()
    }

    fn activate_program(&self, program: &Program) -> Result<()> {
        let mut processors = self.processors.lock();
        for cell in program.spec().processors() {
            let active = processors.get_mut(&cell.id()).ok_or_else(|| {
                Error::invalid_state(format!("processor {:#x} not registered", cell.id()))
            })?;
            active.ref_count += 1;
        }
        drop(processors);

        let mut control_values = self.control_values.lock();
        for cv in program.spec().control_values() {
            let active = control_values.get_mut(cv.name()).ok_or_else(|| {
                Error::invalid_state(format!("control value '{}' not registered", cv.name()))
            })?;
            active.ref_count += 1;
        }
        Ok(())
    }

    fn deactivate_program(&self, program: &Program) {
        let mut processors = self.processors.lock();
        for cell in program.spec().processors() {
            if let Some(active) = processors.get_mut(&cell.id()) {
                active.ref_count -= 1;
                if active.ref_count == 0 {
                    tracing::info!(id = cell.id(), "deactivating processor");
                    // SAFETY: ref count zero means no program on any slot
                    // references the cell anymore.
                    unsafe { active.cell.get_mut_unregistered() }.cleanup();
                    processors.remove(&cell.id());
                }
            }
        }
        drop(processors);

        let mut control_values = self.control_values.lock();
        for cv in program.spec().control_values() {
            if let Some(active) = control_values.get_mut(cv.name()) {
                active.ref_count -= 1;
                if active.ref_count == 0 {
                    tracing::info!(name = cv.name(), "deactivating control value");
                    control_values.remove(cv.name());
                }
            }
        }
    }

    fn apply_pending_control_updates(&self) {
        while let Ok(update) = self.cv_updates_rx.try_recv() {
            if let Err(err) = update.value.apply(update.scalar) {
                tracing::warn!(%err, "dropped control value update");
            }
        }
    }

    /// Audio-thread entry point; not reentrant. Runs one block: promotes a
    /// pending program, applies control updates, interprets the spec and
    /// routes output into the backend.
    pub fn process_block(&self, backend: &mut dyn Backend, ctxt: &mut BlockContext) -> Result<()> {
        if self.programs.promote() {
            if let Some(program) = self.programs.current() {
                tracing::debug!(version = program.version(), "using program");
                program.clear_buffers();
            }
        }

        // SAFETY: single audio thread; the current program can only be
        // displaced by this thread's own promote above.
        let Some(program) = self.programs.current_mut() else {
            // No program: emit one silent begin/end cycle.
            ctxt.block_size = self.host.block_size();
            backend.begin_block(ctxt)?;
            return backend.end_block(ctxt);
        };

        self.apply_pending_control_updates();

        ctxt.block_size = program.block_size();
        backend.begin_block(ctxt)?;

        // An IPC peer may switch block sizes mid-stream; until a program
        // built for the new size is activated, this program's buffers
        // bound what a block can compute. The backend pads its channels.
        if ctxt.block_size > program.block_size() {
            ctxt.block_size = program.block_size();
        }

        if !program.initialized {
            for idx in 0..program.spec.num_ops() {
                if let Err(err) = init_op(program, program.spec.op(idx)) {
                    tracing::warn!(%err, op = idx, "program init failed");
                    backend.end_block(ctxt)?;
                    return Err(err);
                }
            }
            program.initialized = true;
        }

        let mut noise_state = self.noise_state.load(Ordering::Relaxed);
        {
            let program: &Program = program;
            let mut env = OpEnv {
                program,
                host: &self.host,
                backend,
                noise_state: &mut noise_state,
            };
            for idx in 0..program.spec.num_ops() {
                let op = program.spec.op(idx);
                match run_op(&mut env, ctxt, op) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(Error::ProtocolViolation(msg)) => {
                        return Err(Error::ProtocolViolation(msg))
                    }
                    Err(err) => {
                        // Skip the rest of the block; the backend still
                        // finishes the cycle with what was written.
                        tracing::warn!(%err, op = idx, "opcode failed, skipping rest of block");
                        break;
                    }
                }
            }
        }
        self.noise_state.store(noise_state, Ordering::Relaxed);

        ctxt.sample_pos += ctxt.block_size as u64;

        backend.end_block(ctxt)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for program in self.programs.drain().into_iter().flatten() {
            self.deactivate_program(&program);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::buffers::BufferKind;

    fn engine(block_size: u32) -> Engine {
        Engine::new(Arc::new(HostSystem::new(48_000, block_size)))
    }

    #[test]
    fn test_silent_block_without_program() {
        let engine = engine(256);
        let mut backend = NullBackend::new();
        backend.setup(engine.host()).unwrap();
        let mut ctxt = BlockContext::new(256);

        engine.process_block(&mut backend, &mut ctxt).unwrap();

        assert_eq!(backend.begin_blocks(), 1);
        assert_eq!(backend.end_blocks(), 1);
        assert_eq!(backend.outputs(), 0);
    }

    #[test]
    fn test_sine_program() {
        let engine = engine(64);
        let mut spec = Spec::new();
        spec.append_buffer("out_l", BufferKind::Audio).unwrap();
        spec.op_sine("out_l", 440.0).unwrap();
        spec.op_output("out_l", "left").unwrap();
        spec.op_end();
        engine.set_spec(spec).unwrap();

        let mut backend = NullBackend::new();
        backend.setup(engine.host()).unwrap();
        let mut ctxt = BlockContext::new(64);
        engine.process_block(&mut backend, &mut ctxt).unwrap();

        let left = backend.channel("left").unwrap();
        assert_eq!(left.len(), 64);
        for (n, sample) in left.iter().enumerate() {
            let expected = (2.0 * std::f64::consts::PI * 440.0 * n as f64 / 48_000.0).sin() as f32;
            assert!(
                (sample - expected).abs() < 1e-5,
                "sample {n}: {sample} != {expected}"
            );
        }
        assert_eq!(ctxt.sample_pos, 64);
    }

    #[test]
    fn test_program_swap_drains_old_on_maintenance() {
        let engine = engine(64);
        let mut backend = NullBackend::new();
        backend.setup(engine.host()).unwrap();
        let mut ctxt = BlockContext::new(64);

        let mut spec = Spec::new();
        spec.append_buffer("out_l", BufferKind::Audio).unwrap();
        spec.op_output("out_l", "left").unwrap();
        spec.op_end();
        engine.set_spec(spec).unwrap();
        engine.process_block(&mut backend, &mut ctxt).unwrap();

        let mut spec = Spec::new();
        spec.append_buffer("out_l", BufferKind::Audio).unwrap();
        spec.op_noise("out_l").unwrap();
        spec.op_output("out_l", "left").unwrap();
        spec.op_end();
        engine.set_spec(spec).unwrap();
        engine.process_block(&mut backend, &mut ctxt).unwrap();

        assert!(engine.programs.has_old());
        engine.run_maintenance();
        assert!(!engine.programs.has_old());
    }

    #[test]
    fn test_control_value_update_between_blocks() {
        let engine = engine(16);
        let cv = engine
            .add_control_value(ControlValue::float("gain", 1.0))
            .unwrap();

        let mut spec = Spec::new();
        spec.append_buffer("gain_k", BufferKind::KRateControl).unwrap();
        spec.append_control_value(cv.clone());
        spec.op_fetch_control_value("gain", "gain_k").unwrap();
        spec.op_end();
        engine.set_spec(spec).unwrap();

        engine.set_float_control_value("gain", 0.25).unwrap();
        assert!(engine.set_int_control_value("gain", 1).is_err());

        let mut backend = NullBackend::new();
        backend.setup(engine.host()).unwrap();
        let mut ctxt = BlockContext::new(16);
        engine.process_block(&mut backend, &mut ctxt).unwrap();

        assert_eq!(cv.read(), (ControlScalar::Float(0.25), 1));
    }

    #[test]
    fn test_block_size_change_applies_to_next_program() {
        let engine = engine(256);
        let mut spec = Spec::new();
        spec.append_buffer("out_l", BufferKind::Audio).unwrap();
        spec.op_end();
        engine.set_spec(spec).unwrap();

        engine.set_block_size(512);
        let mut spec = Spec::new();
        spec.append_buffer("out_l", BufferKind::Audio).unwrap();
        spec.op_end();
        engine.set_spec(spec).unwrap();

        let mut backend = NullBackend::new();
        backend.setup(engine.host()).unwrap();
        let mut ctxt = BlockContext::new(256);
        engine.process_block(&mut backend, &mut ctxt).unwrap();
        assert_eq!(ctxt.block_size, 512);
    }
}
