//! End-to-end engine scenarios over the null backend.

use ostinato::prelude::*;
use ostinato::{Backend as _, BlockContext, ControlScalar, ProcessorCore, Result};
use std::sync::Arc;

fn host(sample_rate: u32, block_size: u32) -> Arc<HostSystem> {
    Arc::new(HostSystem::new(sample_rate, block_size))
}

fn null_backend(engine: &Engine) -> NullBackend {
    let mut backend = NullBackend::new();
    backend.setup(engine.host()).unwrap();
    backend
}

/// Test-only source node: fills its single audio output with a constant.
struct ConstSource {
    core: ProcessorCore,
    value: f32,
}

impl ConstSource {
    fn new(host: Arc<HostSystem>, value: f32) -> Self {
        let mut spec = ProcessorSpec::new();
        spec.add_port(PortSpec::new("out", BufferKind::Audio, PortDirection::Output))
            .unwrap();
        let mut core = ProcessorCore::new("const-source", host);
        core.setup(spec).unwrap();
        Self { core, value }
    }
}

impl Processor for ConstSource {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn run(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        self.core.begin_run()?;
        let out = self.core.buffer(0)?;
        out.samples_mut()[..ctxt.block_size as usize].fill(self.value);
        Ok(())
    }
}

// An engine with no current program emits exactly one silent
// begin/end cycle per block and no output calls.
#[test]
fn test_silent_block_without_program() {
    let engine = Engine::new(host(48_000, 256));
    let mut backend = null_backend(&engine);
    let mut ctxt = BlockContext::new(256);

    engine.process_block(&mut backend, &mut ctxt).unwrap();

    assert_eq!(backend.begin_blocks(), 1);
    assert_eq!(backend.end_blocks(), 1);
    assert_eq!(backend.outputs(), 0);
}

// A single sine generator routed to "left" produces the expected
// samples for a 440 Hz tone at 48 kHz.
#[test]
fn test_single_sine_processor() {
    let engine = Engine::new(host(48_000, 64));
    let mut spec = Spec::new();
    spec.append_buffer("out_l", BufferKind::Audio).unwrap();
    spec.op_sine("out_l", 440.0).unwrap();
    spec.op_output("out_l", "left").unwrap();
    spec.op_end();
    engine.set_spec(spec).unwrap();

    let mut backend = null_backend(&engine);
    let mut ctxt = BlockContext::new(64);
    engine.process_block(&mut backend, &mut ctxt).unwrap();

    let left = backend.channel("left").unwrap();
    assert_eq!(left.len(), 64);
    assert!(left[0].abs() < 1e-5);
    assert!((left[1] - 0.05758).abs() < 1e-4);
    for (n, sample) in left.iter().enumerate() {
        let expected = (2.0 * std::f64::consts::PI * 440.0 * n as f64 / 48_000.0).sin() as f32;
        assert!(
            (sample - expected).abs() < 1e-5,
            "sample {n}: got {sample}, expected {expected}"
        );
    }
}

// Live code swap: a gain unit fed a constant 0.5 outputs 0.5 under the
// initial orchestra, and 0.125 from the first block after the control
// thread swaps in a gain of 0.25.
#[test]
fn test_live_code_swap() {
    let host = host(48_000, 64);
    let engine = Engine::new(host.clone());

    let source = engine
        .add_processor(Box::new(ConstSource::new(host.clone(), 0.5)))
        .unwrap();

    let mut port_spec = ProcessorSpec::new();
    port_spec
        .add_port(PortSpec::new("in", BufferKind::Audio, PortDirection::Input))
        .unwrap();
    port_spec
        .add_port(PortSpec::new("out", BufferKind::Audio, PortDirection::Output))
        .unwrap();
    let (gain, gain_handle) =
        LiveCodeProcessor::new("gain", host.clone(), port_spec).unwrap();
    let gain = engine.add_processor(Box::new(gain)).unwrap();

    gain_handle.set_code("out out = in * 1.0", "").unwrap();

    let mut spec = Spec::new();
    spec.append_buffer("mid", BufferKind::Audio).unwrap();
    spec.append_buffer("out_l", BufferKind::Audio).unwrap();
    spec.append_processor(source.clone());
    spec.append_processor(gain.clone());
    spec.op_connect_port(source.id(), 0, "mid").unwrap();
    spec.op_connect_port(gain.id(), 0, "mid").unwrap();
    spec.op_connect_port(gain.id(), 1, "out_l").unwrap();
    spec.op_call(source.id()).unwrap();
    spec.op_call(gain.id()).unwrap();
    spec.op_output("out_l", "left").unwrap();
    spec.op_end();
    engine.set_spec(spec).unwrap();

    let mut backend = null_backend(&engine);
    let mut ctxt = BlockContext::new(64);

    for block in 0..10 {
        engine.process_block(&mut backend, &mut ctxt).unwrap();
        let left = backend.channel("left").unwrap();
        assert!(
            left.iter().all(|&s| (s - 0.5).abs() < 1e-6),
            "block {block} not at unity gain"
        );
    }

    gain_handle.set_code("out out = in * 0.25", "").unwrap();

    engine.process_block(&mut backend, &mut ctxt).unwrap();
    let left = backend.channel("left").unwrap();
    assert!(left.iter().all(|&s| (s - 0.125).abs() < 1e-6));

    // The displaced instance is reclaimed by the next publish.
    gain_handle.set_code("out out = in * 1.0", "").unwrap();
    engine.process_block(&mut backend, &mut ctxt).unwrap();
    let left = backend.channel("left").unwrap();
    assert!(left.iter().all(|&s| (s - 0.5).abs() < 1e-6));
}

// Writing the same channel twice fails the second write but the block
// still finishes cleanly with the first write's data.
#[test]
fn test_duplicate_channel_keeps_first_write() {
    let engine = Engine::new(host(48_000, 32));
    let mut spec = Spec::new();
    spec.append_buffer("a", BufferKind::Audio).unwrap();
    spec.append_buffer("b", BufferKind::Audio).unwrap();
    spec.op_sine("a", 440.0).unwrap();
    spec.op_output("a", "left").unwrap();
    spec.op_output("b", "left").unwrap();
    spec.op_output("a", "right").unwrap();
    spec.op_end();
    engine.set_spec(spec).unwrap();

    let mut backend = null_backend(&engine);
    let mut ctxt = BlockContext::new(32);
    engine.process_block(&mut backend, &mut ctxt).unwrap();

    assert_eq!(backend.end_blocks(), 1);
    let left = backend.channel("left").unwrap();
    // First write (the sine) survived; buffer "b" is silence.
    assert!((left[1] - 0.05758).abs() < 1e-4);
    // The opcode failure skipped the rest of the block, so "right" was
    // never written.
    assert!(backend.channel("right").is_none());
}

// Control value updates land between blocks with strictly increasing
// generations.
#[test]
fn test_control_value_generations() {
    let engine = Engine::new(host(48_000, 16));
    let cv = engine
        .add_control_value(ControlValue::float("gain", 1.0))
        .unwrap();

    let mut spec = Spec::new();
    spec.append_buffer("gain_k", BufferKind::KRateControl).unwrap();
    spec.append_control_value(cv.clone());
    spec.op_fetch_control_value("gain", "gain_k").unwrap();
    spec.op_end();
    engine.set_spec(spec).unwrap();

    let mut backend = null_backend(&engine);
    let mut ctxt = BlockContext::new(16);

    for i in 0u32..5 {
        engine.set_float_control_value("gain", i as f32 / 10.0).unwrap();
        engine.process_block(&mut backend, &mut ctxt).unwrap();
        let (value, generation) = cv.read();
        assert_eq!(value, ControlScalar::Float(i as f32 / 10.0));
        assert_eq!(generation, i + 1);
    }
}

// The builder runs the block loop on its own audio thread and shuts
// down cleanly.
#[test]
fn test_builder_null_backend_lifecycle() {
    let handle = EngineBuilder::new()
        .sample_rate(48_000)
        .block_size(128)
        .null()
        .build()
        .unwrap();

    let mut spec = Spec::new();
    spec.append_buffer("out_l", BufferKind::Audio).unwrap();
    spec.op_sine("out_l", 220.0).unwrap();
    spec.op_output("out_l", "left").unwrap();
    spec.op_end();
    handle.engine().set_spec(spec).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    handle.run_maintenance();
    handle.shutdown();
}
