//! A processor whose program text can be replaced while the audio thread
//! keeps running.
//!
//! Compiled instances move from the control thread to the audio thread
//! through a [`TripleSlot`]: `set_code` (on the [`LiveCodeHandle`]) drains
//! stale slots, compiles a fresh instance and publishes it; `run` rotates
//! it in at the top of the block. Until a first instance arrives, `run`
//! zero-fills the output ports.

use crate::block_context::BlockContext;
use crate::buffers::BufferKind;
use crate::host::HostSystem;
use crate::processor::{PortDirection, Processor, ProcessorCore, ProcessorSpec};
use crate::slot::TripleSlot;
use crate::{Error, Result};
use std::sync::Arc;

/// How one output port is produced per block.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Route {
    /// `out <port> = <port> * <gain>`
    Gain { input: usize, gain: f32 },
    /// `out <port> = <literal>`
    Constant(f32),
}

/// A compiled orchestra: one optional route per port index.
#[derive(Debug)]
pub struct Instance {
    routes: Vec<Option<Route>>,
    /// Held for the lifetime of the instance; interpreted elsewhere.
    #[allow(dead_code)]
    score: String,
}

impl Instance {
    /// Compile orchestra text against the processor's port shape.
    ///
    /// Grammar, one statement per line (`#` starts a comment):
    /// `out <output-port> = <input-port> * <gain>` or
    /// `out <output-port> = <literal>`. Ports the orchestra does not
    /// mention are zero-filled every block.
    fn compile(orchestra: &str, score: &str, spec: &ProcessorSpec) -> Result<Self> {
        let mut routes = vec![None; spec.num_ports()];

        for (lineno, line) in orchestra.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let rest = line.strip_prefix("out ").ok_or_else(|| {
                Error::invalid_argument(format!("orchestra line {}: expected 'out'", lineno + 1))
            })?;
            let (target, expr) = rest.split_once('=').ok_or_else(|| {
                Error::invalid_argument(format!("orchestra line {}: expected '='", lineno + 1))
            })?;

            let target = target.trim();
            let out_idx = spec.port_index(target).ok_or_else(|| {
                Error::invalid_argument(format!("orchestra does not match port '{target}'"))
            })?;
            if spec.get_port(out_idx)?.direction != PortDirection::Output {
                return Err(Error::invalid_argument(format!(
                    "port '{target}' is not an output port"
                )));
            }

            let expr = expr.trim();
            let route = if let Some((input, gain)) = expr.split_once('*') {
                let input = input.trim();
                let in_idx = spec.port_index(input).ok_or_else(|| {
                    Error::invalid_argument(format!("orchestra does not match port '{input}'"))
                })?;
                if spec.get_port(in_idx)?.direction != PortDirection::Input {
                    return Err(Error::invalid_argument(format!(
                        "port '{input}' is not an input port"
                    )));
                }
                let gain: f32 = gain.trim().parse().map_err(|_| {
                    Error::invalid_argument(format!("orchestra line {}: bad gain", lineno + 1))
                })?;
                Route::Gain { input: in_idx, gain }
            } else {
                let value: f32 = expr.parse().map_err(|_| {
                    Error::invalid_argument(format!("orchestra line {}: bad literal", lineno + 1))
                })?;
                Route::Constant(value)
            };

            routes[out_idx] = Some(route);
        }

        Ok(Self {
            routes,
            score: score.to_string(),
        })
    }
}

/// Control-plane handle for swapping code on a live processor.
#[derive(Clone)]
pub struct LiveCodeHandle {
    slots: Arc<TripleSlot<Instance>>,
    spec: Arc<ProcessorSpec>,
}

impl LiveCodeHandle {
    /// Compile and publish a new instance. The previously published but
    /// unconsumed instance and the instance the audio thread has retired
    /// are destroyed here, on the control thread.
    pub fn set_code(&self, orchestra: &str, score: &str) -> Result<()> {
        let (stale, old) = self.slots.discard_stale();
        if stale.is_some() {
            tracing::debug!("discarded unconsumed instance");
        }
        drop(old);

        let instance = Instance::compile(orchestra, score, &self.spec)?;
        self.slots.publish(Box::new(instance));
        Ok(())
    }
}

/// Processor hosting swappable orchestra code.
pub struct LiveCodeProcessor {
    core: ProcessorCore,
    slots: Arc<TripleSlot<Instance>>,
}

impl LiveCodeProcessor {
    /// Build a processor with its port/parameter shape fixed up front,
    /// returning the control-plane handle alongside it.
    pub fn new(
        node_id: impl Into<String>,
        host: Arc<HostSystem>,
        spec: ProcessorSpec,
    ) -> Result<(Self, LiveCodeHandle)> {
        let mut core = ProcessorCore::new(node_id, host);
        core.setup(spec.clone())?;
        let slots = Arc::new(TripleSlot::new());
        let handle = LiveCodeHandle {
            slots: slots.clone(),
            spec: Arc::new(spec),
        };
        Ok((Self { core, slots }, handle))
    }

    fn apply(&self, instance: &Instance, ctxt: &BlockContext) -> Result<()> {
        let spec = self.core.spec()?;
        let block = ctxt.block_size as usize;
        for idx in 0..spec.num_ports() {
            let port = spec.get_port(idx)?;
            if port.direction != PortDirection::Output {
                continue;
            }
            let out = self.core.buffer(idx)?;
            match instance.routes[idx] {
                Some(Route::Gain { input, gain }) => {
                    let src = self.core.buffer(input)?;
                    match port.kind {
                        BufferKind::Audio | BufferKind::ARateControl => {
                            let dst = &mut out.samples_mut()[..block];
                            for (d, s) in dst.iter_mut().zip(&src.samples()[..block]) {
                                *d = s * gain;
                            }
                        }
                        BufferKind::KRateControl => {
                            out.samples_mut()[0] = src.samples()[0] * gain;
                        }
                        BufferKind::Events => out.clear(),
                    }
                }
                Some(Route::Constant(value)) => match port.kind {
                    BufferKind::Audio | BufferKind::ARateControl => {
                        out.samples_mut()[..block].fill(value);
                    }
                    BufferKind::KRateControl => out.samples_mut()[0] = value,
                    BufferKind::Events => out.clear(),
                },
                None => match port.kind {
                    BufferKind::Audio | BufferKind::ARateControl => {
                        out.samples_mut()[..block].fill(0.0);
                    }
                    BufferKind::KRateControl => out.samples_mut()[0] = 0.0,
                    BufferKind::Events => out.clear(),
                },
            }
        }
        Ok(())
    }
}

impl Processor for LiveCodeProcessor {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn cleanup(&mut self) {
        self.slots.drain();
        self.core.cleanup();
    }

    fn run(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        self.core.begin_run()?;

        self.slots.promote();

        match self.slots.current() {
            Some(instance) => self.apply(instance, ctxt),
            None => {
                // No code yet: just clear the output ports.
                self.core.clear_outputs(ctxt.block_size)
            }
        }
    }
}
