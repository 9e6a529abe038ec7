//! Processor model: port/parameter shapes, the `Processor` trait and the
//! shared per-processor state concrete processors embed.

use crate::block_context::BlockContext;
use crate::buffers::{BufferKind, BufferPtr};
use crate::host::HostSystem;
use crate::{Error, Result};
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Static shape of one processor port.
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub name: String,
    pub kind: BufferKind,
    pub direction: PortDirection,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, kind: BufferKind, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            kind,
            direction,
        }
    }
}

/// Typed parameter declaration with its default.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSpec {
    String { default: String },
    Int { default: i64 },
    Float { default: f32 },
}

/// Static shape (ports and parameters) of a processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorSpec {
    ports: Vec<PortSpec>,
    parameters: HashMap<String, ParameterSpec>,
}

impl ProcessorSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a port. Duplicate names are rejected.
    pub fn add_port(&mut self, port: PortSpec) -> Result<()> {
        if self.ports.iter().any(|p| p.name == port.name) {
            return Err(Error::invalid_argument(format!(
                "duplicate port name '{}'",
                port.name
            )));
        }
        self.ports.push(port);
        Ok(())
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn get_port(&self, idx: usize) -> Result<&PortSpec> {
        self.ports
            .get(idx)
            .ok_or_else(|| Error::invalid_argument(format!("invalid port index {idx}")))
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortSpec> {
        self.ports.iter()
    }

    pub fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, spec: ParameterSpec) -> Result<()> {
        let name = name.into();
        if self.parameters.contains_key(&name) {
            return Err(Error::invalid_argument(format!(
                "duplicate parameter name '{name}'"
            )));
        }
        self.parameters.insert(name, spec);
        Ok(())
    }

    pub fn get_parameter(&self, name: &str) -> Result<&ParameterSpec> {
        self.parameters
            .get(name)
            .ok_or_else(|| Error::invalid_argument(format!("unknown parameter '{name}'")))
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&String, &ParameterSpec)> {
        self.parameters.iter()
    }
}

/// Lifecycle state of a processor. Transitions out of `CleanedUp` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    SetUp,
    Running,
    Idle,
    CleanedUp,
}

/// Shared per-processor state. Concrete processors embed one and expose
/// it through [`Processor::core`].
#[derive(Debug)]
pub struct ProcessorCore {
    id: u64,
    node_id: String,
    host: Arc<HostSystem>,
    spec: Option<ProcessorSpec>,
    buffers: SmallVec<[Option<BufferPtr>; 8]>,
    string_params: HashMap<String, String>,
    int_params: HashMap<String, i64>,
    float_params: HashMap<String, f32>,
    state: ProcessorState,
}

impl ProcessorCore {
    pub fn new(node_id: impl Into<String>, host: Arc<HostSystem>) -> Self {
        Self {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            node_id: node_id.into(),
            host,
            spec: None,
            buffers: SmallVec::new(),
            string_params: HashMap::new(),
            int_params: HashMap::new(),
            float_params: HashMap::new(),
            state: ProcessorState::Created,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn host(&self) -> &Arc<HostSystem> {
        &self.host
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn spec(&self) -> Result<&ProcessorSpec> {
        self.spec
            .as_ref()
            .ok_or_else(|| Error::invalid_state(format!("processor '{}' not set up", self.node_id)))
    }

    /// Take ownership of the spec and size the port table. Parameters
    /// start at their declared defaults.
    pub fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        if self.state != ProcessorState::Created {
            return Err(Error::invalid_state(format!(
                "processor '{}' set up twice",
                self.node_id
            )));
        }
        for (name, param) in spec.parameters() {
            match param {
                ParameterSpec::String { default } => {
                    self.string_params.insert(name.clone(), default.clone());
                }
                ParameterSpec::Int { default } => {
                    self.int_params.insert(name.clone(), *default);
                }
                ParameterSpec::Float { default } => {
                    self.float_params.insert(name.clone(), *default);
                }
            }
        }
        self.buffers = smallvec::smallvec![None; spec.num_ports()];
        self.spec = Some(spec);
        self.state = ProcessorState::SetUp;
        Ok(())
    }

    /// Release state. Idempotent.
    pub fn cleanup(&mut self) {
        if self.state == ProcessorState::CleanedUp {
            return;
        }
        self.buffers.clear();
        self.string_params.clear();
        self.int_params.clear();
        self.float_params.clear();
        self.spec = None;
        self.state = ProcessorState::CleanedUp;
    }

    pub fn connect_port(&mut self, port_idx: u32, buf: BufferPtr) -> Result<()> {
        let idx = port_idx as usize;
        if idx >= self.buffers.len() {
            return Err(Error::invalid_argument(format!(
                "invalid port index {port_idx} on '{}'",
                self.node_id
            )));
        }
        self.buffers[idx] = Some(buf);
        Ok(())
    }

    pub fn buffer(&self, port_idx: usize) -> Result<BufferPtr> {
        self.buffers
            .get(port_idx)
            .copied()
            .flatten()
            .ok_or_else(|| {
                Error::invalid_state(format!(
                    "port {port_idx} of '{}' not connected",
                    self.node_id
                ))
            })
    }

    /// Verify every declared port is connected and mark the processor
    /// running. Call at the top of `run`.
    pub fn begin_run(&mut self) -> Result<()> {
        match self.state {
            ProcessorState::SetUp | ProcessorState::Idle | ProcessorState::Running => {}
            _ => {
                return Err(Error::invalid_state(format!(
                    "run on processor '{}' out of lifecycle",
                    self.node_id
                )))
            }
        }
        for idx in 0..self.buffers.len() {
            if self.buffers[idx].is_none() {
                return Err(Error::invalid_state(format!(
                    "port {idx} of '{}' not connected",
                    self.node_id
                )));
            }
        }
        self.state = ProcessorState::Running;
        Ok(())
    }

    pub fn set_idle(&mut self) {
        if self.state == ProcessorState::Running {
            self.state = ProcessorState::Idle;
        }
    }

    fn check_declared(&self, name: &str, want: fn(&ParameterSpec) -> bool) -> Result<()> {
        let spec = self.spec()?;
        let param = spec.get_parameter(name)?;
        if !want(param) {
            return Err(Error::invalid_argument(format!(
                "parameter '{name}' accessed with mismatched type"
            )));
        }
        Ok(())
    }

    pub fn set_string_parameter(&mut self, name: &str, value: String) -> Result<()> {
        self.check_declared(name, |p| matches!(p, ParameterSpec::String { .. }))?;
        self.string_params.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_string_parameter(&self, name: &str) -> Result<&str> {
        self.check_declared(name, |p| matches!(p, ParameterSpec::String { .. }))?;
        Ok(self.string_params.get(name).map(String::as_str).unwrap_or(""))
    }

    pub fn set_int_parameter(&mut self, name: &str, value: i64) -> Result<()> {
        self.check_declared(name, |p| matches!(p, ParameterSpec::Int { .. }))?;
        self.int_params.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_int_parameter(&self, name: &str) -> Result<i64> {
        self.check_declared(name, |p| matches!(p, ParameterSpec::Int { .. }))?;
        Ok(self.int_params.get(name).copied().unwrap_or(0))
    }

    pub fn set_float_parameter(&mut self, name: &str, value: f32) -> Result<()> {
        self.check_declared(name, |p| matches!(p, ParameterSpec::Float { .. }))?;
        self.float_params.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_float_parameter(&self, name: &str) -> Result<f32> {
        self.check_declared(name, |p| matches!(p, ParameterSpec::Float { .. }))?;
        Ok(self.float_params.get(name).copied().unwrap_or(0.0))
    }

    /// Zero every connected output buffer.
    pub fn clear_outputs(&self, block_size: u32) -> Result<()> {
        let spec = self.spec()?;
        for idx in 0..spec.num_ports() {
            let port = spec.get_port(idx)?;
            if port.direction != PortDirection::Output {
                continue;
            }
            let buf = self.buffer(idx)?;
            match port.kind {
                BufferKind::Audio | BufferKind::ARateControl => {
                    buf.samples_mut()[..block_size as usize].fill(0.0);
                }
                BufferKind::KRateControl => buf.samples_mut()[0] = 0.0,
                BufferKind::Events => buf.clear(),
            }
        }
        Ok(())
    }
}

/// A signal-processing node. Lifecycle and per-block contract:
/// `setup` once, `connect_port` for every port, then `run` once per block.
/// `run` must not allocate, take locks or block.
pub trait Processor: Send {
    fn core(&self) -> &ProcessorCore;
    fn core_mut(&mut self) -> &mut ProcessorCore;

    fn setup(&mut self, spec: ProcessorSpec) -> Result<()> {
        self.core_mut().setup(spec)
    }

    fn cleanup(&mut self) {
        self.core_mut().cleanup();
    }

    fn connect_port(&mut self, port_idx: u32, buf: BufferPtr) -> Result<()> {
        self.core_mut().connect_port(port_idx, buf)
    }

    fn run(&mut self, ctxt: &mut BlockContext) -> Result<()>;
}

/// Engine-owned container for a registered processor.
///
/// The control plane moves a fully configured processor in here; from then
/// on the boxed value is touched exclusively by the audio thread, which
/// obtains `&mut` access through [`ProcessorCell::get_mut`].
pub struct ProcessorCell {
    id: u64,
    node_id: String,
    inner: UnsafeCell<Box<dyn Processor>>,
}

// SAFETY: after registration the inner processor is only accessed from the
// audio thread (init opcodes and `run`); the control plane reaches live
// processors only through dedicated lock-free handles.
unsafe impl Send for ProcessorCell {}
unsafe impl Sync for ProcessorCell {}

impl ProcessorCell {
    pub fn new(processor: Box<dyn Processor>) -> Arc<Self> {
        let id = processor.core().id();
        let node_id = processor.core().node_id().to_string();
        Arc::new(Self {
            id,
            node_id,
            inner: UnsafeCell::new(processor),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Exclusive access to the processor.
    ///
    /// # Safety
    /// Audio thread only, and never while another reference from a
    /// previous call is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self) -> &mut dyn Processor {
        (*self.inner.get()).as_mut()
    }

    /// Exclusive access for the control plane while the processor is not
    /// yet referenced by any published program.
    ///
    /// # Safety
    /// Caller must guarantee no program referencing this cell is live.
    pub unsafe fn get_mut_unregistered(&self) -> &mut dyn Processor {
        (*self.inner.get()).as_mut()
    }
}

impl std::fmt::Debug for ProcessorCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorCell")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn host() -> Arc<HostSystem> {
        Arc::new(HostSystem::new(48_000, 64))
    }

    fn stereo_spec() -> ProcessorSpec {
        let mut spec = ProcessorSpec::new();
        spec.add_port(PortSpec::new("in", BufferKind::Audio, PortDirection::Input))
            .unwrap();
        spec.add_port(PortSpec::new("out", BufferKind::Audio, PortDirection::Output))
            .unwrap();
        spec.add_parameter("gain", ParameterSpec::Float { default: 1.0 })
            .unwrap();
        spec
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut spec = ProcessorSpec::new();
        spec.add_port(PortSpec::new("in", BufferKind::Audio, PortDirection::Input))
            .unwrap();
        assert!(spec
            .add_port(PortSpec::new("in", BufferKind::Audio, PortDirection::Output))
            .is_err());
    }

    #[test]
    fn test_parameter_defaults_and_types() {
        let mut core = ProcessorCore::new("node", host());
        core.setup(stereo_spec()).unwrap();
        assert_eq!(core.get_float_parameter("gain").unwrap(), 1.0);
        core.set_float_parameter("gain", 0.5).unwrap();
        assert_eq!(core.get_float_parameter("gain").unwrap(), 0.5);
        assert!(core.get_int_parameter("gain").is_err());
        assert!(core.get_float_parameter("missing").is_err());
    }

    #[test]
    fn test_lifecycle() {
        let mut core = ProcessorCore::new("node", host());
        assert!(core.begin_run().is_err());
        core.setup(stereo_spec()).unwrap();
        assert_eq!(core.state(), ProcessorState::SetUp);
        // Ports not connected yet.
        assert!(core.begin_run().is_err());
        assert!(core.connect_port(7, crate::Buffer::new(BufferKind::Audio, 64).ptr()).is_err());
        core.cleanup();
        core.cleanup(); // idempotent
        assert_eq!(core.state(), ProcessorState::CleanedUp);
        assert!(core.spec().is_err());
    }

    proptest! {
        // Ports come back in insertion order and num_ports matches.
        #[test]
        fn prop_port_insertion_order(names in proptest::collection::hash_set("[a-z]{1,8}", 0..16)) {
            let names: Vec<String> = names.into_iter().collect();
            let mut spec = ProcessorSpec::new();
            for name in &names {
                spec.add_port(PortSpec::new(name.clone(), BufferKind::Audio, PortDirection::Input)).unwrap();
            }
            prop_assert_eq!(spec.num_ports(), names.len());
            for (i, name) in names.iter().enumerate() {
                prop_assert_eq!(&spec.get_port(i).unwrap().name, name);
            }
            prop_assert!(spec.get_port(names.len()).is_err());
        }
    }
}
