//! Engine construction and the audio-thread block loop.

use ostinato_core::{Backend, BlockContext, Engine, Error, HostSystem, NullBackend, Result};
use ostinato_io::{CpalBackend, IpcBackend};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Output path selection.
#[derive(Debug, Clone, Default)]
pub enum BackendConfig {
    /// Default audio device via cpal.
    #[default]
    Device,
    /// Serve block frames to a peer process over a named-pipe pair.
    Ipc { address: PathBuf },
    /// Discard output; headless operation and tests.
    Null,
}

/// Builder for a running engine.
///
/// # Example
/// ```no_run
/// use ostinato::EngineBuilder;
///
/// let handle = EngineBuilder::new()
///     .sample_rate(48_000)
///     .block_size(256)
///     .build()?;
/// # Ok::<(), ostinato::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct EngineBuilder {
    sample_rate: Option<u32>,
    block_size: Option<u32>,
    backend: BackendConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Device output (the default).
    pub fn device(self) -> Self {
        self.backend(BackendConfig::Device)
    }

    /// IPC output at the given FIFO address.
    pub fn ipc(self, address: impl Into<PathBuf>) -> Self {
        self.backend(BackendConfig::Ipc {
            address: address.into(),
        })
    }

    /// Null output.
    pub fn null(self) -> Self {
        self.backend(BackendConfig::Null)
    }

    /// Set up the backend and start the audio thread.
    pub fn build(self) -> Result<EngineHandle> {
        let host = Arc::new(HostSystem::new(
            self.sample_rate.unwrap_or(44_100),
            self.block_size.unwrap_or(256),
        ));
        let engine = Arc::new(Engine::new(host.clone()));

        let mut backend: Box<dyn Backend> = match self.backend {
            BackendConfig::Device => Box::new(CpalBackend::new()),
            BackendConfig::Ipc { address } => Box::new(IpcBackend::new(address)),
            BackendConfig::Null => Box::new(NullBackend::new()),
        };
        backend.setup(&host)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let engine = engine.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("ostinato-audio".to_string())
                .spawn(move || run_block_loop(&engine, backend, &stop))?
        };

        Ok(EngineHandle {
            engine,
            stop,
            thread: Some(thread),
        })
    }
}

fn run_block_loop(engine: &Engine, mut backend: Box<dyn Backend>, stop: &AtomicBool) {
    let mut ctxt = BlockContext::new(engine.host().block_size());
    while !stop.load(Ordering::Acquire) {
        match engine.process_block(backend.as_mut(), &mut ctxt) {
            Ok(()) => {
                // Without a program the backend imposes no pacing; avoid
                // spinning until one arrives.
                if !engine.has_current_program() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Err(Error::ConnectionClosed) => {
                tracing::info!("backend connection closed, stopping");
                break;
            }
            Err(err) => {
                tracing::warn!(%err, "block failed");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    backend.cleanup();
}

/// A running engine: control-plane access plus audio-thread lifecycle.
pub struct EngineHandle {
    engine: Arc<Engine>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Reclaim programs the audio thread has retired. Call periodically
    /// from the control thread.
    pub fn run_maintenance(&self) {
        self.engine.run_maintenance();
    }

    /// Stop the audio thread and tear the backend down.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("audio thread panicked");
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
