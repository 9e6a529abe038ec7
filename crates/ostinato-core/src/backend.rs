//! Output backends: the sink (and optional source) for block audio.

use crate::block_context::BlockContext;
use crate::host::HostSystem;
use crate::{Error, Result};
use std::sync::Arc;

/// A block sink. The engine drives one `begin_block` / `output`* /
/// `end_block` cycle per block. Channels are strings, at minimum
/// `"left"` and `"right"`; each channel may be written at most once per
/// block.
pub trait Backend: Send {
    fn setup(&mut self, host: &Arc<HostSystem>) -> Result<()>;

    fn cleanup(&mut self);

    /// Request a new block size, applied at the backend's discretion
    /// between blocks.
    fn set_block_size(&mut self, block_size: u32) -> Result<()>;

    fn begin_block(&mut self, ctxt: &mut BlockContext) -> Result<()>;

    fn output(&mut self, ctxt: &mut BlockContext, channel: &str, samples: &[f32]) -> Result<()>;

    fn end_block(&mut self, ctxt: &mut BlockContext) -> Result<()>;
}

/// Backend that discards its output. Used headless and in tests, so it
/// captures the last block written per channel and counts the cycle
/// calls.
#[derive(Debug, Default)]
pub struct NullBackend {
    host: Option<Arc<HostSystem>>,
    pending_block_size: Option<u32>,
    channels: Vec<(String, Vec<f32>)>,
    written: Vec<String>,
    begin_blocks: u64,
    end_blocks: u64,
    outputs: u64,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_blocks(&self) -> u64 {
        self.begin_blocks
    }

    pub fn end_blocks(&self) -> u64 {
        self.end_blocks
    }

    pub fn outputs(&self) -> u64 {
        self.outputs
    }

    /// Samples captured for `channel` in the most recent block.
    pub fn channel(&self, channel: &str) -> Option<&[f32]> {
        self.channels
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, samples)| samples.as_slice())
    }
}

impl Backend for NullBackend {
    fn setup(&mut self, host: &Arc<HostSystem>) -> Result<()> {
        self.host = Some(host.clone());
        Ok(())
    }

    fn cleanup(&mut self) {
        self.host = None;
        self.channels.clear();
    }

    fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        self.pending_block_size = Some(block_size);
        Ok(())
    }

    fn begin_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
        if let Some(block_size) = self.pending_block_size.take() {
            if let Some(host) = &self.host {
                host.set_block_size(block_size);
            }
        }
        self.written.clear();
        self.begin_blocks += 1;
        Ok(())
    }

    fn output(&mut self, _ctxt: &mut BlockContext, channel: &str, samples: &[f32]) -> Result<()> {
        if self.written.iter().any(|c| c == channel) {
            return Err(Error::DuplicateChannel(channel.to_string()));
        }
        self.written.push(channel.to_string());
        self.outputs += 1;
        match self.channels.iter_mut().find(|(name, _)| name == channel) {
            Some((_, stored)) => {
                stored.clear();
                stored.extend_from_slice(samples);
            }
            None => self.channels.push((channel.to_string(), samples.to_vec())),
        }
        Ok(())
    }

    fn end_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
        self.end_blocks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_backend_captures_and_counts() {
        let host = Arc::new(HostSystem::new(48_000, 256));
        let mut backend = NullBackend::new();
        backend.setup(&host).unwrap();

        let mut ctxt = BlockContext::new(256);
        backend.begin_block(&mut ctxt).unwrap();
        backend.output(&mut ctxt, "left", &[0.5; 4]).unwrap();
        assert!(matches!(
            backend.output(&mut ctxt, "left", &[0.1; 4]),
            Err(Error::DuplicateChannel(_))
        ));
        backend.end_block(&mut ctxt).unwrap();

        assert_eq!(backend.begin_blocks(), 1);
        assert_eq!(backend.end_blocks(), 1);
        // The duplicate write did not replace the first one.
        assert_eq!(backend.channel("left").unwrap(), &[0.5; 4]);
    }

    #[test]
    fn test_pending_block_size_applied_on_begin() {
        let host = Arc::new(HostSystem::new(48_000, 256));
        let mut backend = NullBackend::new();
        backend.setup(&host).unwrap();
        backend.set_block_size(512).unwrap();
        assert_eq!(host.block_size(), 256);
        let mut ctxt = BlockContext::new(256);
        backend.begin_block(&mut ctxt).unwrap();
        assert_eq!(host.block_size(), 512);
    }
}
