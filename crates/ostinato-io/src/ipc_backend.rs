//! Backend that exchanges block frames with a peer process.
//!
//! Each block is driven by the peer: `begin_block` waits for a request
//! frame carrying the block size and sample position, and `end_block`
//! answers with the channels the program wrote.

use crate::audio_stream::AudioStream;
use crate::block_data::{BlockBuffer, BlockData};
use ostinato_core::{Backend, BlockContext, Error, HostSystem, Result};
use std::path::PathBuf;
use std::sync::Arc;

const NUM_CHANNELS: usize = 2;

fn channel_index(channel: &str) -> Result<usize> {
    match channel {
        "left" => Ok(0),
        "right" => Ok(1),
        other => Err(Error::invalid_argument(format!("invalid channel '{other}'"))),
    }
}

pub struct IpcBackend {
    address: PathBuf,
    stream: Option<AudioStream>,
    host: Option<Arc<HostSystem>>,
    block_size: u32,
    sample_pos: u64,
    samples: [Vec<f32>; NUM_CHANNELS],
    written: [bool; NUM_CHANNELS],
}

impl IpcBackend {
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            stream: None,
            host: None,
            block_size: 0,
            sample_pos: 0,
            samples: [Vec::new(), Vec::new()],
            written: [false; NUM_CHANNELS],
        }
    }

    /// Handle for breaking a blocked `begin_block` from another thread.
    pub fn closer(&self) -> Option<crate::audio_stream::StreamCloser> {
        self.stream.as_ref().map(|s| s.closer())
    }

    fn stream_mut(&mut self) -> Result<&mut AudioStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::invalid_state("IPC backend not set up".to_string()))
    }

    fn resize_channels(&mut self, block_size: u32) {
        self.block_size = block_size;
        for samples in &mut self.samples {
            samples.clear();
            samples.resize(block_size as usize, 0.0);
        }
    }
}

impl Backend for IpcBackend {
    fn setup(&mut self, host: &Arc<HostSystem>) -> Result<()> {
        if self.address.as_os_str().is_empty() {
            return Err(Error::invalid_argument("ipc address not set".to_string()));
        }
        self.stream = Some(AudioStream::serve(&self.address)?);
        self.host = Some(host.clone());
        self.resize_channels(host.block_size());
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.cleanup();
        }
        self.host = None;
    }

    fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        // The peer dictates the block size; a local request just resizes
        // the staging buffers ahead of the next request frame.
        self.resize_channels(block_size);
        Ok(())
    }

    fn begin_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let request = self.stream_mut()?.receive_block()?;

        if request.block_size != self.block_size {
            tracing::info!(
                from = self.block_size,
                to = request.block_size,
                "block size changed by peer"
            );
            self.resize_channels(request.block_size);
            if let Some(host) = &self.host {
                host.set_block_size(request.block_size);
            }
        }

        ctxt.block_size = self.block_size;
        ctxt.sample_pos = request.sample_pos;
        self.sample_pos = request.sample_pos;

        // Messages and input buffers are opaque to the engine; only the
        // messages are surfaced, unchanged.
        ctxt.messages_in.clear();
        ctxt.messages_in.extend(request.messages);
        ctxt.input_events.clear();

        self.written = [false; NUM_CHANNELS];
        Ok(())
    }

    fn output(&mut self, _ctxt: &mut BlockContext, channel: &str, samples: &[f32]) -> Result<()> {
        let c = channel_index(channel)?;
        if self.written[c] {
            return Err(Error::DuplicateChannel(channel.to_string()));
        }
        self.written[c] = true;
        let staged = &mut self.samples[c];
        let n = samples.len().min(staged.len());
        staged[..n].copy_from_slice(&samples[..n]);
        staged[n..].fill(0.0);
        Ok(())
    }

    fn end_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        let mut response = BlockData {
            block_size: self.block_size,
            sample_pos: self.sample_pos,
            buffers: Vec::with_capacity(NUM_CHANNELS),
            messages: std::mem::take(&mut ctxt.messages_out),
            perf_data: Vec::new(),
        };

        let mut b = 0;
        for c in 0..NUM_CHANNELS {
            if self.written[c] {
                response
                    .buffers
                    .push(BlockBuffer::from_samples(format!("output:{b}"), &self.samples[c]));
                b += 1;
            }
        }

        self.stream_mut()?.send_block(&response)
    }
}
