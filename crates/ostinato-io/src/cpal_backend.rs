//! Device output backend built on cpal.
//!
//! The engine thread stages "left"/"right" into per-channel buffers,
//! interleaves them at `end_block` and pushes the frames into an SPSC
//! ring drained by the device callback. `end_block` waits for ring space,
//! which paces the engine to the device clock. The callback itself never
//! blocks; it zero-fills on underrun.

use crate::midi::MidiBridge;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ostinato_core::{Backend, BlockContext, Error, HostSystem, Result};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::time::Duration;

const NUM_CHANNELS: usize = 2;
/// Ring capacity in blocks; bounds the extra output latency.
const RING_BLOCKS: usize = 4;

fn channel_index(channel: &str) -> Result<usize> {
    match channel {
        "left" => Ok(0),
        "right" => Ok(1),
        other => Err(Error::invalid_argument(format!("invalid channel '{other}'"))),
    }
}

/// Wrapper to hold `cpal::Stream` in a `Send` context.
///
/// # Safety
/// `cpal::Stream` is `!Send` due to platform internals. The stream is
/// created and dropped on the engine thread and never touched elsewhere.
struct StreamHandle(#[allow(dead_code)] cpal::Stream);

unsafe impl Send for StreamHandle {}

pub struct CpalBackend {
    stream: Option<StreamHandle>,
    producer: Option<HeapProd<f32>>,
    midi: Option<MidiBridge>,
    block_size: u32,
    pending_block_size: Option<u32>,
    host: Option<Arc<HostSystem>>,
    samples: [Vec<f32>; NUM_CHANNELS],
    written: [bool; NUM_CHANNELS],
    interleaved: Vec<f32>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            stream: None,
            producer: None,
            midi: None,
            block_size: 0,
            pending_block_size: None,
            host: None,
            samples: [Vec::new(), Vec::new()],
            written: [false; NUM_CHANNELS],
            interleaved: Vec::new(),
        }
    }

    fn resize_channels(&mut self, block_size: u32) {
        self.block_size = block_size;
        for samples in &mut self.samples {
            samples.clear();
            samples.resize(block_size as usize, 0.0);
        }
        self.interleaved.clear();
        self.interleaved
            .resize(block_size as usize * NUM_CHANNELS, 0.0);
    }

    fn build_stream(
        device: &cpal::Device,
        sample_rate: u32,
        block_size: u32,
        mut consumer: HeapCons<f32>,
    ) -> Result<cpal::Stream> {
        let config = cpal::StreamConfig {
            channels: NUM_CHANNELS as cpal::ChannelCount,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(block_size),
        };

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let got = consumer.pop_slice(data);
                    if got < data.len() {
                        data[got..].fill(0.0);
                    }
                },
                |err| tracing::error!(%err, "output stream error"),
                None,
            )
            .map_err(|e| Error::Backend(e.to_string()))
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpalBackend {
    fn setup(&mut self, host: &Arc<HostSystem>) -> Result<()> {
        let block_size = host.block_size();
        if block_size == 0 {
            return Err(Error::invalid_argument("invalid block size 0".to_string()));
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Backend("no output device available".to_string()))?;
        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            "opening output device"
        );

        let ring = HeapRb::<f32>::new(block_size as usize * NUM_CHANNELS * RING_BLOCKS);
        let (producer, consumer) = ring.split();

        let stream = Self::build_stream(&device, host.sample_rate(), block_size, consumer)?;
        stream.play().map_err(|e| Error::Backend(e.to_string()))?;

        self.stream = Some(StreamHandle(stream));
        self.producer = Some(producer);
        self.midi = MidiBridge::start("ostinato");
        self.host = Some(host.clone());
        self.resize_channels(block_size);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut midi) = self.midi.take() {
            midi.stop();
        }
        self.stream = None;
        self.producer = None;
        self.host = None;
    }

    fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        self.pending_block_size = Some(block_size);
        Ok(())
    }

    fn begin_block(&mut self, ctxt: &mut BlockContext) -> Result<()> {
        if let Some(block_size) = self.pending_block_size.take() {
            self.resize_channels(block_size);
            if let Some(host) = &self.host {
                host.set_block_size(block_size);
            }
        }

        for samples in &mut self.samples {
            samples.fill(0.0);
        }
        self.written = [false; NUM_CHANNELS];

        ctxt.input_events.clear();
        let sample_rate = self
            .host
            .as_ref()
            .map(|host| host.sample_rate())
            .unwrap_or(44_100);
        if let Some(midi) = &mut self.midi {
            midi.drain_into(sample_rate, self.block_size, &mut ctxt.input_events);
        }
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
        Ok(())
    }

    fn end_block(&mut self, _ctxt: &mut BlockContext) -> Result<()> {
        let frames = self.block_size as usize;
        for i in 0..frames {
            self.interleaved[i * 2] = self.samples[0][i];
            self.interleaved[i * 2 + 1] = self.samples[1][i];
        }

        let producer = self
            .producer
            .as_mut()
            .ok_or_else(|| Error::invalid_state("device backend not set up".to_string()))?;

        // Pace the engine: wait until the callback has drained one
        // block's worth of space.
        let needed = self.interleaved.len();
        while producer.vacant_len() < needed {
            std::thread::sleep(Duration::from_micros(500));
        }
        producer.push_slice(&self.interleaved);
        Ok(())
    }
}
