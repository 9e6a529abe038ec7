//! # ostinato-io
//!
//! Output paths for the ostinato engine: a cpal device backend with a
//! MIDI input bridge, and an IPC backend speaking framed [`BlockData`]
//! records over a named-pipe pair.

mod audio_stream;
mod block_data;
mod cpal_backend;
mod ipc_backend;
mod midi;

pub use audio_stream::{AudioStream, StreamCloser, BLOCK_START_MAGIC, CLOSE_MAGIC, MAX_PAYLOAD};
pub use block_data::{BlockBuffer, BlockData};
pub use cpal_backend::CpalBackend;
pub use ipc_backend::IpcBackend;
