//! Wire records carried inside each IPC frame.
//!
//! Both peers must agree on the encoding byte for byte; bincode with its
//! default (little-endian, fixed-width) configuration is the contract.

use ostinato_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// One named buffer payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBuffer {
    pub id: String,
    pub data: Vec<u8>,
}

impl BlockBuffer {
    pub fn from_samples(id: impl Into<String>, samples: &[f32]) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 4);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn samples(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }
}

/// Block request/response payload. `messages` and `perf_data` are opaque
/// to the engine and round-tripped unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub block_size: u32,
    pub sample_pos: u64,
    pub buffers: Vec<BlockBuffer>,
    pub messages: Vec<Vec<u8>>,
    pub perf_data: Vec<u8>,
}

impl BlockData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::BadFrame(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::BadFrame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let block = BlockData {
            block_size: 128,
            sample_pos: 1000,
            buffers: vec![BlockBuffer::from_samples("in_l", &[1.0; 128])],
            messages: vec![vec![1, 2, 3]],
            perf_data: Vec::new(),
        };
        let decoded = BlockData::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.buffers[0].samples(), vec![1.0; 128]);
    }

    #[test]
    fn test_decode_garbage_is_bad_frame() {
        assert!(matches!(
            BlockData::decode(&[0xff; 3]),
            Err(Error::BadFrame(_))
        ));
    }
}
