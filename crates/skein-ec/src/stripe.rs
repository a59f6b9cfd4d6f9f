//! Per-stripe shard coding used by the streaming EC operators.
//!
//! A stripe is one `chunk_size` block from each of the `n` shards. The
//! streaming operators read one stripe worth of input shards, hand it to a
//! [`StripeCoder`] and write the requested output blocks.

use crate::decoder::recover_data;
use crate::encoder::encode_parity;
use crate::{ErasureConfig, Error, Result};

/// Stateless coder for fixed-size stripes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeCoder {
    config: ErasureConfig,
    chunk_size: usize,
}

impl StripeCoder {
    /// Create a coder for `chunk_size` bytes per shard per stripe.
    ///
    /// `chunk_size` must be positive and even.
    pub fn new(config: ErasureConfig, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "chunk size {} must be positive and even",
                chunk_size
            )));
        }
        Ok(Self { config, chunk_size })
    }

    /// Underlying shard layout
    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Bytes per shard per stripe
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes of object data carried by one stripe
    pub fn stripe_data_size(&self) -> usize {
        self.chunk_size * self.config.data_shards()
    }

    /// Validate a set of input shard indices.
    ///
    /// Reports [`Error::InsufficientShards`] first when fewer than `k`
    /// distinct in-range indices are given, then any out-of-range or repeated
    /// index.
    pub fn check_inputs(&self, indices: &[usize]) -> Result<()> {
        let total = self.config.total_shards();
        let mut seen = vec![false; total];
        let mut available = 0;
        for &index in indices {
            if index < total && !seen[index] {
                seen[index] = true;
                available += 1;
            }
        }
        if available < self.config.data_shards() {
            return Err(Error::InsufficientShards {
                available,
                required: self.config.data_shards(),
            });
        }
        check_unique(indices, total)
    }

    /// Validate a set of output shard indices
    pub fn check_outputs(&self, indices: &[usize]) -> Result<()> {
        check_unique(indices, self.config.total_shards())
    }

    /// Compute parity blocks for one stripe of `k` data blocks
    pub fn encode_parity<T: AsRef<[u8]>>(&self, data: &[T]) -> Result<Vec<Vec<u8>>> {
        for block in data {
            self.check_block(block.as_ref())?;
        }
        encode_parity(&self.config, data)
    }

    /// Recover the `k` data blocks of one stripe
    pub fn reconstruct_data(&self, inputs: &[(usize, &[u8])]) -> Result<Vec<Vec<u8>>> {
        let indices: Vec<usize> = inputs.iter().map(|(i, _)| *i).collect();
        self.check_inputs(&indices)?;
        for (_, block) in inputs {
            self.check_block(block)?;
        }
        recover_data(&self.config, inputs)
    }

    /// Produce the blocks for `outputs` (any shard indices) from one stripe of
    /// input blocks. Results are returned in `outputs` order.
    ///
    /// An output that is also an input is copied without decoding.
    pub fn reconstruct_some(
        &self,
        inputs: &[(usize, &[u8])],
        outputs: &[usize],
    ) -> Result<Vec<Vec<u8>>> {
        self.check_outputs(outputs)?;
        let indices: Vec<usize> = inputs.iter().map(|(i, _)| *i).collect();
        self.check_inputs(&indices)?;
        for (_, block) in inputs {
            self.check_block(block)?;
        }

        let lookup = |index: usize| {
            inputs
                .iter()
                .find(|(i, _)| *i == index)
                .map(|(_, block)| block.to_vec())
        };
        if outputs.iter().all(|o| indices.contains(o)) {
            return Ok(outputs.iter().filter_map(|o| lookup(*o)).collect());
        }

        let k = self.config.data_shards();
        let data = recover_data(&self.config, inputs)?;
        let parity = if outputs.iter().any(|o| *o >= k) {
            encode_parity(&self.config, &data)?
        } else {
            Vec::new()
        };

        Ok(outputs
            .iter()
            .map(|&o| match lookup(o) {
                Some(block) => block,
                None if o < k => data[o].clone(),
                None => parity[o - k].clone(),
            })
            .collect())
    }

    fn check_block(&self, block: &[u8]) -> Result<()> {
        if block.len() != self.chunk_size {
            return Err(Error::ShardSizeMismatch {
                expected: self.chunk_size,
                actual: block.len(),
            });
        }
        Ok(())
    }
}

fn check_unique(indices: &[usize], total: usize) -> Result<()> {
    let mut seen = vec![false; total];
    for &index in indices {
        if index >= total {
            return Err(Error::InvalidShardIndex { index, total });
        }
        if seen[index] {
            return Err(Error::DuplicateShard(index));
        }
        seen[index] = true;
    }
    Ok(())
}
