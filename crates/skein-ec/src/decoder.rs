//! Whole-buffer Reed-Solomon decoder

use crate::{ErasureConfig, Error, Result};
use reed_solomon_simd::ReedSolomonDecoder;

/// Rebuilds the original data from any `data_shards` of the encoded shards
pub struct ErasureDecoder {
    config: ErasureConfig,
}

impl ErasureDecoder {
    /// Create a new decoder with the given configuration
    pub fn new(config: ErasureConfig) -> Self {
        Self { config }
    }

    /// Decode the padded data from a full-width shard vector.
    ///
    /// `shards[i]` is `None` when shard `i` is missing.
    pub fn decode(&self, shards: &[Option<Vec<u8>>]) -> Result<Vec<u8>> {
        let total = self.config.total_shards();
        if shards.len() != total {
            return Err(Error::DecodingError(format!(
                "expected {} shard slots, got {}",
                total,
                shards.len()
            )));
        }

        let present: Vec<(usize, &[u8])> = shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_deref().map(|s| (i, s)))
            .collect();

        let data = recover_data(&self.config, &present)?;
        Ok(data.concat())
    }

    /// Decode and truncate to the original length
    pub fn decode_exact(&self, shards: &[Option<Vec<u8>>], original_len: usize) -> Result<Vec<u8>> {
        let mut data = self.decode(shards)?;
        if original_len > data.len() {
            return Err(Error::InvalidDataSize(format!(
                "original length {} exceeds decoded size {}",
                original_len,
                data.len()
            )));
        }
        data.truncate(original_len);
        Ok(data)
    }

    /// Get the configuration
    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }
}

/// Recover all data shards from at least `data_shards` indexed shards.
///
/// Inputs must already be validated: distinct, in range and equally sized.
pub(crate) fn recover_data(config: &ErasureConfig, present: &[(usize, &[u8])]) -> Result<Vec<Vec<u8>>> {
    let k = config.data_shards();
    if present.len() < k {
        return Err(Error::InsufficientShards {
            available: present.len(),
            required: k,
        });
    }
    let shard_size = present[0].1.len();

    let mut data: Vec<Option<Vec<u8>>> = vec![None; k];
    for (index, shard) in present {
        if *index < k {
            data[*index] = Some(shard.to_vec());
        }
    }
    if data.iter().all(Option::is_some) {
        return Ok(data.into_iter().flatten().collect());
    }

    let mut decoder = ReedSolomonDecoder::new(k, config.parity_shards(), shard_size)
        .map_err(|e| Error::DecodingError(format!("failed to create decoder: {}", e)))?;
    for (index, shard) in present.iter().take(k) {
        if shard.len() != shard_size {
            return Err(Error::ShardSizeMismatch {
                expected: shard_size,
                actual: shard.len(),
            });
        }
        let added = if *index < k {
            decoder.add_original_shard(*index, shard)
        } else {
            decoder.add_recovery_shard(*index - k, shard)
        };
        added.map_err(|e| Error::DecodingError(format!("failed to add shard {}: {}", index, e)))?;
    }

    let result = decoder
        .decode()
        .map_err(|e| Error::DecodingError(format!("decoding failed: {}", e)))?;

    let mut out = Vec::with_capacity(k);
    for (i, slot) in data.into_iter().enumerate() {
        match slot {
            Some(shard) => out.push(shard),
            None => {
                let restored = result.restored_original(i).ok_or_else(|| {
                    Error::DecodingError(format!("data shard {} was not restored", i))
                })?;
                out.push(restored.to_vec());
            }
        }
    }
    Ok(out)
}
