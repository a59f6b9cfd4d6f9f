//! Whole-buffer Reed-Solomon encoder

use crate::{ErasureConfig, Error, Result};
use reed_solomon_simd::ReedSolomonEncoder;

/// Splits a buffer into data shards and appends parity shards
pub struct ErasureEncoder {
    config: ErasureConfig,
}

impl ErasureEncoder {
    /// Create a new encoder with the given configuration
    pub fn new(config: ErasureConfig) -> Self {
        Self { config }
    }

    /// Encode data into `total_shards` shards.
    ///
    /// The first `data_shards` entries are the zero-padded data, the rest are
    /// parity. The caller keeps track of the original length.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(Error::InvalidDataSize("data cannot be empty".into()));
        }

        let shard_size = self.config.shard_size_for_data(data.len());
        let mut padded = data.to_vec();
        padded.resize(self.config.padded_data_size(data.len()), 0);

        let mut shards: Vec<Vec<u8>> = padded.chunks(shard_size).map(|s| s.to_vec()).collect();
        let parity = encode_parity(&self.config, &shards)?;
        shards.extend(parity);
        Ok(shards)
    }

    /// Get the configuration
    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Total bytes produced for `data_len` bytes of input
    pub fn encoded_size(&self, data_len: usize) -> usize {
        self.config.shard_size_for_data(data_len) * self.config.total_shards()
    }
}

/// Compute the parity shards for `data_shards` equally sized data shards
pub(crate) fn encode_parity<T: AsRef<[u8]>>(
    config: &ErasureConfig,
    data: &[T],
) -> Result<Vec<Vec<u8>>> {
    let shard_size = data.first().map(|s| s.as_ref().len()).unwrap_or(0);
    if data.len() != config.data_shards() {
        return Err(Error::EncodingError(format!(
            "expected {} data shards, got {}",
            config.data_shards(),
            data.len()
        )));
    }

    let mut encoder =
        ReedSolomonEncoder::new(config.data_shards(), config.parity_shards(), shard_size)
            .map_err(|e| Error::EncodingError(format!("failed to create encoder: {}", e)))?;

    for shard in data {
        let shard = shard.as_ref();
        if shard.len() != shard_size {
            return Err(Error::ShardSizeMismatch {
                expected: shard_size,
                actual: shard.len(),
            });
        }
        encoder
            .add_original_shard(shard)
            .map_err(|e| Error::EncodingError(format!("failed to add shard: {}", e)))?;
    }

    let result = encoder
        .encode()
        .map_err(|e| Error::EncodingError(format!("encoding failed: {}", e)))?;
    Ok(result.recovery_iter().map(|s| s.to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_basic() {
        let encoder = ErasureEncoder::new(ErasureConfig::rs_4_2());

        let data: Vec<u8> = (0..256).map(|i| i as u8).collect();
        let shards = encoder.encode(&data).unwrap();

        assert_eq!(shards.len(), 6);
        assert_eq!(shards[0].len(), 64);
        assert_eq!(&shards[1][..], &data[64..128]);
    }

    #[test]
    fn test_encode_with_padding() {
        let encoder = ErasureEncoder::new(ErasureConfig::rs_4_2());

        let data: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let shards = encoder.encode(&data).unwrap();

        assert_eq!(shards.len(), 6);
        assert!(shards.iter().all(|s| s.len() == 26));
        assert_eq!(encoder.encoded_size(100), 26 * 6);
    }

    #[test]
    fn test_encode_empty() {
        let encoder = ErasureEncoder::new(ErasureConfig::rs_4_2());
        assert!(matches!(
            encoder.encode(&[]),
            Err(Error::InvalidDataSize(_))
        ));
    }
}
