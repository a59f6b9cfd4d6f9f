//! Erasure coding configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on `data + parity` accepted by skein
pub const MAX_TOTAL_SHARDS: usize = 256;

/// Reed-Solomon layout: `data_shards` originals plus `parity_shards` recovery
/// shards. Any `data_shards` of the total are enough to rebuild the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErasureConfig {
    data_shards: usize,
    parity_shards: usize,
}

impl ErasureConfig {
    /// Create a configuration from data and parity counts
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::InvalidConfig("data_shards must be positive".into()));
        }
        if parity_shards == 0 {
            return Err(Error::InvalidConfig(
                "parity_shards must be positive".into(),
            ));
        }
        let total = data_shards + parity_shards;
        if total > MAX_TOTAL_SHARDS {
            return Err(Error::InvalidConfig(format!(
                "total shards {} exceeds limit {}",
                total, MAX_TOTAL_SHARDS
            )));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Create a configuration from `k` data shards out of `n` total
    pub fn from_k_n(k: usize, n: usize) -> Result<Self> {
        if n <= k {
            return Err(Error::InvalidConfig(format!(
                "total shards {} must exceed data shards {}",
                n, k
            )));
        }
        Self::new(k, n - k)
    }

    /// RS(4,2)
    pub fn rs_4_2() -> Self {
        Self {
            data_shards: 4,
            parity_shards: 2,
        }
    }

    /// RS(6,3)
    pub fn rs_6_3() -> Self {
        Self {
            data_shards: 6,
            parity_shards: 3,
        }
    }

    /// RS(10,4)
    pub fn rs_10_4() -> Self {
        Self {
            data_shards: 10,
            parity_shards: 4,
        }
    }

    /// Number of data shards (`k`)
    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    /// Number of parity shards (`n - k`)
    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Total shard count (`n`)
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Whether `index` names a data shard
    pub fn is_data_shard(&self, index: usize) -> bool {
        index < self.data_shards
    }

    /// Per-shard size needed to hold `data_len` bytes.
    ///
    /// Rounded up to an even number of bytes, which the SIMD codec requires.
    pub fn shard_size_for_data(&self, data_len: usize) -> usize {
        let size = data_len.div_ceil(self.data_shards).max(1);
        size + (size % 2)
    }

    /// Total data size after zero padding to whole shards
    pub fn padded_data_size(&self, data_len: usize) -> usize {
        self.shard_size_for_data(data_len) * self.data_shards
    }

    /// Storage overhead ratio, e.g. 1.5 for RS(4,2)
    pub fn overhead(&self) -> f64 {
        self.total_shards() as f64 / self.data_shards as f64
    }
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self::rs_4_2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_k_n() {
        let config = ErasureConfig::from_k_n(4, 6).unwrap();
        assert_eq!(config.data_shards(), 4);
        assert_eq!(config.parity_shards(), 2);
        assert_eq!(config.total_shards(), 6);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ErasureConfig::new(0, 2).is_err());
        assert!(ErasureConfig::new(4, 0).is_err());
        assert!(ErasureConfig::from_k_n(4, 4).is_err());
        assert!(ErasureConfig::from_k_n(200, 300).is_err());
    }

    #[test]
    fn test_shard_size_is_even() {
        let config = ErasureConfig::rs_4_2();
        assert_eq!(config.shard_size_for_data(256), 64);
        assert_eq!(config.shard_size_for_data(100), 26);
        assert_eq!(config.shard_size_for_data(1), 2);
        assert_eq!(config.padded_data_size(100), 104);
    }

    #[test]
    fn test_overhead() {
        assert!((ErasureConfig::rs_4_2().overhead() - 1.5).abs() < f64::EPSILON);
    }
}
