//! skein-ec: Reed-Solomon erasure coding for skein
//!
//! Whole-buffer encode/decode for small objects and tests, plus a
//! [`StripeCoder`] that works on one fixed-size stripe at a time for the
//! streaming EC operators in `skein-switch`.
//!
//! Shards are numbered `0..n`. Indices below `k` are the data shards (the
//! code is systematic), the rest are parity. Any `k` distinct shards are
//! enough to rebuild every other shard.
//!
//! # Example
//!
//! ```
//! use skein_ec::{ErasureConfig, StripeCoder};
//!
//! let coder = StripeCoder::new(ErasureConfig::from_k_n(4, 6).unwrap(), 64).unwrap();
//! let data: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8; 64]).collect();
//! let parity = coder.encode_parity(&data).unwrap();
//!
//! // Lose data shards 0 and 1, rebuild them from 2, 3 and both parity shards.
//! let inputs = vec![(2, &data[2][..]), (3, &data[3][..]), (4, &parity[0][..]), (5, &parity[1][..])];
//! let rebuilt = coder.reconstruct_some(&inputs, &[0, 1]).unwrap();
//! assert_eq!(rebuilt[0], data[0]);
//! assert_eq!(rebuilt[1], data[1]);
//! ```

#![warn(missing_docs)]

mod config;
mod decoder;
mod encoder;
mod error;
mod stripe;

pub use config::{ErasureConfig, MAX_TOTAL_SHARDS};
pub use decoder::ErasureDecoder;
pub use encoder::ErasureEncoder;
pub use error::{Error, Result};
pub use stripe::StripeCoder;


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stripe_rebuilds_any_lost_shard(
            seed in any::<u8>(),
            half_chunk in 1usize..64,
            missing in 0usize..6,
        ) {
            let coder = StripeCoder::new(ErasureConfig::from_k_n(4, 6).unwrap(), half_chunk * 2).unwrap();
            let data: Vec<Vec<u8>> = (0..4)
                .map(|s| (0..coder.chunk_size()).map(|i| seed.wrapping_add((i * 7 + s) as u8)).collect())
                .collect();
            let parity = coder.encode_parity(&data).unwrap();
            let all: Vec<Vec<u8>> = data.into_iter().chain(parity).collect();

            let inputs: Vec<(usize, &[u8])> = (0..6)
                .filter(|i| *i != missing)
                .take(4)
                .map(|i| (i, &all[i][..]))
                .collect();
            let out = coder.reconstruct_some(&inputs, &[missing]).unwrap();
            prop_assert_eq!(&out[0], &all[missing]);
        }

        #[test]
        fn decode_exact_preserves_length(len in 1usize..2048, lost in 0usize..6) {
            let config = ErasureConfig::rs_4_2();
            let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let shards = ErasureEncoder::new(config).encode(&data).unwrap();
            let mut received: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
            received[lost] = None;
            let decoded = ErasureDecoder::new(config).decode_exact(&received, len).unwrap();
            prop_assert_eq!(decoded, data);
        }
    }
}
