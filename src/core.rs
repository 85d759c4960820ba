//! Core building blocks shared by the connection engine and the scheduler.
//!
//! - [`time`]: the quantization grid and the precise spike time representation
//! - [`vp`]: the assignment of nodes to virtual processes
//! - [`collection`]: immutable sets of node IDs
//! - [`spatial`]: positions, periodic boundaries and masks of spatial collections
//! - [`parameter`]: constant, array, random and distance-dependent connection parameters
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

pub mod collection;
pub mod parameter;
pub mod spatial;
pub mod time;
pub mod vp;

/// A dictionary of named numerical properties, e.g., the parameters of a model.
pub type ParamDict = std::collections::BTreeMap<String, f64>;

/// Build a [`ParamDict`] from `(name, value)` pairs.
pub fn params(entries: &[(&str, f64)]) -> ParamDict {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

/// The random number generator used throughout the kernel.
pub type KernelRng = ChaCha20Rng;

/// The stream reserved for the generator shared by all ranks.
pub const RANK_SYNCED_STREAM: u64 = 0;

/// Returns the generator of the given stream. Virtual process `vp` draws from stream `vp + 1`.
pub fn stream_rng(seed: u64, stream: u64) -> KernelRng {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

/// Returns a generator keyed by an unordered pair of nodes.
/// The same pair yields the same draws on every virtual process and in both directions.
///
/// The key is the little-endian concatenation of the seed, the smaller and the larger node ID.
pub fn pair_rng(seed: u64, a: u64, b: u64) -> KernelRng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    key[8..16].copy_from_slice(&a.min(b).to_le_bytes());
    key[16..24].copy_from_slice(&a.max(b).to_le_bytes());
    ChaCha20Rng::from_seed(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_streams_are_independent() {
        let mut rng_0 = stream_rng(42, 1);
        let mut rng_1 = stream_rng(42, 2);
        let draws_0: Vec<u64> = (0..4).map(|_| rng_0.gen()).collect();
        let draws_1: Vec<u64> = (0..4).map(|_| rng_1.gen()).collect();
        assert_ne!(draws_0, draws_1);

        let mut rng_2 = stream_rng(42, 1);
        let draws_2: Vec<u64> = (0..4).map(|_| rng_2.gen()).collect();
        assert_eq!(draws_0, draws_2);
    }

    #[test]
    fn test_pair_rng_is_symmetric() {
        let a: f64 = pair_rng(7, 3, 11).gen();
        let b: f64 = pair_rng(7, 11, 3).gen();
        let c: f64 = pair_rng(7, 3, 12).gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_pair_rng_draws_are_pinned() {
        let mut rng = pair_rng(7, 11, 3);
        assert_eq!(rng.gen::<u64>(), 15788621768023067772);
        assert_eq!(rng.gen::<u64>(), 1178144642727817066);
    }
}
