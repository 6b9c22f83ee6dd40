//! Sharder implementation.
use std::io::Cursor;

/// Exclusive upper bound of hash values produced by [`Sharder::hash`].
pub const MAX_HASH_VALUE: f64 = 4_294_967_296.0;

/// Number of buckets in a traffic distribution (percentage with three decimals).
pub const TOTAL_TRAFFIC: u32 = 1000;

pub trait Sharder {
    /// Hash `input` with `seed` into `0..MAX_HASH_VALUE`.
    fn hash(&self, input: &str, seed: u32) -> u32;

    /// Map `input` into a bucket in `0..TOTAL_TRAFFIC`.
    fn bucket(&self, input: &str, seed: u32) -> u32 {
        let ratio = f64::from(self.hash(input, seed)) / MAX_HASH_VALUE;
        (f64::from(TOTAL_TRAFFIC) * ratio).floor() as u32
    }
}

/// The default (and only) sharder: 32-bit x86 MurmurHash3.
pub struct Murmur3Sharder;

impl Sharder for Murmur3Sharder {
    fn hash(&self, input: &str, seed: u32) -> u32 {
        // Reading from an in-memory buffer cannot fail.
        murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), seed).unwrap_or(0)
    }
}

/// A sharder returning preset hashes, for tests that need to land users in specific buckets.
#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u32>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn hash(&self, input: &str, _seed: u32) -> u32 {
        self.0.get(input).copied().unwrap_or(0)
    }
}
