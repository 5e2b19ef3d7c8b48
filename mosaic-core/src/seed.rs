//! Explicit per-run seed state.
//!
//! Each sampling round consumes the current [`SeedState`] and gets back one
//! seed per device plus the state for the next round. Derived seeds are a
//! bijective mix of a monotonically increasing counter, so no two rounds of
//! the same run ever see the same device seed.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// The splitmix64 finalizer. A bijection on `u64`.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedState {
    seed: u64,
    counter: u64,
}

impl SeedState {
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    /// A fresh state from a random 32-bit seed.
    pub fn random() -> Self {
        Self::new(rand::random::<u32>() as u64)
    }

    /// The seed this run was started from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of device seeds handed out so far.
    pub fn consumed(&self) -> u64 {
        self.counter
    }

    /// Derives `devices` seeds and returns them with the advanced state.
    pub fn split(self, devices: usize) -> Result<(Vec<u64>, SeedState)> {
        let width = devices as u64;
        let next = self
            .counter
            .checked_add(width)
            .ok_or_else(|| Error::Config("seed counter exhausted".into()))?;
        let key = mix64(self.seed);
        let seeds = (self.counter..next)
            .map(|c| mix64(c.wrapping_mul(GOLDEN_GAMMA) ^ key))
            .collect();
        Ok((
            seeds,
            SeedState {
                seed: self.seed,
                counter: next,
            },
        ))
    }
}
