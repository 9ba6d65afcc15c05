//! Seeded pseudo-random source shared by host and clients
//!
//! Each action invocation carries a 32-bit seed instead of random output.
//! Every participant rebuilds a [`SeededRandom`] from that seed and observes
//! the same sequence, so "random" outcomes stay identical everywhere.
//!
//! The generator is mulberry32: tiny, fast and fully specified by its seed.
//! It implements [`rand::RngCore`] so handlers may also use the
//! [`rand::Rng`] extension methods, but the helpers here are implemented
//! on top of [`SeededRandom::next_f64`] and do not depend on the sampling
//! algorithms of any particular `rand` release.

use rand::{RngCore, SeedableRng};

#[derive(Debug, Clone)]
pub struct SeededRandom {
    seed: u32,
    state: u32,
}

impl SeededRandom {
    pub fn new(seed: u32) -> Self {
        Self { seed, state: seed }
    }

    /// The seed this generator was built from
    pub fn seed(&self) -> u32 {
        self.seed
    }

    fn step(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    /// Uniform float in `[0, 1)`
    pub fn next_f64(&mut self) -> f64 {
        self.step() as f64 / 4_294_967_296.0
    }

    /// Uniform float in `[min, max)`
    pub fn range(&mut self, min: f64, max: f64) -> f64 {
        min + self.next_f64() * (max - min)
    }

    /// Uniform integer in `[min, max]`
    ///
    /// The bounds are swapped when given in the wrong order.
    pub fn int(&mut self, min: i64, max: i64) -> i64 {
        let (low, high) = if min <= max { (min, max) } else { (max, min) };
        let span = (high - low) as f64 + 1.0;
        low + (self.next_f64() * span).floor() as i64
    }

    /// Returns true with probability `p`
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let index = self.int(0, items.len() as i64 - 1) as usize;
        items.get(index)
    }

    /// Fisher-Yates shuffle in place
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.int(0, i as i64) as usize;
            items.swap(i, j);
        }
    }
}

impl RngCore for SeededRandom {
    fn next_u32(&mut self) -> u32 {
        self.step()
    }

    fn next_u64(&mut self) -> u64 {
        let high = self.step() as u64;
        let low = self.step() as u64;
        (high << 32) | low
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.step().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for SeededRandom {
    type Seed = [u8; 4];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(u32::from_le_bytes(seed))
    }
}
