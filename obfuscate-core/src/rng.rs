//! Deterministic pseudorandom streams driving every pass's nondeterministic
//! choices.
//!
//! Two distinct generators are exposed: [`Random`], a 64-bit Mersenne
//! Twister stream used for every structural choice a pass makes (which
//! rewrite to pick, which state to assign, whether to take an optional
//! branch), and [`split_mix32`], a tiny deterministic hash used purely to
//! derive key schedules (XTEA keys, string-cipher keystreams) from a master
//! seed so they can be replayed at compile time without touching the main
//! stream.

use log::info;
use rand::RngCore;
use rand_mt::Mt64;

/// The operations every pass needs from the shared PRNG.
///
/// Kept as a trait (rather than a concrete type threaded everywhere) so
/// passes can be tested against a scripted sequence of draws without
/// depending on `rand_mt` directly.
pub trait RandomSource {
    /// Returns a uniformly distributed `u64`.
    fn next_u64(&mut self) -> u64;

    /// Returns a uniformly distributed integer in `[lo, hi]` (inclusive).
    fn range_u64(&mut self, lo: u64, hi: u64) -> u64 {
        assert!(lo <= hi, "range_u64: lo must not exceed hi");
        let span = hi - lo;
        if span == u64::MAX {
            return self.next_u64();
        }
        lo + self.next_u64() % (span + 1)
    }

    /// Returns `true` with probability `percent / 100`. A `percent` of 0
    /// never fires; 100 or above always fires.
    fn chance(&mut self, percent: i32) -> bool {
        if percent <= 0 {
            return false;
        }
        if percent >= 100 {
            return true;
        }
        self.range_u64(1, 100) <= percent as u64
    }

    /// Returns a uniformly distributed index in `[0, n)`.
    fn uniform_index(&mut self, n: usize) -> usize {
        assert!(n > 0, "uniform_index: n must be positive");
        self.range_u64(0, (n - 1) as u64) as usize
    }
}

/// Production PRNG: a 64-bit Mersenne Twister stream seeded once at pass
/// startup.
///
/// A seed of 0 draws a seed from the OS entropy source and logs it, so the
/// run can be reproduced later by passing `--seed <logged value>`.
pub struct Random {
    mt: Mt64,
    seed: u64,
}

impl Random {
    /// Creates a new stream from `seed`. `seed == 0` draws a fresh seed from
    /// the OS and logs it at `info` level.
    pub fn new(seed: u64) -> Self {
        let seed = if seed == 0 {
            let drawn = rand::thread_rng().next_u64();
            info!("no --seed given, drew seed {drawn} (pass --seed {drawn} to reproduce)");
            drawn
        } else {
            seed
        };
        Self {
            mt: Mt64::new(seed),
            seed,
        }
    }

    /// The seed this stream was (or would have been) constructed with.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RandomSource for Random {
    fn next_u64(&mut self) -> u64 {
        self.mt.next_u64()
    }
}

/// SplitMix32: a small, fast, deterministic 32-bit mixing function.
///
/// Used both to derive per-target XTEA key schedules from a per-function
/// master seed (§4.6/§4.8) and as the keystream generator for string
/// encryption (§4.9). `state` is advanced in place; the function returns one
/// 32-bit keystream word per call, matching the emitted IR bit-for-bit.
#[inline]
pub fn split_mix32(state: &mut u32) -> u32 {
    *state = state.wrapping_add(0x9E37_79B9);
    let mut z = *state;
    z ^= z >> 16;
    z = z.wrapping_mul(0x85EB_CA6B);
    z ^= z >> 13;
    z = z.wrapping_mul(0xC2B2_AE35);
    z ^= z >> 16;
    z
}

/// Deterministic stream built on [`split_mix32`], used to derive XTEA key
/// schedules. Distinct from [`Random`] so the same master seed always
/// produces the same key schedule regardless of how many structural
/// decisions the main PRNG stream has made elsewhere in the pass.
pub struct SplitMixStream {
    state: u32,
}

impl SplitMixStream {
    /// Creates a stream seeded directly from `seed`.
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Returns the next 32-bit word in the stream.
    pub fn next_u32(&mut self) -> u32 {
        split_mix32(&mut self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Random::new(42);
        let mut b = Random::new(42);
        for _ in 0..64 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn chance_bounds() {
        let mut r = Random::new(7);
        for _ in 0..1000 {
            assert!(!r.chance(0));
            assert!(r.chance(100));
        }
    }

    #[test]
    fn range_u64_inclusive_bounds() {
        let mut r = Random::new(1);
        for _ in 0..10_000 {
            let v = r.range_u64(5, 9);
            assert!((5..=9).contains(&v));
        }
    }

    #[test]
    fn uniform_index_in_bounds() {
        let mut r = Random::new(2);
        for _ in 0..1000 {
            assert!(r.uniform_index(7) < 7);
        }
    }

    #[test]
    fn split_mix32_is_deterministic_and_varies() {
        let mut s1 = 0xDEAD_BEEFu32;
        let mut s2 = 0xDEAD_BEEFu32;
        let a = split_mix32(&mut s1);
        let b = split_mix32(&mut s2);
        assert_eq!(a, b);
        let c = split_mix32(&mut s1);
        assert_ne!(a, c);
    }

    #[test]
    fn split_mix_stream_matches_free_function() {
        let mut state = 123;
        let expected = split_mix32(&mut state);
        let mut stream = SplitMixStream::new(123);
        assert_eq!(stream.next_u32(), expected);
    }
}
