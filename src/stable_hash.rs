//! Deterministic hashing helpers for routing coin flips and seed derivation.
//!
//! Not cryptographic. Used where the same input must map to the same bucket or
//! the same pseudo-random draw on every platform and every run.

/// Stable 64-bit hash of `s` mixed with `seed`.
///
/// FNV-1a over the bytes, then a SplitMix64 finalizer for diffusion.
#[must_use]
pub fn stable_hash64(seed: u64, s: &str) -> u64 {
    let mut h: u64 = 14695981039346656037u64;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(1099511628211u64);
    }
    splitmix64(seed ^ h)
}

/// Uniform draw in `[0, 1)` derived from `(seed, s)`.
///
/// Used for per-request routing: the same request id always lands on the same
/// side of a traffic split.
#[must_use]
pub fn stable_unit(seed: u64, s: &str) -> f64 {
    // Top 53 bits give an exactly representable f64 in [0, 1).
    (stable_hash64(seed, s) >> 11) as f64 / (1u64 << 53) as f64
}

/// Combine several 64-bit values into one seed.
#[must_use]
pub fn mix_seed(parts: &[u64]) -> u64 {
    let mut acc = 0x243F_6A88_85A3_08D3u64;
    for &p in parts {
        acc = splitmix64(acc ^ p);
    }
    acc
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
