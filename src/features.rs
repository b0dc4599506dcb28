//! Task context: the feature snapshot a decision is made against.
//!
//! [`TaskFeatures`] is used three ways:
//! - as the LinUCB context vector ([`TaskFeatures::context_vector`]),
//! - as the Thompson posterior key after coarse quantisation ([`context_bucket`]),
//! - as the audit/evaluation grouping key ([`TaskFeatures::fingerprint`]).

use serde::{Deserialize, Serialize};

use crate::stable_hash::stable_hash64;

/// Length of [`TaskFeatures::context_vector`].
pub const CONTEXT_DIM: usize = 10;

/// Highest risk tier; tiers are `0..=MAX_RISK_TIER`.
pub const MAX_RISK_TIER: u8 = 3;

// Indices into the context vector used for bucketing: risk, description size,
// complexity, prior failures.
const BUCKET_DIMS: [usize; 4] = [1, 3, 6, 7];

/// Immutable snapshot of the context used for one decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFeatures {
    /// Ordinal risk tier, `0` (lowest) to [`MAX_RISK_TIER`].
    pub risk_tier: u8,
    pub title_length: u32,
    pub description_length: u32,
    pub acceptance_criteria_count: u32,
    pub scope_files_count: u32,
    #[serde(default)]
    pub has_external_deps: bool,
    /// Free-form complexity tags, e.g. `"concurrency"`, `"migration"`.
    #[serde(default)]
    pub complexity_indicators: Vec<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    /// Prior failures for this task type, when the caller tracks them.
    #[serde(default)]
    pub prior_failures: Option<u32>,
}

fn log_scaled(x: f64, cap: f64) -> f64 {
    ((1.0 + x.max(0.0)).ln() / (1.0 + cap).ln()).clamp(0.0, 1.0)
}

fn capped(x: f64, cap: f64) -> f64 {
    (x / cap).clamp(0.0, 1.0)
}

impl TaskFeatures {
    /// Stable blake3 fingerprint (hex, 32 chars).
    ///
    /// Complexity indicators are hashed in sorted order so tag order does not
    /// change the fingerprint.
    pub fn fingerprint(&self) -> String {
        let digest = self.digest();
        let mut out = String::with_capacity(32);
        for b in &digest.as_bytes()[..16] {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// First 8 bytes of the fingerprint digest, for seeding.
    pub fn fingerprint_u64(&self) -> u64 {
        let digest = self.digest();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    fn digest(&self) -> blake3::Hash {
        let mut h = blake3::Hasher::new();
        h.update(&[self.risk_tier]);
        h.update(&self.title_length.to_le_bytes());
        h.update(&self.description_length.to_le_bytes());
        h.update(&self.acceptance_criteria_count.to_le_bytes());
        h.update(&self.scope_files_count.to_le_bytes());
        h.update(&[u8::from(self.has_external_deps)]);
        let mut tags: Vec<&str> = self
            .complexity_indicators
            .iter()
            .map(String::as_str)
            .collect();
        tags.sort_unstable();
        for t in tags {
            h.update(&(t.len() as u32).to_le_bytes());
            h.update(t.as_bytes());
        }
        match &self.model_name {
            Some(m) => {
                h.update(&[1]);
                h.update(&(m.len() as u32).to_le_bytes());
                h.update(m.as_bytes());
            }
            None => {
                h.update(&[0]);
            }
        }
        for opt in [self.prompt_tokens, self.prior_failures] {
            match opt {
                Some(v) => h.update(&[1]).update(&v.to_le_bytes()),
                None => h.update(&[0]),
            };
        }
        h.finalize()
    }

    /// Normalized feature vector in `[0, 1]^CONTEXT_DIM`.
    ///
    /// Index 0 is a constant bias term.
    pub fn context_vector(&self) -> Vec<f64> {
        vec![
            1.0,
            capped(f64::from(self.risk_tier), f64::from(MAX_RISK_TIER)),
            log_scaled(f64::from(self.title_length), 200.0),
            log_scaled(f64::from(self.description_length), 5_000.0),
            capped(f64::from(self.acceptance_criteria_count), 20.0),
            capped(f64::from(self.scope_files_count), 50.0),
            capped(self.complexity_indicators.len() as f64, 10.0),
            capped(f64::from(self.prior_failures.unwrap_or(0)), 5.0),
            if self.has_external_deps { 1.0 } else { 0.0 },
            log_scaled(f64::from(self.prompt_tokens.unwrap_or(0)), 32_000.0),
        ]
    }
}

/// Quantisation for the Thompson posterior key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBucketConfig {
    /// Equal-width levels per bucketed dimension (1 collapses everything into one bucket).
    pub levels: u8,
    /// Seed mixed into the bucket hash.
    pub seed: u64,
}

impl Default for ContextBucketConfig {
    fn default() -> Self {
        Self {
            levels: 2,
            seed: 0xC0B1_C0B1,
        }
    }
}

/// Stable bucket id for a feature snapshot.
///
/// Only a coarse subset of dimensions (risk, description size, complexity, prior
/// failures) participates, so buckets stay populated enough for per-bucket posteriors.
pub fn context_bucket(features: &TaskFeatures, cfg: ContextBucketConfig) -> u64 {
    let levels = u64::from(cfg.levels.max(1));
    if levels == 1 {
        return stable_hash64(cfg.seed, "*");
    }
    let x = features.context_vector();
    let mut key = String::with_capacity(BUCKET_DIMS.len() * 3);
    for (i, &dim) in BUCKET_DIMS.iter().enumerate() {
        let v = x.get(dim).copied().unwrap_or(0.0);
        let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let b = ((v * levels as f64).floor() as u64).min(levels - 1);
        if i > 0 {
            key.push(':');
        }
        key.push_str(&b.to_string());
    }
    stable_hash64(cfg.seed, &key)
}
