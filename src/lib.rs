//! `tunemux`: online tuning of inference parameters (temperature, top-p, penalties,
//! max tokens) per task type.
//!
//! Each request is routed either to a frozen baseline or to a learning candidate
//! policy. The candidate is a contextual bandit over a small grid of parameter sets
//! around the baseline. Every served decision is logged with its exact propensity, so
//! a candidate can be judged offline before it sees more traffic.
//!
//! The loop:
//!
//! ```text
//!   recommend ─► gate (trust region, quality floor, budget) ─► bandit ─► log
//!                                                                        │
//!   record_outcome ─► reward ─► attach (idempotent) ─► bandit / gate / SLO / budget
//!                                                                        │
//!   control cycle ─► SLO check ─► rollback?   else   DR + bootstrap ─► promote?
//! ```
//!
//! **Pieces:**
//! - [`RewardFunction`]: scalar reward from quality, latency, tokens and violations.
//! - [`ThompsonGaussian`] (and, with feature `contextual`, [`LinUcb`]): bandits behind
//!   the [`BanditPolicy`] trait. Both report a full action distribution.
//! - [`QualityGateValidator`]: per-request safe set. The baseline is always allowed.
//! - [`ComplianceBudget`]: per-period spend cap with reservations and an append-only
//!   ledger.
//! - [`CounterfactualLogger`]: bounded async queue in front of a [`DecisionStore`]
//!   ([`MemoryStore`], [`JsonlStore`]).
//! - [`OfflineEvaluator`]: IPS and doubly robust estimates with a bootstrap lower bound.
//! - [`SloMonitor`] and [`RolloutManager`]: Shadow → Canary → Guarded → General, one
//!   phase back on a breach.
//! - [`ParameterOptimizer`]: ties it together. `recommend` never fails; it degrades
//!   to the baseline instead.
//!
//! **Non-goals:**
//! - Not a serving layer. Callers run the model themselves and report outcomes.
//! - No dashboards; audit events go to an [`EventSink`] (by default, `tracing`).
//!
//! # Propensities under a traffic split
//!
//! With candidate fraction `f`, the probability of serving arm `a` is
//!
//! ```text
//!   p(a) = (1 - f) * 1[a = baseline] + f * π(a | x)
//! ```
//!
//! The bandit's distribution `π` is computed for every request, including those routed
//! to the baseline, so `p(a)` is what gets logged. This keeps importance weights honest
//! across phases.

#![forbid(unsafe_code)]

mod alloc;
pub use alloc::*;

mod arm;
pub use arm::*;

mod budget;
pub use budget::*;

mod config;
pub use config::*;

#[cfg(feature = "contextual")]
mod contextual;
#[cfg(feature = "contextual")]
pub use contextual::*;

mod decision;
pub use decision::*;

mod error;
pub use error::*;

mod evaluator;
pub use evaluator::*;

mod events;
pub use events::*;

mod features;
pub use features::*;

mod guardrail;
pub use guardrail::*;

mod keyed;

mod logger;
pub use logger::*;

pub mod monitor;
pub use monitor::{
    RegressionThresholds, SloBreach, SloConfig, SloMonitor, SloRequirements, SloSample, SloStats,
    SloStatus,
};

mod optimizer;
pub use optimizer::*;

mod policy;
pub use policy::*;

mod reward;
pub use reward::*;

mod rollout;
pub use rollout::*;

mod stable_hash;
pub use stable_hash::*;

mod store;
pub use store::*;

mod thompson;
pub use thompson::*;

mod utils;
pub use utils::*;
