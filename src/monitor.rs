//! Live SLO monitoring.
//!
//! Each task type keeps two sliding windows of live measurements, one for traffic served
//! the baseline and one for bandit-routed traffic. The candidate window is tagged with
//! the phase it was collected in and cleared when the phase changes.
//!
//! A check yields one of:
//! - `Healthy`: enough fresh data and no threshold crossed,
//! - `Breach`: at least one threshold crossed,
//! - `Unknown`: too few or too stale measurements to say.
//!
//! `Unknown` blocks promotion but never causes a rollback.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::rollout::{Phase, Route};
use crate::utils::percentile;

/// Absolute limits checked on the monitored window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SloRequirements {
    pub max_latency_p99_ms: f64,
    pub min_quality: f64,
    pub max_error_rate: f64,
}

impl Default for SloRequirements {
    fn default() -> Self {
        Self {
            max_latency_p99_ms: 30_000.0,
            min_quality: 0.0,
            max_error_rate: 1.0,
        }
    }
}

/// Regression limits of candidate traffic relative to baseline traffic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionThresholds {
    /// Allowed relative p99 latency increase (`0.2` = +20%).
    pub max_latency_regression: f64,
    /// Allowed absolute drop in mean quality.
    pub max_quality_regression: f64,
    /// Allowed absolute increase in error rate.
    pub max_error_rate_regression: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self {
            max_latency_regression: 0.2,
            max_quality_regression: 0.05,
            max_error_rate_regression: 0.02,
        }
    }
}

/// Window sizing and data-sufficiency settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SloConfig {
    pub window: usize,
    pub min_samples: usize,
    /// Newest sample older than this makes the window stale.
    pub max_staleness_secs: i64,
    pub requirements: SloRequirements,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            window: 500,
            min_samples: 30,
            max_staleness_secs: 300,
            requirements: SloRequirements::default(),
        }
    }
}

/// One live measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloSample {
    pub at: DateTime<Utc>,
    pub latency_ms: f64,
    pub quality: f64,
    pub error: bool,
}

/// Summary statistics of a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloStats {
    pub samples: usize,
    pub latency_p99_ms: f64,
    pub mean_quality: f64,
    pub error_rate: f64,
    pub newest: DateTime<Utc>,
}

/// Bounded FIFO of samples tagged with a phase.
#[derive(Debug, Clone)]
pub struct SloWindow {
    phase: Phase,
    cap: usize,
    buf: VecDeque<SloSample>,
}

impl SloWindow {
    pub fn new(phase: Phase, cap: usize) -> Self {
        Self {
            phase,
            cap: cap.max(1),
            buf: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, s: SloSample) {
        self.buf.push_back(s);
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    /// Drop everything and retag.
    pub fn reset(&mut self, phase: Phase) {
        self.phase = phase;
        self.buf.clear();
    }

    pub fn stats(&self) -> Option<SloStats> {
        let newest = self.buf.iter().map(|s| s.at).max()?;
        let n = self.buf.len();
        let mut lat: Vec<f64> = self.buf.iter().map(|s| s.latency_ms).collect();
        let mean_quality = self.buf.iter().map(|s| s.quality).sum::<f64>() / n as f64;
        let errors = self.buf.iter().filter(|s| s.error).count();
        Some(SloStats {
            samples: n,
            latency_p99_ms: percentile(&mut lat, 0.99),
            mean_quality,
            error_rate: errors as f64 / n as f64,
            newest,
        })
    }
}

/// A single threshold crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slo", rename_all = "snake_case")]
pub enum SloBreach {
    LatencyRegression {
        observed_p99_ms: f64,
        baseline_p99_ms: f64,
        max_regression: f64,
    },
    QualityRegression {
        observed: f64,
        baseline: f64,
        max_regression: f64,
    },
    ErrorRateRegression {
        observed: f64,
        baseline: f64,
        max_regression: f64,
    },
    LatencyLimit {
        observed_p99_ms: f64,
        limit_ms: f64,
    },
    QualityLimit {
        observed: f64,
        limit: f64,
    },
    ErrorRateLimit {
        observed: f64,
        limit: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SloStatus {
    Healthy {
        monitored: SloStats,
    },
    Breach {
        monitored: SloStats,
        breaches: Vec<SloBreach>,
    },
    Unknown {
        reason: String,
    },
}

impl SloStatus {
    pub fn is_breach(&self) -> bool {
        matches!(self, SloStatus::Breach { .. })
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, SloStatus::Healthy { .. })
    }
}

fn check_absolute(stats: &SloStats, req: &SloRequirements, out: &mut Vec<SloBreach>) {
    if stats.latency_p99_ms > req.max_latency_p99_ms {
        out.push(SloBreach::LatencyLimit {
            observed_p99_ms: stats.latency_p99_ms,
            limit_ms: req.max_latency_p99_ms,
        });
    }
    if stats.mean_quality < req.min_quality {
        out.push(SloBreach::QualityLimit {
            observed: stats.mean_quality,
            limit: req.min_quality,
        });
    }
    if stats.error_rate > req.max_error_rate {
        out.push(SloBreach::ErrorRateLimit {
            observed: stats.error_rate,
            limit: req.max_error_rate,
        });
    }
}

fn check_relative(
    cand: &SloStats,
    base: &SloStats,
    t: &RegressionThresholds,
    out: &mut Vec<SloBreach>,
) {
    if cand.latency_p99_ms > base.latency_p99_ms * (1.0 + t.max_latency_regression) {
        out.push(SloBreach::LatencyRegression {
            observed_p99_ms: cand.latency_p99_ms,
            baseline_p99_ms: base.latency_p99_ms,
            max_regression: t.max_latency_regression,
        });
    }
    if base.mean_quality - cand.mean_quality > t.max_quality_regression {
        out.push(SloBreach::QualityRegression {
            observed: cand.mean_quality,
            baseline: base.mean_quality,
            max_regression: t.max_quality_regression,
        });
    }
    if cand.error_rate - base.error_rate > t.max_error_rate_regression {
        out.push(SloBreach::ErrorRateRegression {
            observed: cand.error_rate,
            baseline: base.error_rate,
            max_regression: t.max_error_rate_regression,
        });
    }
}

#[derive(Debug)]
struct Windows {
    cfg: SloConfig,
    baseline: SloWindow,
    candidate: SloWindow,
}

/// Per-task-type SLO monitor.
#[derive(Debug)]
pub struct SloMonitor {
    windows: Mutex<Windows>,
}

impl SloMonitor {
    pub fn new(cfg: SloConfig, phase: Phase) -> Self {
        Self {
            windows: Mutex::new(Windows {
                cfg,
                baseline: SloWindow::new(phase, cfg.window),
                candidate: SloWindow::new(phase, cfg.window),
            }),
        }
    }

    pub fn config(&self) -> SloConfig {
        self.windows.lock().cfg
    }

    /// Swap thresholds and window size, keeping the newest samples.
    pub fn reconfigure(&self, cfg: SloConfig) {
        let mut w = self.windows.lock();
        w.cfg = cfg;
        w.baseline.set_cap(cfg.window);
        w.candidate.set_cap(cfg.window);
    }

    /// Record a live measurement. Non-finite values are dropped.
    pub fn record(&self, route: Route, sample: SloSample) {
        if !(sample.latency_ms.is_finite() && sample.quality.is_finite()) {
            tracing::warn!(?route, "dropping non-finite SLO sample");
            return;
        }
        let mut w = self.windows.lock();
        match route {
            Route::Baseline => w.baseline.push(sample),
            Route::Candidate => w.candidate.push(sample),
        }
    }

    /// Start a fresh candidate window for `phase`. Baseline history is kept.
    pub fn enter_phase(&self, phase: Phase) {
        let mut w = self.windows.lock();
        w.candidate.reset(phase);
        w.baseline.phase = phase;
    }

    pub fn stats(&self, route: Route) -> Option<SloStats> {
        let w = self.windows.lock();
        match route {
            Route::Baseline => w.baseline.stats(),
            Route::Candidate => w.candidate.stats(),
        }
    }

    fn sufficient(
        cfg: &SloConfig,
        stats: Option<SloStats>,
        now: DateTime<Utc>,
        fresh: bool,
    ) -> Result<SloStats, String> {
        let Some(s) = stats else {
            return Err("no measurements".to_string());
        };
        if s.samples < cfg.min_samples {
            return Err(format!("{} samples, need {}", s.samples, cfg.min_samples));
        }
        if fresh && now - s.newest > Duration::seconds(cfg.max_staleness_secs) {
            return Err(format!("newest measurement at {} is stale", s.newest));
        }
        Ok(s)
    }

    /// Evaluate the window that matters for `phase`.
    ///
    /// - Shadow: live baseline traffic against the absolute requirements.
    /// - Later phases: candidate traffic against the absolute requirements and against
    ///   baseline traffic using `thresholds`. The baseline reference only needs enough
    ///   samples, not freshness, since General serves no baseline traffic.
    pub fn check(
        &self,
        phase: Phase,
        thresholds: &RegressionThresholds,
        now: DateTime<Utc>,
    ) -> SloStatus {
        let (cfg, base, cand) = {
            let w = self.windows.lock();
            (w.cfg, w.baseline.stats(), w.candidate.stats())
        };
        let req = &cfg.requirements;
        let mut breaches = Vec::new();

        if phase == Phase::Shadow {
            let monitored = match Self::sufficient(&cfg, base, now, true) {
                Ok(s) => s,
                Err(reason) => return SloStatus::Unknown { reason: format!("baseline: {reason}") },
            };
            check_absolute(&monitored, req, &mut breaches);
            return if breaches.is_empty() {
                SloStatus::Healthy { monitored }
            } else {
                SloStatus::Breach { monitored, breaches }
            };
        }

        let monitored = match Self::sufficient(&cfg, cand, now, true) {
            Ok(s) => s,
            Err(reason) => return SloStatus::Unknown { reason: format!("candidate: {reason}") },
        };
        check_absolute(&monitored, req, &mut breaches);
        match Self::sufficient(&cfg, base, now, false) {
            Ok(b) => check_relative(&monitored, &b, thresholds, &mut breaches),
            Err(reason) if breaches.is_empty() => {
                return SloStatus::Unknown { reason: format!("baseline: {reason}") };
            }
            Err(_) => {}
        }
        if breaches.is_empty() {
            SloStatus::Healthy { monitored }
        } else {
            SloStatus::Breach { monitored, breaches }
        }
    }
}
