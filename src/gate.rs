// =============================================================================
// Data-Quality Gate — pure pass/fail check over a metric envelope
// =============================================================================
//
// The gate is the first layer of the decision pipeline: an envelope that
// fails here produces a NOOP decision with the gate reason attached.  It is
// a pure function of (envelope, config) so that replay re-derives identical
// verdicts from logged envelopes.
//
// Two modes:
//   V1_NO_LATENCY      — metric presence + spread + liquidity checks only.
//   V2_NETWORK_LATENCY — V1 plus a canonical-vs-exchange clock skew bound.
//
// V1 always reports `network_latency_ms = None` and never gates on it.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::MetricsEnvelope;

/// Gate evaluation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateMode {
    #[serde(rename = "V1_NO_LATENCY", alias = "V1")]
    V1NoLatency,
    #[serde(rename = "V2_NETWORK_LATENCY", alias = "V2")]
    V2NetworkLatency,
}

impl Default for GateMode {
    fn default() -> Self {
        Self::V1NoLatency
    }
}

/// Why the gate failed. Ordered by reporting priority: when several checks
/// fail at once, the highest-priority reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    MissingMetrics,
    SpreadTooWide,
    InsufficientLiquidity,
    NetworkLatencyTooHigh,
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMetrics => write!(f, "missing_metrics"),
            Self::SpreadTooWide => write!(f, "spread_too_wide"),
            Self::InsufficientLiquidity => write!(f, "insufficient_liquidity"),
            Self::NetworkLatencyTooHigh => write!(f, "network_latency_too_high"),
        }
    }
}

/// Individual check outcomes, kept for auditability of every verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateChecks {
    /// All required metrics present and finite.
    pub metrics_present: bool,
    pub spread_ok: bool,
    pub liquidity_ok: bool,
    /// None in V1 mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ok: Option<bool>,
}

/// Verdict of one gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub mode: GateMode,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<GateReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_latency_ms: Option<i64>,
    pub checks: GateChecks,
}

/// Gate thresholds, frozen at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub mode: GateMode,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default = "default_min_obi_deep")]
    pub min_obi_deep: f64,
    /// Only consulted in V2 mode.
    #[serde(default = "default_max_network_latency_ms")]
    pub max_network_latency_ms: i64,
}

fn default_max_spread_pct() -> f64 {
    0.08
}

fn default_min_obi_deep() -> f64 {
    0.05
}

fn default_max_network_latency_ms() -> i64 {
    1000
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mode: GateMode::default(),
            max_spread_pct: default_max_spread_pct(),
            min_obi_deep: default_min_obi_deep(),
            max_network_latency_ms: default_max_network_latency_ms(),
        }
    }
}

/// Evaluate the gate for one envelope.
///
/// Required metrics: spread_pct, obi_deep, delta_z, cvd_slope,
/// prints_per_second — all must be present and finite.
pub fn evaluate(envelope: &MetricsEnvelope, cfg: &GateConfig) -> GateResult {
    let spread = envelope.spread_pct.filter(|s| s.is_finite());
    let flow = envelope.flow.as_ref();

    let metrics_present = spread.is_some()
        && envelope.prints_per_second.is_finite()
        && flow.map_or(false, |m| {
            m.obi_deep.is_finite() && m.delta_z.is_finite() && m.cvd_slope.is_finite()
        });

    let spread_ok = spread.map_or(false, |s| s <= cfg.max_spread_pct);
    let liquidity_ok = flow.map_or(false, |m| m.obi_deep.abs() >= cfg.min_obi_deep);

    let (network_latency_ms, latency_ok) = match cfg.mode {
        GateMode::V1NoLatency => (None, None),
        GateMode::V2NetworkLatency => {
            let latency =
                (envelope.canonical_time_ms - envelope.exchange_event_time_ms).max(0);
            (Some(latency), Some(latency <= cfg.max_network_latency_ms))
        }
    };

    // Reason priority: missing > spread > liquidity > latency.
    let reason = if !metrics_present {
        Some(GateReason::MissingMetrics)
    } else if !spread_ok {
        Some(GateReason::SpreadTooWide)
    } else if !liquidity_ok {
        Some(GateReason::InsufficientLiquidity)
    } else if latency_ok == Some(false) {
        Some(GateReason::NetworkLatencyTooHigh)
    } else {
        None
    };

    GateResult {
        mode: cfg.mode,
        passed: reason.is_none(),
        reason,
        network_latency_ms,
        checks: GateChecks {
            metrics_present,
            spread_ok,
            liquidity_ok,
            latency_ok,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowSnapshot;

    fn envelope(spread: f64, obi_deep: f64, delta_z: f64, cvd_slope: f64) -> MetricsEnvelope {
        MetricsEnvelope {
            symbol: "BTCUSDT".into(),
            canonical_time_ms: 1_000,
            exchange_event_time_ms: 1_000,
            spread_pct: Some(spread),
            prints_per_second: 4.0,
            best_bid: Some(100.0),
            best_ask: Some(100.1),
            flow: Some(FlowSnapshot {
                obi_weighted: obi_deep,
                obi_deep,
                obi_divergence: 0.0,
                delta_z,
                cvd_slope,
                oi_delta_1m: 0.0,
                oi_delta_5m: 0.0,
            }),
        }
    }

    fn v1_config() -> GateConfig {
        GateConfig {
            mode: GateMode::V1NoLatency,
            max_spread_pct: 0.08,
            min_obi_deep: 0.05,
            max_network_latency_ms: 100,
        }
    }

    #[test]
    fn v1_pass() {
        let env = envelope(0.01, 0.3, 1.1, 0.2);
        let result = evaluate(&env, &v1_config());
        assert!(result.passed);
        assert_eq!(result.reason, None);
        assert_eq!(result.network_latency_ms, None);
        assert_eq!(result.checks.latency_ok, None);
    }

    #[test]
    fn v2_latency_fail() {
        let mut env = envelope(0.01, 0.3, 1.1, 0.2);
        env.canonical_time_ms = 2000;
        env.exchange_event_time_ms = 1;
        let cfg = GateConfig { mode: GateMode::V2NetworkLatency, ..v1_config() };
        let result = evaluate(&env, &cfg);
        assert!(!result.passed);
        assert_eq!(result.reason, Some(GateReason::NetworkLatencyTooHigh));
        assert_eq!(result.network_latency_ms, Some(1999));
    }

    #[test]
    fn missing_metrics_when_flow_absent() {
        let mut env = envelope(0.01, 0.3, 1.1, 0.2);
        env.flow = None;
        let result = evaluate(&env, &v1_config());
        assert!(!result.passed);
        assert_eq!(result.reason, Some(GateReason::MissingMetrics));
    }

    #[test]
    fn missing_metrics_when_nan() {
        let env = envelope(0.01, 0.3, f64::NAN, 0.2);
        let result = evaluate(&env, &v1_config());
        assert_eq!(result.reason, Some(GateReason::MissingMetrics));
    }

    #[test]
    fn reason_priority_missing_beats_spread() {
        // Spread would also fail, but the missing metric wins.
        let mut env = envelope(1.0, 0.3, 1.1, 0.2);
        env.flow = None;
        let result = evaluate(&env, &v1_config());
        assert_eq!(result.reason, Some(GateReason::MissingMetrics));
    }

    #[test]
    fn reason_priority_spread_beats_liquidity() {
        let env = envelope(1.0, 0.0, 1.1, 0.2);
        let result = evaluate(&env, &v1_config());
        assert_eq!(result.reason, Some(GateReason::SpreadTooWide));
        assert!(!result.checks.liquidity_ok);
    }

    #[test]
    fn insufficient_liquidity_on_shallow_obi() {
        let env = envelope(0.01, 0.01, 1.1, 0.2);
        let result = evaluate(&env, &v1_config());
        assert!(!result.passed);
        assert_eq!(result.reason, Some(GateReason::InsufficientLiquidity));
    }

    #[test]
    fn negative_obi_counts_as_liquidity() {
        // Liquidity check is on |obi_deep|.
        let env = envelope(0.01, -0.3, 1.1, 0.2);
        let result = evaluate(&env, &v1_config());
        assert!(result.passed);
    }

    #[test]
    fn evaluation_is_pure() {
        let env = envelope(0.01, 0.3, 1.1, 0.2);
        let cfg = v1_config();
        let a = serde_json::to_string(&evaluate(&env, &cfg)).unwrap();
        let b = serde_json::to_string(&evaluate(&env, &cfg)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn v2_clamps_negative_latency_to_zero() {
        let mut env = envelope(0.01, 0.3, 1.1, 0.2);
        env.canonical_time_ms = 500;
        env.exchange_event_time_ms = 900;
        let cfg = GateConfig { mode: GateMode::V2NetworkLatency, ..v1_config() };
        let result = evaluate(&env, &cfg);
        assert_eq!(result.network_latency_ms, Some(0));
        assert!(result.passed);
    }

    #[test]
    fn mode_aliases_deserialize() {
        let m: GateMode = serde_json::from_str("\"V1\"").unwrap();
        assert_eq!(m, GateMode::V1NoLatency);
        let m: GateMode = serde_json::from_str("\"V2_NETWORK_LATENCY\"").unwrap();
        assert_eq!(m, GateMode::V2NetworkLatency);
    }
}
