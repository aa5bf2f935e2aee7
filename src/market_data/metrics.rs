// =============================================================================
// Flow Metrics — OBI, delta-Z, CVD slope, and open-interest deltas
// =============================================================================
//
// Derivations feeding the decision gate:
//
//   obi_deep / obi_weighted — book imbalance read directly off BookState.
//   delta_z    — Z-score of the current trade-side imbalance against its own
//                recent history.  Imbalance = (buy - sell) / (buy + sell)
//                over the tape window, sampled on every trade.
//   cvd_slope  — least-squares slope of cumulative volume delta over the
//                window, normalized by per-second traded volume so the
//                threshold is comparable across symbols.
//   oi_delta   — open interest change over 1 m / 5 m horizons, fed by a
//                periodic REST poll.
// =============================================================================

use std::collections::VecDeque;

use crate::market_data::book::BookState;
use crate::types::{FlowSnapshot, Side, Trade};

/// Book depth used for the deep imbalance read.
const OBI_DEPTH_LEVELS: usize = 20;

/// History cap for imbalance samples backing the Z-score.
const IMBALANCE_HISTORY_CAP: usize = 600;

/// Per-symbol derived-metric state.
pub struct FlowMetrics {
    window_ms: i64,
    /// (event_time, signed quote volume) per trade within the window.
    signed_volumes: VecDeque<(i64, f64)>,
    /// Rolling history of window-imbalance samples for the Z-score.
    imbalance_history: VecDeque<f64>,
    /// (event_time, cumulative cvd) per trade within the window.
    cvd_points: VecDeque<(i64, f64)>,
    cvd_cumulative: f64,
    /// (poll_time, open interest) samples, kept a bit past the 5 m horizon.
    oi_samples: VecDeque<(i64, f64)>,
}

impl FlowMetrics {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            signed_volumes: VecDeque::new(),
            imbalance_history: VecDeque::new(),
            cvd_points: VecDeque::new(),
            cvd_cumulative: 0.0,
            oi_samples: VecDeque::new(),
        }
    }

    /// Ingest one trade: update signed-volume and CVD rings and sample the
    /// current imbalance into the Z-score history.
    pub fn add_trade(&mut self, trade: &Trade) {
        let now = trade.event_time_ms;
        let signed = trade.signed_volume();

        self.signed_volumes.push_back((now, signed));
        self.cvd_cumulative += signed;
        self.cvd_points.push_back((now, self.cvd_cumulative));

        let cutoff = now - self.window_ms;
        while self
            .signed_volumes
            .front()
            .map(|&(t, _)| t < cutoff)
            .unwrap_or(false)
        {
            self.signed_volumes.pop_front();
        }
        while self
            .cvd_points
            .front()
            .map(|&(t, _)| t < cutoff)
            .unwrap_or(false)
        {
            self.cvd_points.pop_front();
        }

        if let Some(imbalance) = self.window_imbalance() {
            self.imbalance_history.push_back(imbalance);
            while self.imbalance_history.len() > IMBALANCE_HISTORY_CAP {
                self.imbalance_history.pop_front();
            }
        }
    }

    /// Record an open-interest poll result.
    pub fn record_open_interest(&mut self, poll_time_ms: i64, open_interest: f64) {
        self.oi_samples.push_back((poll_time_ms, open_interest));
        let cutoff = poll_time_ms - 6 * 60_000;
        while self
            .oi_samples
            .front()
            .map(|&(t, _)| t < cutoff)
            .unwrap_or(false)
        {
            self.oi_samples.pop_front();
        }
    }

    /// Trade-side imbalance over the window: (buy - sell) / (buy + sell).
    fn window_imbalance(&self) -> Option<f64> {
        let mut buy = 0.0;
        let mut sell = 0.0;
        for &(_, v) in &self.signed_volumes {
            if v >= 0.0 {
                buy += v;
            } else {
                sell += -v;
            }
        }
        let total = buy + sell;
        if total <= 0.0 {
            return None;
        }
        Some((buy - sell) / total)
    }

    /// Z-score of the latest imbalance sample against the rolling history.
    /// Zero when the history has no variance yet.
    fn delta_z(&self) -> f64 {
        let n = self.imbalance_history.len();
        if n < 2 {
            return 0.0;
        }
        let latest = *self.imbalance_history.back().expect("n >= 2");
        let mean: f64 = self.imbalance_history.iter().sum::<f64>() / n as f64;
        let var: f64 = self
            .imbalance_history
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        let std = var.sqrt();
        if std < 1e-12 {
            return 0.0;
        }
        (latest - mean) / std
    }

    /// Least-squares slope of the CVD series (quote volume per second),
    /// normalized by the window's per-second traded volume.
    fn cvd_slope(&self) -> f64 {
        let n = self.cvd_points.len();
        if n < 2 {
            return 0.0;
        }

        let t0 = self.cvd_points.front().expect("n >= 2").0;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xy = 0.0;
        let mut sum_xx = 0.0;
        for &(t, cvd) in &self.cvd_points {
            let x = (t - t0) as f64 / 1000.0;
            sum_x += x;
            sum_y += cvd;
            sum_xy += x * cvd;
            sum_xx += x * x;
        }
        let nf = n as f64;
        let denom = nf * sum_xx - sum_x * sum_x;
        if denom.abs() < 1e-12 {
            return 0.0;
        }
        let slope = (nf * sum_xy - sum_x * sum_y) / denom;

        let traded: f64 = self.signed_volumes.iter().map(|&(_, v)| v.abs()).sum();
        let per_second = traded / (self.window_ms as f64 / 1000.0);
        if per_second <= 0.0 {
            return 0.0;
        }
        slope / per_second
    }

    /// Open-interest change against the newest sample at least `horizon_ms`
    /// old. Zero until enough history exists.
    fn oi_delta(&self, horizon_ms: i64) -> f64 {
        let Some(&(now, current)) = self.oi_samples.back() else {
            return 0.0;
        };
        let target = now - horizon_ms;
        let past = self
            .oi_samples
            .iter()
            .rev()
            .find(|&&(t, _)| t <= target)
            .map(|&(_, oi)| oi);
        match past {
            Some(p) => current - p,
            None => 0.0,
        }
    }

    /// Full snapshot against the current book. None when either book side is
    /// empty.
    pub fn snapshot(&self, book: &BookState) -> Option<FlowSnapshot> {
        let obi_deep = book.obi_deep(OBI_DEPTH_LEVELS)?;
        let obi_weighted = book.obi_weighted(OBI_DEPTH_LEVELS)?;
        Some(FlowSnapshot {
            obi_weighted,
            obi_deep,
            obi_divergence: obi_weighted - obi_deep,
            delta_z: self.delta_z(),
            cvd_slope: self.cvd_slope(),
            oi_delta_1m: self.oi_delta(60_000),
            oi_delta_5m: self.oi_delta(300_000),
        })
    }
}
