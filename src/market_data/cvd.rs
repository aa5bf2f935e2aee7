// =============================================================================
// CVD Engine — multi-horizon cumulative volume delta with exhaustion flag
// =============================================================================
//
// CVD is the running sum of signed aggressive quote volume (taker buys
// positive, taker sells negative).  One frame per configured horizon keeps a
// ring of (time, signed volume) points; each frame reports the cumulative
// CVD, the windowed delta, and an exhaustion flag raised when the flow is
// still one-sided but monotonically decelerating across the window.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::Trade;

/// Number of equal sub-spans the window is split into for the deceleration
/// check.
const EXHAUSTION_SLICES: usize = 3;

/// Per-horizon view emitted to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvdFrameSummary {
    pub window_s: u64,
    /// Cumulative delta since engine start.
    pub cvd: f64,
    /// Signed volume summed over the window.
    pub delta: f64,
    /// True when same-signed flow is monotonically decelerating.
    pub exhaustion: bool,
}

struct CvdFrame {
    window_ms: i64,
    points: VecDeque<(i64, f64)>,
}

impl CvdFrame {
    fn add(&mut self, event_time_ms: i64, signed_volume: f64) {
        self.points.push_back((event_time_ms, signed_volume));
        let cutoff = event_time_ms - self.window_ms;
        while self
            .points
            .front()
            .map(|&(t, _)| t < cutoff)
            .unwrap_or(false)
        {
            self.points.pop_front();
        }
    }

    fn delta(&self) -> f64 {
        self.points.iter().map(|&(_, v)| v).sum()
    }

    /// Monotonic-deceleration check: split the window into equal slices; the
    /// flag is raised when every slice's delta shares one sign and each
    /// slice's magnitude is strictly smaller than the one before it.
    fn exhaustion(&self) -> bool {
        let Some(&(first_t, _)) = self.points.front() else {
            return false;
        };
        let Some(&(last_t, _)) = self.points.back() else {
            return false;
        };
        let span = last_t - first_t;
        if span <= 0 || self.points.len() < EXHAUSTION_SLICES {
            return false;
        }

        let mut slices = [0.0f64; EXHAUSTION_SLICES];
        for &(t, v) in &self.points {
            let idx = (((t - first_t) as f64 / (span + 1) as f64) * EXHAUSTION_SLICES as f64)
                as usize;
            slices[idx.min(EXHAUSTION_SLICES - 1)] += v;
        }

        let sign = slices[0].signum();
        if sign == 0.0 {
            return false;
        }
        slices.iter().all(|s| s.signum() == sign)
            && slices.windows(2).all(|w| w[1].abs() < w[0].abs())
    }
}

/// Multi-horizon CVD aggregator for one symbol.
pub struct CvdEngine {
    frames: Vec<CvdFrame>,
    cumulative: f64,
}

impl CvdEngine {
    /// Build one frame per horizon (seconds).
    pub fn new(timeframes_s: &[u64]) -> Self {
        Self {
            frames: timeframes_s
                .iter()
                .map(|&s| CvdFrame {
                    window_ms: (s * 1000) as i64,
                    points: VecDeque::new(),
                })
                .collect(),
            cumulative: 0.0,
        }
    }

    pub fn add(&mut self, trade: &Trade) {
        let signed = trade.signed_volume();
        self.cumulative += signed;
        for frame in &mut self.frames {
            frame.add(trade.event_time_ms, signed);
        }
    }

    /// Cumulative delta since engine start.
    pub fn cumulative(&self) -> f64 {
        self.cumulative
    }

    pub fn summary(&self) -> Vec<CvdFrameSummary> {
        self.frames
            .iter()
            .map(|f| CvdFrameSummary {
                window_s: (f.window_ms / 1000) as u64,
                cvd: self.cumulative,
                delta: f.delta(),
                exhaustion: f.exhaustion(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn trade(qty: f64, side: Side, t: i64) -> Trade {
        Trade {
            price: 100.0,
            quantity: qty,
            side,
            event_time_ms: t,
        }
    }

    #[test]
    fn cumulative_and_windowed_delta() {
        let mut engine = CvdEngine::new(&[60]);
        engine.add(&trade(1.0, Side::Buy, 0));
        engine.add(&trade(2.0, Side::Sell, 1_000));
        let s = &engine.summary()[0];
        assert!((s.cvd + 100.0).abs() < 1e-9);
        assert!((s.delta + 100.0).abs() < 1e-9);
    }

    #[test]
    fn window_prunes_old_points_but_keeps_cumulative() {
        let mut engine = CvdEngine::new(&[60]);
        engine.add(&trade(1.0, Side::Buy, 0));
        engine.add(&trade(1.0, Side::Buy, 120_000));
        let s = &engine.summary()[0];
        // The t=0 point left the window; the cumulative survives.
        assert!((s.delta - 100.0).abs() < 1e-9);
        assert!((s.cvd - 200.0).abs() < 1e-9);
    }

    #[test]
    fn one_frame_per_horizon() {
        let engine = CvdEngine::new(&[60, 300, 900]);
        let summary = engine.summary();
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].window_s, 60);
        assert_eq!(summary[2].window_s, 900);
    }

    #[test]
    fn exhaustion_on_decelerating_one_sided_flow() {
        let mut engine = CvdEngine::new(&[60]);
        // Three slices of ~20 s with shrinking buy volume: 10, 4, 1.
        engine.add(&trade(10.0, Side::Buy, 0));
        engine.add(&trade(4.0, Side::Buy, 25_000));
        engine.add(&trade(1.0, Side::Buy, 50_000));
        let s = &engine.summary()[0];
        assert!(s.exhaustion);
    }

    #[test]
    fn no_exhaustion_on_accelerating_flow() {
        let mut engine = CvdEngine::new(&[60]);
        engine.add(&trade(1.0, Side::Buy, 0));
        engine.add(&trade(4.0, Side::Buy, 25_000));
        engine.add(&trade(10.0, Side::Buy, 50_000));
        assert!(!engine.summary()[0].exhaustion);
    }

    #[test]
    fn no_exhaustion_on_mixed_sign_flow() {
        let mut engine = CvdEngine::new(&[60]);
        engine.add(&trade(10.0, Side::Buy, 0));
        engine.add(&trade(4.0, Side::Sell, 25_000));
        engine.add(&trade(1.0, Side::Buy, 50_000));
        assert!(!engine.summary()[0].exhaustion);
    }
}
