// =============================================================================
// Trade Tape — sliding-window aggregation of aggressive trades
// =============================================================================
//
// Keeps every trade inside a rolling window indexed by exchange event time
// (default 60 s) and derives tape-intensity metrics from it: aggressive
// buy/sell volume, a size-bucket histogram, the bid-hit-to-ask-lift ratio,
// the length of the current same-side burst, and prints per second.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::{Side, Trade};

/// Minimum sample count before histogram thresholds switch from the fixed
/// 1/10 defaults to the 33rd/66th size quantiles.
const QUANTILE_MIN_SAMPLES: usize = 10;

/// Size-bucket histogram of trade quantities within the window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SizeHistogram {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
    /// Quantity at or below which a trade counts as small.
    pub small_threshold: f64,
    /// Quantity above which a trade counts as large.
    pub large_threshold: f64,
}

/// Aggregated view of the tape window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapeSummary {
    /// Quote volume taken by aggressive buyers.
    pub buy_volume: f64,
    /// Quote volume taken by aggressive sellers.
    pub sell_volume: f64,
    pub trade_count: usize,
    pub histogram: SizeHistogram,
    /// Aggressive sells (bid hits) per aggressive buy (ask lift), by count.
    pub bid_hit_ask_lift_ratio: f64,
    /// Length of the same-side run at the tail of the tape.
    pub burst_count: u32,
    pub prints_per_second: f64,
}

/// Time-indexed ring of trades within the rolling window.
pub struct TradeTape {
    window_ms: i64,
    trades: VecDeque<Trade>,
}

impl TradeTape {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            trades: VecDeque::new(),
        }
    }

    /// Append a trade and evict everything older than the window relative to
    /// its event time.
    pub fn add(&mut self, trade: Trade) {
        let cutoff = trade.event_time_ms - self.window_ms;
        self.trades.push_back(trade);
        while self
            .trades
            .front()
            .map(|t| t.event_time_ms < cutoff)
            .unwrap_or(false)
        {
            self.trades.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.trades.back().map(|t| t.price)
    }

    /// Price range (high - low) over the most recent `span_ms` of the tape.
    pub fn price_range(&self, span_ms: i64) -> Option<(f64, f64)> {
        let last = self.trades.back()?.event_time_ms;
        let cutoff = last - span_ms;
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for t in self.trades.iter().rev() {
            if t.event_time_ms < cutoff {
                break;
            }
            lo = lo.min(t.price);
            hi = hi.max(t.price);
        }
        if lo.is_finite() {
            Some((lo, hi))
        } else {
            None
        }
    }

    /// Quote volume traded over the most recent `span_ms` of the tape.
    pub fn volume_in(&self, span_ms: i64) -> f64 {
        let Some(last) = self.trades.back().map(|t| t.event_time_ms) else {
            return 0.0;
        };
        let cutoff = last - span_ms;
        self.trades
            .iter()
            .rev()
            .take_while(|t| t.event_time_ms >= cutoff)
            .map(|t| t.price * t.quantity)
            .sum()
    }

    /// Derive the full tape summary.
    pub fn summary(&self) -> TapeSummary {
        let mut buy_volume = 0.0;
        let mut sell_volume = 0.0;
        let mut buy_count = 0usize;
        let mut sell_count = 0usize;

        for t in &self.trades {
            let vol = t.price * t.quantity;
            match t.side {
                Side::Buy => {
                    buy_volume += vol;
                    buy_count += 1;
                }
                Side::Sell => {
                    sell_volume += vol;
                    sell_count += 1;
                }
            }
        }

        let histogram = self.histogram();

        // Burst: same-side run at the tail.
        let mut burst_count = 0u32;
        let mut tail = self.trades.iter().rev();
        if let Some(last) = tail.next() {
            burst_count = 1;
            for t in tail {
                if t.side == last.side {
                    burst_count += 1;
                } else {
                    break;
                }
            }
        }

        let prints_per_second = if self.window_ms > 0 {
            self.trades.len() as f64 / (self.window_ms as f64 / 1000.0)
        } else {
            0.0
        };

        TapeSummary {
            buy_volume,
            sell_volume,
            trade_count: self.trades.len(),
            histogram,
            bid_hit_ask_lift_ratio: sell_count as f64 / buy_count.max(1) as f64,
            burst_count,
            prints_per_second,
        }
    }

    /// Size-bucket histogram with thresholds at the 33rd/66th quantiles once
    /// enough samples exist, else fixed 1/10 cutoffs.
    fn histogram(&self) -> SizeHistogram {
        let (small_threshold, large_threshold) = if self.trades.len() >= QUANTILE_MIN_SAMPLES {
            let mut sizes: Vec<f64> = self.trades.iter().map(|t| t.quantity).collect();
            sizes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let q = |frac: f64| {
                let idx = ((sizes.len() as f64 - 1.0) * frac).round() as usize;
                sizes[idx]
            };
            (q(0.33), q(0.66))
        } else {
            (1.0, 10.0)
        };

        let mut hist = SizeHistogram {
            small_threshold,
            large_threshold,
            ..SizeHistogram::default()
        };
        for t in &self.trades {
            if t.quantity <= small_threshold {
                hist.small += 1;
            } else if t.quantity <= large_threshold {
                hist.medium += 1;
            } else {
                hist.large += 1;
            }
        }
        hist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, qty: f64, side: Side, t: i64) -> Trade {
        Trade {
            price,
            quantity: qty,
            side,
            event_time_ms: t,
        }
    }

    #[test]
    fn window_eviction_by_event_time() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(100.0, 1.0, Side::Buy, 0));
        tape.add(trade(100.0, 1.0, Side::Buy, 30_000));
        tape.add(trade(100.0, 1.0, Side::Buy, 90_001));
        // The t=0 trade fell out of the 60 s window.
        assert_eq!(tape.len(), 2);
    }

    #[test]
    fn volumes_split_by_taker_side() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(100.0, 2.0, Side::Buy, 1_000));
        tape.add(trade(100.0, 1.0, Side::Sell, 2_000));
        let s = tape.summary();
        assert!((s.buy_volume - 200.0).abs() < 1e-9);
        assert!((s.sell_volume - 100.0).abs() < 1e-9);
        assert_eq!(s.trade_count, 2);
    }

    #[test]
    fn fixed_histogram_thresholds_below_min_samples() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(100.0, 0.5, Side::Buy, 1));
        tape.add(trade(100.0, 5.0, Side::Buy, 2));
        tape.add(trade(100.0, 50.0, Side::Buy, 3));
        let h = tape.summary().histogram;
        assert!((h.small_threshold - 1.0).abs() < f64::EPSILON);
        assert!((h.large_threshold - 10.0).abs() < f64::EPSILON);
        assert_eq!((h.small, h.medium, h.large), (1, 1, 1));
    }

    #[test]
    fn quantile_histogram_thresholds_with_enough_samples() {
        let mut tape = TradeTape::new(60_000);
        for i in 1..=12 {
            tape.add(trade(100.0, i as f64, Side::Buy, i));
        }
        let h = tape.summary().histogram;
        assert!(h.small_threshold > 1.0);
        assert!(h.large_threshold > h.small_threshold);
        assert!(h.small > 0 && h.medium > 0 && h.large > 0);
    }

    #[test]
    fn burst_counts_tail_run_only() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(100.0, 1.0, Side::Buy, 1));
        tape.add(trade(100.0, 1.0, Side::Sell, 2));
        tape.add(trade(100.0, 1.0, Side::Sell, 3));
        tape.add(trade(100.0, 1.0, Side::Sell, 4));
        assert_eq!(tape.summary().burst_count, 3);
    }

    #[test]
    fn prints_per_second_over_window() {
        let mut tape = TradeTape::new(60_000);
        for i in 0..120 {
            tape.add(trade(100.0, 1.0, Side::Buy, i * 100));
        }
        let s = tape.summary();
        assert!((s.prints_per_second - 2.0).abs() < 1e-9);
    }

    #[test]
    fn bid_hit_ratio_guards_zero_lifts() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(100.0, 1.0, Side::Sell, 1));
        tape.add(trade(100.0, 1.0, Side::Sell, 2));
        let s = tape.summary();
        assert!((s.bid_hit_ask_lift_ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn price_range_over_span() {
        let mut tape = TradeTape::new(60_000);
        tape.add(trade(100.0, 1.0, Side::Buy, 0));
        tape.add(trade(105.0, 1.0, Side::Buy, 9_000));
        tape.add(trade(103.0, 1.0, Side::Buy, 10_000));
        let (lo, hi) = tape.price_range(2_000).unwrap();
        assert!((lo - 103.0).abs() < 1e-9);
        assert!((hi - 105.0).abs() < 1e-9);
    }
}
