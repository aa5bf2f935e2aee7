// =============================================================================
// Absorption Detector — passive-liquidity absorption over the trade tape
// =============================================================================
//
// An "absorption" pattern occurs when resting liquidity soaks up aggressive
// flow.  On the tape it manifests as:
//
//   1. Very high traded volume in the most recent slice (> 2x the window
//      average slice volume)
//   2. Very small price range in that slice (< 0.5x the average slice range)
//   3. CVD confirmation — net flow direction matches the absorption side
//
// The detector is stateless: it reads the tape and the current CVD direction
// and produces a fresh state on every call.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::trade_tape::TradeTape;

/// Length of the slice compared against the window average.
const SLICE_MS: i64 = 5_000;
/// Minimum number of trades before detection is attempted.
const MIN_TRADES: usize = 20;
/// Volume multiple that qualifies as "very high".
const VOLUME_RATIO_MIN: f64 = 2.0;
/// Range fraction that qualifies as "very small".
const RANGE_RATIO_MAX: f64 = 0.5;

/// Result of absorption analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsorptionState {
    pub detected: bool,
    pub direction: String,
    pub strength: f64,
    pub cvd_confirmed: bool,
    pub volume_ratio: f64,
    pub range_ratio: f64,
    pub reason: String,
}

impl Default for AbsorptionState {
    fn default() -> Self {
        no_detection("No absorption pattern detected")
    }
}

/// Stateless absorption detector.
pub struct AbsorptionDetector;

impl AbsorptionDetector {
    /// Analyse the tape for absorption in its most recent slice.
    ///
    /// `cvd_direction`: positive = net buying, negative = net selling.
    pub fn detect(tape: &TradeTape, window_ms: i64, cvd_direction: f64) -> AbsorptionState {
        if tape.len() < MIN_TRADES {
            return no_detection("Insufficient trades");
        }

        let slices = (window_ms / SLICE_MS).max(1) as f64;
        let avg_slice_volume = tape.volume_in(window_ms) / slices;
        if avg_slice_volume < f64::EPSILON {
            return no_detection("Average volume is zero");
        }

        let Some((window_lo, window_hi)) = tape.price_range(window_ms) else {
            return no_detection("No price range");
        };
        let avg_range = (window_hi - window_lo) / slices;
        if avg_range < f64::EPSILON {
            return no_detection("Price range is zero");
        }

        let slice_volume = tape.volume_in(SLICE_MS);
        let Some((slice_lo, slice_hi)) = tape.price_range(SLICE_MS) else {
            return no_detection("No recent prints");
        };

        let volume_ratio = slice_volume / avg_slice_volume;
        let range_ratio = (slice_hi - slice_lo) / avg_range;

        if volume_ratio > VOLUME_RATIO_MIN && range_ratio < RANGE_RATIO_MAX {
            // Price holding against heavy selling reads bullish, and vice
            // versa.
            let direction = if cvd_direction < 0.0 { "BULLISH" } else { "BEARISH" };
            let cvd_confirmed = cvd_direction.abs() > f64::EPSILON;
            let strength =
                ((volume_ratio / 3.0).min(1.0) * (1.0 - range_ratio)).clamp(0.0, 1.0);

            let state = AbsorptionState {
                detected: true,
                direction: direction.to_string(),
                strength,
                cvd_confirmed,
                volume_ratio,
                range_ratio,
                reason: format!(
                    "Absorption {}: vol_ratio={:.2}x, range_ratio={:.3}, cvd_confirmed={}",
                    direction, volume_ratio, range_ratio, cvd_confirmed
                ),
            };

            debug!(
                direction = %state.direction,
                strength = format!("{:.3}", state.strength),
                "absorption detected"
            );

            return state;
        }

        no_detection("No absorption pattern detected")
    }
}

fn no_detection(reason: &str) -> AbsorptionState {
    AbsorptionState {
        detected: false,
        direction: "NONE".to_string(),
        strength: 0.0,
        cvd_confirmed: false,
        volume_ratio: 0.0,
        range_ratio: 0.0,
        reason: reason.to_string(),
    }
}
