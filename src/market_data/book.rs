// =============================================================================
// Book State — sequence-validated L2 depth book for a single symbol
// =============================================================================
//
// The book is rebuilt from a REST snapshot and kept current by applying
// diff-stream updates validated against the venue's U/u sequence pair.
// Diffs that arrive before the seed (or during a resync) are buffered and
// replayed once the snapshot lands.  A bounded forward gap is tolerated and
// applied anyway: a slightly lossy book beats hammering the snapshot
// endpoint on every dropped frame.
//
// Lifecycle:
//   Unseeded  — no snapshot yet; diffs buffer.
//   Resyncing — snapshot requested after a desync; diffs buffer.
//   Live      — diffs apply under the sequence contract.
//   Stale     — repeated snapshot failures; diffs still apply and the first
//               successful apply restores Live.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{DepthDiff, DepthSnapshot};

/// Pending-diff buffer capacity; oldest entries are evicted on overflow.
const BUFFER_CAP: usize = 1000;

/// Book lifecycle governing whether metrics may be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookLifecycle {
    Unseeded,
    Resyncing,
    Live,
    Stale,
}

/// Counters surfaced in health output.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BookStats {
    pub applied: u64,
    pub dropped: u64,
    pub buffered: u64,
    pub desyncs: u64,
}

/// Outcome of [`BookState::apply_diff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Buffered,
    Desync,
}

/// Per-symbol L2 book with sequence tracking.
pub struct BookState {
    symbol: String,
    bids: BTreeMap<Decimal, f64>,
    asks: BTreeMap<Decimal, f64>,
    last_update_id: u64,
    buffer: VecDeque<DepthDiff>,
    lifecycle: BookLifecycle,
    stats: BookStats,
    /// U/u of the most recently observed diff, for health output.
    last_seen_ids: Option<(u64, u64)>,
    max_gap_tolerance: u64,
    last_event_time_ms: i64,
}

impl BookState {
    pub fn new(symbol: impl Into<String>, max_gap_tolerance: u64) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            buffer: VecDeque::new(),
            lifecycle: BookLifecycle::Unseeded,
            stats: BookStats::default(),
            last_seen_ids: None,
            max_gap_tolerance,
            last_event_time_ms: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn lifecycle(&self) -> BookLifecycle {
        self.lifecycle
    }

    pub fn stats(&self) -> BookStats {
        self.stats
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn last_seen_ids(&self) -> Option<(u64, u64)> {
        self.last_seen_ids
    }

    pub fn last_event_time_ms(&self) -> i64 {
        self.last_event_time_ms
    }

    /// Enter the Resyncing state: subsequent diffs buffer until the snapshot
    /// arrives.
    pub fn mark_resyncing(&mut self) {
        self.lifecycle = BookLifecycle::Resyncing;
    }

    /// Degrade to Stale after repeated snapshot failures. Diffs keep
    /// applying; the first successful apply restores Live.
    pub fn mark_stale(&mut self) {
        warn!(symbol = %self.symbol, "book degraded to STALE");
        self.lifecycle = BookLifecycle::Stale;
    }

    // -------------------------------------------------------------------------
    // Snapshot seeding
    // -------------------------------------------------------------------------

    /// Replace the book contents with a REST snapshot, then replay any
    /// buffered diffs in arrival order (dropping those the snapshot already
    /// covers).
    pub fn apply_snapshot(&mut self, snap: &DepthSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for &(price, size) in &snap.bids {
            if size > 0.0 {
                self.bids.insert(price, size);
            }
        }
        for &(price, size) in &snap.asks {
            if size > 0.0 {
                self.asks.insert(price, size);
            }
        }

        self.last_update_id = snap.last_update_id;
        self.lifecycle = BookLifecycle::Live;

        let pending = std::mem::take(&mut self.buffer);
        let replayed = pending.len();
        for diff in pending {
            if diff.final_update_id <= self.last_update_id {
                self.stats.dropped += 1;
                continue;
            }
            self.apply_diff(diff);
        }

        debug!(
            symbol = %self.symbol,
            last_update_id = self.last_update_id,
            replayed,
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            "snapshot applied"
        );
    }

    // -------------------------------------------------------------------------
    // Diff application
    // -------------------------------------------------------------------------

    /// Validate and apply one depth diff.
    ///
    /// Sequence contract in Live/Stale state, with `last` the current
    /// `last_update_id`:
    ///   - `u <= last`            — already covered; benign drop.
    ///   - `U <= last + 1 <= u`   — contiguous; apply.
    ///   - `0 < U - (last+1) <= max_gap_tolerance` — small gap; apply anyway.
    ///   - otherwise              — desync; caller should trigger a resync.
    pub fn apply_diff(&mut self, diff: DepthDiff) -> ApplyOutcome {
        self.last_seen_ids = Some((diff.first_update_id, diff.final_update_id));

        if matches!(
            self.lifecycle,
            BookLifecycle::Unseeded | BookLifecycle::Resyncing
        ) {
            if self.buffer.len() >= BUFFER_CAP {
                self.buffer.pop_front();
            }
            self.buffer.push_back(diff);
            self.stats.buffered += 1;
            return ApplyOutcome::Buffered;
        }

        if diff.final_update_id <= self.last_update_id {
            self.stats.dropped += 1;
            return ApplyOutcome::Applied;
        }

        let next = self.last_update_id + 1;
        let gap = diff.first_update_id as i64 - next as i64;

        if gap <= 0 && diff.final_update_id >= next {
            self.apply(&diff);
            self.stats.applied += 1;
            return ApplyOutcome::Applied;
        }

        if gap > 0 && gap as u64 <= self.max_gap_tolerance {
            debug!(
                symbol = %self.symbol,
                gap,
                first_update_id = diff.first_update_id,
                "tolerated sequence gap"
            );
            self.apply(&diff);
            self.stats.applied += 1;
            return ApplyOutcome::Applied;
        }

        warn!(
            symbol = %self.symbol,
            expected = next,
            first_update_id = diff.first_update_id,
            final_update_id = diff.final_update_id,
            "depth diff out of sequence"
        );
        self.stats.desyncs += 1;
        ApplyOutcome::Desync
    }

    /// Unconditionally apply the diff's levels and advance the sequence.
    fn apply(&mut self, diff: &DepthDiff) {
        for &(price, size) in &diff.bids {
            if size == 0.0 {
                self.bids.remove(&price);
            } else {
                self.bids.insert(price, size);
            }
        }
        for &(price, size) in &diff.asks {
            if size == 0.0 {
                self.asks.remove(&price);
            } else {
                self.asks.insert(price, size);
            }
        }
        self.last_update_id = diff.final_update_id;
        self.last_event_time_ms = diff.event_time_ms;
        if self.lifecycle == BookLifecycle::Stale {
            self.lifecycle = BookLifecycle::Live;
        }
    }

    // -------------------------------------------------------------------------
    // Read side
    // -------------------------------------------------------------------------

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids
            .iter()
            .next_back()
            .map(|(p, &s)| (p.to_f64().unwrap_or(0.0), s))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks
            .iter()
            .next()
            .map(|(p, &s)| (p.to_f64().unwrap_or(0.0), s))
    }

    pub fn mid_price(&self) -> Option<f64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((bid + ask) / 2.0)
    }

    /// Spread as a percentage of mid price.
    pub fn spread_pct(&self) -> Option<f64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        let mid = (bid + ask) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some((ask - bid) / mid * 100.0)
    }

    /// Top `n` levels per side: bids descending, asks ascending.
    pub fn top_levels(&self, n: usize) -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, &s)| [p.to_f64().unwrap_or(0.0), s])
            .collect();
        let asks = self
            .asks
            .iter()
            .take(n)
            .map(|(p, &s)| [p.to_f64().unwrap_or(0.0), s])
            .collect();
        (bids, asks)
    }

    /// Plain volume imbalance over the top `levels` per side, in [-1, 1].
    pub fn obi_deep(&self, levels: usize) -> Option<f64> {
        if self.bids.is_empty() || self.asks.is_empty() {
            return None;
        }
        let bid_vol: f64 = self.bids.iter().rev().take(levels).map(|(_, &s)| s).sum();
        let ask_vol: f64 = self.asks.iter().take(levels).map(|(_, &s)| s).sum();
        let total = bid_vol + ask_vol;
        if total <= 0.0 {
            return None;
        }
        Some((bid_vol - ask_vol) / total)
    }

    /// Distance-weighted imbalance: levels nearer the touch weigh more
    /// (weight `1 / (1 + rank)`).
    pub fn obi_weighted(&self, levels: usize) -> Option<f64> {
        if self.bids.is_empty() || self.asks.is_empty() {
            return None;
        }
        let bid_vol: f64 = self
            .bids
            .iter()
            .rev()
            .take(levels)
            .enumerate()
            .map(|(i, (_, &s))| s / (1.0 + i as f64))
            .sum();
        let ask_vol: f64 = self
            .asks
            .iter()
            .take(levels)
            .enumerate()
            .map(|(i, (_, &s))| s / (1.0 + i as f64))
            .sum();
        let total = bid_vol + ask_vol;
        if total <= 0.0 {
            return None;
        }
        Some((bid_vol - ask_vol) / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn diff(first: u64, last: u64, bids: Vec<(Decimal, f64)>, asks: Vec<(Decimal, f64)>) -> DepthDiff {
        DepthDiff {
            first_update_id: first,
            final_update_id: last,
            bids,
            asks,
            event_time_ms: 1_000,
        }
    }

    fn seeded_book() -> BookState {
        let mut book = BookState::new("BTCUSDT", 100);
        book.apply_snapshot(&DepthSnapshot {
            last_update_id: 100,
            bids: vec![(dec!(10), 1.0)],
            asks: vec![(dec!(11), 1.0)],
        });
        book
    }

    #[test]
    fn seed_then_contiguous_diff() {
        let mut book = seeded_book();
        assert_eq!(book.lifecycle(), BookLifecycle::Live);

        let outcome = book.apply_diff(diff(101, 101, vec![(dec!(10), 2.0)], vec![]));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.best_bid(), Some((10.0, 2.0)));
        assert_eq!(book.last_update_id(), 101);
        assert_eq!(book.lifecycle(), BookLifecycle::Live);
    }

    #[test]
    fn tolerant_gap_applies_and_deletes_level() {
        let mut book = seeded_book();
        book.apply_diff(diff(101, 101, vec![(dec!(10), 2.0)], vec![]));
        let desyncs_before = book.stats().desyncs;

        let outcome = book.apply_diff(diff(110, 111, vec![], vec![(dec!(11), 0.0)]));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.last_update_id(), 111);
        assert_eq!(book.stats().desyncs, desyncs_before);
        assert_eq!(book.stats().applied, 2);
    }

    #[test]
    fn hard_desync_leaves_book_untouched() {
        let mut book = seeded_book();
        let outcome = book.apply_diff(diff(500, 500, vec![(dec!(9), 1.0)], vec![]));
        assert_eq!(outcome, ApplyOutcome::Desync);
        assert_eq!(book.stats().desyncs, 1);
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.best_bid(), Some((10.0, 1.0)));
    }

    #[test]
    fn stale_diff_is_benign_drop() {
        let mut book = seeded_book();
        let outcome = book.apply_diff(diff(90, 95, vec![(dec!(1), 1.0)], vec![]));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(book.stats().dropped, 1);
        assert_eq!(book.last_update_id(), 100);
        assert!(book.best_bid().map(|(p, _)| p > 1.0).unwrap_or(false));
    }

    #[test]
    fn unseeded_diffs_buffer_and_replay_after_snapshot() {
        let mut book = BookState::new("ETHUSDT", 100);
        assert_eq!(
            book.apply_diff(diff(99, 100, vec![(dec!(5), 1.0)], vec![])),
            ApplyOutcome::Buffered
        );
        assert_eq!(
            book.apply_diff(diff(101, 102, vec![(dec!(6), 2.0)], vec![])),
            ApplyOutcome::Buffered
        );
        assert_eq!(book.stats().buffered, 2);

        book.apply_snapshot(&DepthSnapshot {
            last_update_id: 100,
            bids: vec![(dec!(5), 9.0)],
            asks: vec![(dec!(7), 1.0)],
        });

        // First buffered diff (u=100) is covered by the snapshot and dropped;
        // the second applies.
        assert_eq!(book.lifecycle(), BookLifecycle::Live);
        assert_eq!(book.last_update_id(), 102);
        assert_eq!(book.best_bid(), Some((6.0, 2.0)));
        assert_eq!(book.stats().dropped, 1);
    }

    #[test]
    fn buffer_drops_oldest_on_overflow() {
        let mut book = BookState::new("ETHUSDT", 100);
        for i in 0..(BUFFER_CAP as u64 + 5) {
            book.apply_diff(diff(i + 1, i + 1, vec![], vec![]));
        }
        assert_eq!(book.buffer.len(), BUFFER_CAP);
        // Oldest entries were evicted.
        assert_eq!(book.buffer.front().unwrap().first_update_id, 6);
    }

    #[test]
    fn resyncing_buffers_until_snapshot() {
        let mut book = seeded_book();
        book.mark_resyncing();
        assert_eq!(
            book.apply_diff(diff(300, 301, vec![(dec!(12), 1.0)], vec![])),
            ApplyOutcome::Buffered
        );
        book.apply_snapshot(&DepthSnapshot {
            last_update_id: 299,
            bids: vec![(dec!(10), 1.0)],
            asks: vec![(dec!(11), 1.0)],
        });
        assert_eq!(book.last_update_id(), 301);
        assert_eq!(book.lifecycle(), BookLifecycle::Live);
    }

    #[test]
    fn stale_book_restores_live_on_apply() {
        let mut book = seeded_book();
        book.mark_stale();
        assert_eq!(book.lifecycle(), BookLifecycle::Stale);
        book.apply_diff(diff(101, 101, vec![(dec!(10), 3.0)], vec![]));
        assert_eq!(book.lifecycle(), BookLifecycle::Live);
    }

    #[test]
    fn last_update_id_is_monotonic_and_no_zero_levels() {
        let mut book = seeded_book();
        let mut prev = book.last_update_id();
        let updates = [
            diff(101, 102, vec![(dec!(9.5), 1.0)], vec![(dec!(11.5), 0.5)]),
            diff(90, 95, vec![], vec![]),               // stale drop
            diff(103, 103, vec![(dec!(9.5), 0.0)], vec![]),
            diff(150, 151, vec![(dec!(9.9), 2.0)], vec![]), // tolerated gap
        ];
        for d in updates {
            book.apply_diff(d);
            assert!(book.last_update_id() >= prev);
            prev = book.last_update_id();
        }
        assert!(book.bids.values().all(|&s| s > 0.0));
        assert!(book.asks.values().all(|&s| s > 0.0));
    }

    #[test]
    fn spread_and_mid() {
        let book = seeded_book();
        let mid = book.mid_price().unwrap();
        assert!((mid - 10.5).abs() < 1e-9);
        let spread = book.spread_pct().unwrap();
        assert!((spread - (1.0 / 10.5 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn obi_signs() {
        let mut book = BookState::new("BTCUSDT", 100);
        book.apply_snapshot(&DepthSnapshot {
            last_update_id: 1,
            bids: vec![(dec!(10), 3.0), (dec!(9), 3.0)],
            asks: vec![(dec!(11), 1.0)],
        });
        assert!(book.obi_deep(20).unwrap() > 0.0);
        assert!(book.obi_weighted(20).unwrap() > 0.0);

        let mut book = BookState::new("BTCUSDT", 100);
        book.apply_snapshot(&DepthSnapshot {
            last_update_id: 1,
            bids: vec![(dec!(10), 1.0)],
            asks: vec![(dec!(11), 5.0)],
        });
        assert!(book.obi_deep(20).unwrap() < 0.0);
    }

    #[test]
    fn obi_none_when_side_empty() {
        let mut book = BookState::new("BTCUSDT", 100);
        book.apply_snapshot(&DepthSnapshot {
            last_update_id: 1,
            bids: vec![(dec!(10), 1.0)],
            asks: vec![],
        });
        assert_eq!(book.obi_deep(20), None);
        assert_eq!(book.spread_pct(), None);
    }

    #[test]
    fn top_levels_ordering() {
        let mut book = BookState::new("BTCUSDT", 100);
        book.apply_snapshot(&DepthSnapshot {
            last_update_id: 1,
            bids: vec![(dec!(9), 1.0), (dec!(10), 2.0), (dec!(8), 3.0)],
            asks: vec![(dec!(12), 1.0), (dec!(11), 2.0)],
        });
        let (bids, asks) = book.top_levels(2);
        assert_eq!(bids, vec![[10.0, 2.0], [9.0, 1.0]]);
        assert_eq!(asks, vec![[11.0, 2.0], [12.0, 1.0]]);
    }
}
