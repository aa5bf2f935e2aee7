pub mod absorption;
pub mod book;
pub mod cvd;
pub mod metrics;
pub mod trade_tape;

// Re-export the per-symbol market state types for convenient access
// (e.g. `use crate::market_data::BookState`).
pub use absorption::{AbsorptionDetector, AbsorptionState};
pub use book::{ApplyOutcome, BookLifecycle, BookState, BookStats};
pub use cvd::{CvdEngine, CvdFrameSummary};
pub use metrics::FlowMetrics;
pub use trade_tape::{TapeSummary, TradeTape};

use crate::config::EngineConfig;
use crate::types::Trade;

/// All market state for one symbol, exclusively owned by the ingest task.
pub struct SymbolMarket {
    pub book: BookState,
    pub tape: TradeTape,
    pub cvd: CvdEngine,
    pub flow: FlowMetrics,
    pub absorption: AbsorptionState,
}

impl SymbolMarket {
    pub fn new(symbol: &str, cfg: &EngineConfig) -> Self {
        Self {
            book: BookState::new(symbol, cfg.max_gap_tolerance),
            tape: TradeTape::new(cfg.trade_window_ms),
            cvd: CvdEngine::new(&cfg.cvd_timeframes_s),
            flow: FlowMetrics::new(cfg.trade_window_ms),
            absorption: AbsorptionState::default(),
        }
    }

    /// Route one trade through every per-symbol aggregate and refresh the
    /// absorption read.
    pub fn ingest_trade(&mut self, trade: Trade, window_ms: i64) {
        self.tape.add(trade.clone());
        self.cvd.add(&trade);
        self.flow.add_trade(&trade);
        self.absorption =
            AbsorptionDetector::detect(&self.tape, window_ms, self.cvd.cumulative());
    }
}
