pub mod ingestor;
pub mod open_interest;
pub mod snapshot;

pub use ingestor::FeedIngestor;
pub use snapshot::{SnapshotFetcher, SnapshotFetcherHealth, SnapshotOutcome};
