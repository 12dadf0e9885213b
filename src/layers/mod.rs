//! Layer aggregation and search sessions.

pub mod aggregator;
pub mod session;

pub use aggregator::{LayerState, ResultAggregator};
pub use session::{SearchController, SearchSession, SessionUpdate};
