//! Shared types for the prediction-market order-book harvester.
//!
//! This crate contains:
//! - The instrument data model (Instrument, ActiveSet, Outcome)
//! - Wire records emitted to the append-only logs (orderbook, market,
//!   poll_stats, poll_errors), schema version 1

pub mod records;
pub mod types;

pub use records::{
    MarketRecord, OrderbookRecord, PollErrorRecord, PollStatsRecord, SCHEMA_VERSION,
};
pub use types::*;
