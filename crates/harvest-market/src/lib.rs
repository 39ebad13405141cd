//! Venue integration for the order-book harvester.
//!
//! This crate is the only venue-specific seam in the system:
//! - The [`VenueClient`] trait (discovery + order-book fetch)
//! - The fetch / discovery / normalization error taxonomy
//! - Concrete clients for Limitless (single-book CLOB) and Polymarket
//!   (dual-book YES/NO CLOB), with their normalizers

pub mod limitless;
pub mod polymarket;
pub mod rules;
pub mod venue;

pub use rules::{LimitlessRules, PolymarketRule, PolymarketRules};
pub use venue::{
    DiscoveryError, FetchError, NormalizeError, NormalizeOptions, Normalizer, RawBook, VenueClient,
};
