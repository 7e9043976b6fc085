//! Integration tests module
//!
//! End-to-end tests for the castline HTTP clients and storage wiring,
//! including:
//! - Outbound publish request shape and error classification
//! - Manual media confirmation through the provider API
//! - Restart safety of SQLite-backed records and shared state

pub mod media_provider_test;
pub mod publisher_test;
pub mod sqlite_test;
