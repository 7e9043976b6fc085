//! Integration tests entry point
//!
//! This file serves as the entry point for the integration tests that talk
//! to mocked HTTP services or real on-disk storage:
//! - Upstream publisher against a mock publishing API
//! - Media provider confirmation against a mock provider API
//! - SQLite-backed application wiring

mod integration_tests;
