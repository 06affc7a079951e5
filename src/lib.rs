//! LIQFARM: unattended lock/unlock/borrow/repay cycling on Liqfinity.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod platforms;
pub mod engine;
