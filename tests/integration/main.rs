//! Integration tests: the full cycle loop against an in-memory platform.

mod cycle;
