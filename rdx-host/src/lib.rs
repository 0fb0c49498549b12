//! # rdx-host: headless remote-display host
//!
//! Serves a synthetic test-pattern window to rdx clients over TCP and,
//! optionally, UDP. Useful for exercising the protocol engine and for
//! benchmarking clients without a real display server.

pub mod config;
pub mod service;
