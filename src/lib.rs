//! Concurrent QUIC / HTTP3 scanner: rate-gated probing of many targets with
//! results written to a set of CSV tables.

#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod engine;
pub mod input;
pub mod model;
pub mod output;
pub mod transport;
pub mod util;
