//! Upzone Proxy Engine
//!
//! Maps the configured upstream zones into shared memory and serves the
//! dynamic peer binding over an HTTP admin listener.

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod server;
