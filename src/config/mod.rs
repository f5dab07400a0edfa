//! Configuration module
//!
//! Handles loading the relay server configuration.

mod relay;

pub use relay::*;
