//! Relay core
//!
//! Message routing between connections and liveness probing.

mod liveness;
mod router;

pub use liveness::*;
pub use router::*;
