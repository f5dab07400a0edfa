//! Connection registry module
//!
//! Connection handles and the shared identity → connection registry.

mod connection;
mod store;

pub use connection::*;
pub use store::*;
