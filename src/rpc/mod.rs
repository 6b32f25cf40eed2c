//! JSON-RPC API Module
//!
//! Provides an HTTP interface over the core for miners, wallets and tools.

mod methods;
mod server;

pub use methods::*;
pub use server::*;
