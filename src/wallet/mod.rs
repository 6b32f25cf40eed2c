//! Wallet module - key pairs and transaction signing

mod builder;
mod keys;

pub use builder::*;
pub use keys::*;
