//! Consensus module - Network parameters, block structure, difficulty and block validation

mod block;
mod currency;
mod difficulty;
mod validation;

pub use block::*;
pub use currency::*;
pub use difficulty::*;
pub use validation::*;
