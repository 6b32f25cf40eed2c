//! Mining module - block templates and the proof-of-work search

mod miner;
mod template;

pub use miner::*;
pub use template::*;
