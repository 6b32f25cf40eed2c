//! Storage module - main chain state, block tree and on-disk persistence

mod blockchain;
mod state;
pub mod db;

pub use blockchain::*;
pub use state::*;
pub use db::ChainDb;
