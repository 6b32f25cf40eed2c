//! Node module - the core facade, its clock, events, and genesis

mod clock;
mod core;
mod events;
mod genesis;

pub use self::core::*;
pub use clock::*;
pub use events::*;
pub use genesis::*;
