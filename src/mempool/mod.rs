//! Transaction pool module

mod ordering;
mod pool;

pub use ordering::*;
pub use pool::*;
