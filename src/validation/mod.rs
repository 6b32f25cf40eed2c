//! Transaction module - structure, encoding and validation

mod transaction;
mod validator;

pub use transaction::*;
pub use validator::*;
