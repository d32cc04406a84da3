//! Utility functions and types.

mod env;
mod path;

#[cfg(test)]
pub(crate) mod fakes;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use env::*;
pub use path::*;
