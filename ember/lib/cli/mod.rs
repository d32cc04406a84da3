//! Command-line arguments of the `ember` server.

mod args;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use styles::*;
