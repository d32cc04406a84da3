//! Per-VM network identities and the host plumbing behind them.

mod identity;
mod provision;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use identity::*;
pub use provision::*;
