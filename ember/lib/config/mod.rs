//! Deployment configuration for the control plane.

mod defaults;
mod ember;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use ember::*;
