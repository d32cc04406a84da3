//! The control surface over VMs: records of what runs, the registry holding them and the manager
//! driving their lifecycle.

mod manager;
mod record;
mod registry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use manager::*;
pub use record::*;
pub use registry::*;
