//! Root filesystem images built from container images.

mod builder;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
