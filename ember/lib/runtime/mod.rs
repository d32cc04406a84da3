//! Process supervision: launching, watching and stopping hypervisors, snapshots, and signal
//! handling.

mod signals;
mod snapshot;
mod supervisor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use signals::*;
pub use snapshot::*;
pub use supervisor::*;
