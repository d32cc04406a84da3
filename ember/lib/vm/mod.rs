//! The hypervisor: its API, launch strategies and running processes.

mod api;
mod client;
mod config;
pub mod launch;
mod machine;
mod snapshot;
mod state;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use client::*;
pub use config::*;
pub use launch::{jail_root, DirectLaunch, JailedLaunch, LaunchPlan, LaunchStrategy};
pub use machine::*;
pub use snapshot::*;
pub use state::*;
