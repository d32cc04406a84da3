//! `emberutils` is a library containing general utilities for the ember project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod command;
pub mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use error::*;
