//! The HTTP control API.
//!
//! A small JSON API over [`VmManager`](crate::management::VmManager):
//! - `POST /create`, `POST /restore` bring VMs up
//! - `POST /stop`, `POST /resume` pause and unpause them
//! - `POST /snapshot` captures one to disk
//! - `POST /delete` removes one
//! - `GET /list`, `GET /info/{id}` inspect them
//!
//! Failures come back as `{"error": "..."}` with a status derived from the error kind.

mod handlers;
mod routes;
mod state;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use handlers::*;
pub use routes::*;
pub use state::*;
pub use types::*;
