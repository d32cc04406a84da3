//! `ember` is a control plane that turns container images into running Firecracker microVMs.
//!
//! # Overview
//!
//! Given a VM name, a container image reference and a CPU/memory shape, ember:
//! - allocates a unique network identity (IP, MAC, tap device) from a private /24
//! - builds an ext4 root filesystem from the image with a minimal init injected as `/init`
//! - creates the tap device and NAT rules on the host
//! - launches the hypervisor, directly or under the jailer, and drives its HTTP API
//! - watches the process and releases everything when it exits
//!
//! Running VMs can be paused, resumed, snapshotted to disk and restored, and the whole fleet is
//! brought down gracefully on `SIGINT`/`SIGTERM`.
//!
//! # Architecture
//!
//! - **Network**: identity allocation and host plumbing (`ip`, `iptables`)
//! - **RootFS**: image export into loop-mounted ext4 files
//! - **VM**: hypervisor configs, the API client, launch strategies and running machines
//! - **Runtime**: process supervision, snapshots and signal handling
//! - **Management**: the per-VM records, the registry and the [`VmManager`](management::VmManager)
//! - **Server**: the JSON HTTP API over the manager
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use ember::{
//!     config::EmberConfig,
//!     management::{CreateVmRequest, VmManager},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = VmManager::with_host(EmberConfig::default())?;
//!
//!     let vm = manager
//!         .create(
//!             CreateVmRequest::builder()
//!                 .name("web")
//!                 .image("nginx:alpine")
//!                 .vcpus(2)
//!                 .build(),
//!             &CancellationToken::new(),
//!         )
//!         .await?;
//!
//!     println!("{} is up at {}", vm.name, vm.ip);
//!     manager.delete(&vm.id).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line arguments of the server
//! - [`config`] - Deployment configuration and defaults
//! - [`management`] - VM records, registry and the control surface
//! - [`network`] - Network identities and host provisioning
//! - [`rootfs`] - Root filesystem builds
//! - [`runtime`] - Supervision, snapshots and signals
//! - [`server`] - HTTP API
//! - [`utils`] - Paths and environment helpers
//! - [`vm`] - The hypervisor and its API
//!
//! # Platform Support
//!
//! Linux only. Building root filesystems and wiring taps needs root or passwordless `sudo`.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod management;
pub mod network;
pub mod rootfs;
pub mod runtime;
pub mod server;
pub mod utils;
pub mod vm;

pub use error::*;
