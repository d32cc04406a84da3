use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use clap::Parser;

use crate::config::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// ember - a control plane that turns container images into Firecracker microVMs
#[derive(Debug, Parser)]
#[command(name = "ember", author, about, version, styles=styles::styles())]
pub struct EmberArgs {
    /// Path to the config file. Defaults to `$EMBER_CONFIG` or `$EMBER_HOME/ember.toml`
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address the API listens on
    #[arg(long, default_value = DEFAULT_SERVER_HOST)]
    pub host: IpAddr,

    /// Port the API listens on
    #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    pub port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl EmberArgs {
    /// The socket address to serve on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
