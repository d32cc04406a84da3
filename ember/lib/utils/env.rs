use std::{env, path::PathBuf};

use crate::config::DEFAULT_EMBER_HOME;

use super::EMBER_CONFIG_FILENAME;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable overriding the ember home directory.
pub const EMBER_HOME_ENV_VAR: &str = "EMBER_HOME";

/// Environment variable overriding the deployment config file path.
pub const EMBER_CONFIG_ENV_VAR: &str = "EMBER_CONFIG";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the ember home directory, honouring `EMBER_HOME` when set.
pub fn get_ember_home_path() -> PathBuf {
    match env::var(EMBER_HOME_ENV_VAR) {
        Ok(home) if !home.is_empty() => PathBuf::from(home),
        _ => DEFAULT_EMBER_HOME.clone(),
    }
}

/// Returns the config file path: `EMBER_CONFIG` when set, else `ember.toml` in the home directory.
pub fn get_ember_config_path() -> PathBuf {
    match env::var(EMBER_CONFIG_ENV_VAR) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => get_ember_home_path().join(EMBER_CONFIG_FILENAME),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
