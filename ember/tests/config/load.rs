use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use ember::{
    config::{EmberConfig, ExecutionMode, DEFAULT_SHUTDOWN_GRACE_SECS},
    utils::{EMBER_CONFIG_ENV_VAR, EMBER_HOME_ENV_VAR},
    EmberError,
};
use serial_test::serial;
use tempfile::TempDir;

//--------------------------------------------------------------------------------------------------
// Function: Helper
//--------------------------------------------------------------------------------------------------

fn clear_env() {
    unsafe {
        std::env::remove_var(EMBER_HOME_ENV_VAR);
        std::env::remove_var(EMBER_CONFIG_ENV_VAR);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
#[serial]
async fn test_load_full_config_file() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("ember.toml");
    tokio::fs::write(
        &path,
        r#"
        home_dir = "/var/lib/ember"
        kernel_image = "/var/lib/ember/vmlinux.bin"
        shutdown_grace_secs = 5
        default_vcpus = 2
        default_ram_mib = 512

        [network]
        subnet = "10.0.7.0/24"
        uplink_interface = "enp0s25"

        [execution]
        mode = "jailed"
        uid = 123
        gid = 100
        chroot_base_dir = "/srv/jail"
        "#,
    )
    .await?;

    let config = EmberConfig::load(&path).await?;

    assert_eq!(config.get_home_dir(), &PathBuf::from("/var/lib/ember"));
    assert_eq!(config.rootfs_dir(), PathBuf::from("/var/lib/ember/rootfs"));
    assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
    assert_eq!(*config.get_default_vcpus(), 2);
    assert_eq!(
        config.get_network().gateway(),
        Ipv4Addr::new(10, 0, 7, 1)
    );

    let ExecutionMode::Jailed(jailer) = config.get_execution() else {
        panic!("expected jailed execution");
    };
    assert_eq!(*jailer.get_uid(), 123);
    assert_eq!(jailer.get_chroot_base_dir(), &PathBuf::from("/srv/jail"));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_invalid_config_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("ember.toml");
    tokio::fs::write(&path, "rootfs_size_mb = 0\n").await?;

    let err = EmberConfig::load(&path).await.unwrap_err();
    assert!(matches!(err, EmberError::InvalidConfig(_)));

    let err = EmberConfig::load(dir.path().join("missing.toml"))
        .await
        .unwrap_err();
    assert!(matches!(err, EmberError::InvalidConfig(_)));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_locate_falls_back_to_defaults() -> anyhow::Result<()> {
    clear_env();
    let dir = TempDir::new()?;
    unsafe {
        std::env::set_var(EMBER_HOME_ENV_VAR, dir.path());
    }

    let config = EmberConfig::locate(None).await;
    clear_env();

    let config = config?;
    assert_eq!(config.get_home_dir(), &dir.path().to_path_buf());
    assert_eq!(
        config.shutdown_grace(),
        Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)
    );
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_locate_reads_config_from_home() -> anyhow::Result<()> {
    clear_env();
    let dir = TempDir::new()?;
    tokio::fs::write(dir.path().join("ember.toml"), "boot_timeout_secs = 3\n").await?;
    unsafe {
        std::env::set_var(EMBER_HOME_ENV_VAR, dir.path());
    }

    let config = EmberConfig::locate(None).await;
    clear_env();

    assert_eq!(config?.boot_timeout(), Duration::from_secs(3));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_locate_with_explicit_missing_path_fails() {
    clear_env();
    let err = EmberConfig::locate(Some(std::path::Path::new("/nonexistent/ember.toml")))
        .await
        .unwrap_err();
    assert!(matches!(err, EmberError::InvalidConfig(_)));
}
