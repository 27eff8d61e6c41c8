use crate::{DeviceConfig, DriverConfig, DriverKind, ErrorKind, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_direct_config_defaults() -> Result<()> {
    let config = DeviceConfig::from_map(DriverKind::Rbd, &map(&[("pool", "vms")]))?;

    assert_eq!(config.pool.pool, "vms");
    assert_eq!(config.pool.config_path, PathBuf::from("/etc/ceph/ceph.conf"));
    assert_eq!(config.pool.auth_user, "admin");
    assert!(config.pool.keyring_path.is_none());
    assert!(config.pool.monitor_hosts.is_empty());
    assert!(config.overlay.is_none());

    Ok(())
}

#[test]
fn test_direct_config_all_keys() -> Result<()> {
    let config = DeviceConfig::from_map(
        DriverKind::Rbd,
        &map(&[
            ("pool", "vms"),
            ("config_path", "/opt/ceph/cluster.conf"),
            ("auth_user", "xen"),
            ("keyring_path", "/etc/ceph/xen.keyring"),
            ("monitor_hosts", "10.0.0.1:6789, 10.0.0.2:6789,,"),
        ]),
    )?;

    assert_eq!(config.pool.auth_user, "xen");
    assert_eq!(
        config.pool.keyring_path,
        Some(PathBuf::from("/etc/ceph/xen.keyring"))
    );
    assert_eq!(
        config.pool.monitor_hosts,
        vec!["10.0.0.1:6789".to_string(), "10.0.0.2:6789".to_string()]
    );

    Ok(())
}

#[test]
fn test_unknown_keys_rejected() {
    let err = DeviceConfig::from_map(
        DriverKind::Rbd,
        &map(&[("pool", "vms"), ("ceph_user", "admin")]),
    )
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert!(err.to_string().contains("ceph_user"));
}

#[test]
fn test_overlay_keys_rejected_in_direct_mode() {
    let err = DeviceConfig::from_map(
        DriverKind::Rbd,
        &map(&[("pool", "vms"), ("image", "shared")]),
    )
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn test_missing_pool_rejected() {
    let err = DeviceConfig::from_map(DriverKind::Rbd, &map(&[("auth_user", "xen")])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert!(err.to_string().contains("pool"));
}

#[test]
fn test_pool_name_with_slash_rejected() {
    let err = DeviceConfig::from_map(DriverKind::Rbd, &map(&[("pool", "a/b")])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn test_overlay_config() -> Result<()> {
    let config = DeviceConfig::from_map(
        DriverKind::LvmOverRbd,
        &map(&[("pool", "vms"), ("image", "sr-disk"), ("size", "10G")]),
    )?;

    let overlay = config.overlay.expect("overlay config");
    assert_eq!(overlay.image, "sr-disk");
    assert_eq!(overlay.size.as_deref(), Some("10G"));
    assert!(overlay.protected, "protected defaults to true");

    Ok(())
}

#[test]
fn test_overlay_requires_image_and_valid_protected() {
    let err = DeviceConfig::from_map(DriverKind::LvmOverRbd, &map(&[("pool", "vms")])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

    let err = DeviceConfig::from_map(
        DriverKind::LvmOverRbd,
        &map(&[("pool", "vms"), ("image", "x"), ("protected", "maybe")]),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
}

#[test]
fn test_parse_pairs() -> Result<()> {
    let config = DeviceConfig::parse_pairs(
        DriverKind::LvmOverRbd,
        ["pool=vms", "image=shared", "protected=FALSE"],
    )?;
    assert!(!config.overlay.expect("overlay").protected);

    let err = DeviceConfig::parse_pairs(DriverKind::Rbd, ["pool"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

    let err = DeviceConfig::parse_pairs(DriverKind::Rbd, ["pool=a", "pool=b"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

    Ok(())
}

#[test]
fn test_driver_config_roundtrip_and_defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.yaml");

    let missing = DriverConfig::load(Some(path.clone()))?;
    assert_eq!(missing.command_timeout_secs, 120);
    assert_eq!(missing.mappings_dir(), PathBuf::from("/var/lib/rbdsr/mappings"));

    assert_eq!(
        missing.attachments_dir(),
        PathBuf::from("/var/lib/rbdsr/attachments")
    );

    let mut config = DriverConfig::default();
    config.state_dir = dir.path().join("state");
    config.retry.max_attempts = 2;
    std::fs::write(&path, serde_yaml::to_string(&config).expect("serializable"))?;

    let loaded = DriverConfig::load(Some(path))?;
    assert_eq!(loaded.state_dir, dir.path().join("state"));
    assert_eq!(loaded.locks_dir(), dir.path().join("state").join("locks"));
    assert_eq!(loaded.retry.max_attempts, 2);

    Ok(())
}

#[test]
fn test_driver_config_partial_yaml_and_validation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.yaml");

    std::fs::write(&path, "command_timeout_secs: 30\nretry:\n  max_attempts: 3\n")?;
    let config = DriverConfig::load(Some(path.clone()))?;
    assert_eq!(config.command_timeout_secs, 30);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.initial_delay_ms, 200);
    assert_eq!(config.device_settle_timeout_secs, 30);

    std::fs::write(&path, "command_timeout_secs: 0\n")?;
    let err = DriverConfig::load(Some(path)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

    Ok(())
}
