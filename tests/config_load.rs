use meshlink::config::Config;

#[tokio::test]
async fn default_file_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meshlink.toml");
    let path = path.to_str().unwrap();

    Config::create_default(path).await.unwrap();
    let loaded = Config::load(path).await.unwrap();
    assert_eq!(loaded, Config::default());
    loaded.validate().unwrap();
    assert!(loaded.wants_discovery());
}

#[tokio::test]
async fn overrides_and_discovery_table_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("radio.toml");
    tokio::fs::write(
        &path,
        r#"
[serial]
port = "/dev/ttyACM0"
baud_rate = 921600

[connection]
max_retries = 2
auto_reconnect = false

[heartbeat]
enabled = false

[discovery]
whitelist_vids = [0x239A]

[[discovery.devices]]
name = "RAK4631"
description = "RAK WisBlock"
vid = 0x239A
pid = 0x8029
priority = 1

[logging]
level = "debug"
file = "meshlink.log"
"#,
    )
    .await
    .unwrap();

    let cfg = Config::load(path.to_str().unwrap()).await.unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.serial.port, "/dev/ttyACM0");
    assert_eq!(cfg.serial.baud_rate, 921_600);
    assert_eq!(cfg.serial.read_timeout_ms, 500);
    assert_eq!(cfg.connection.max_retries, 2);
    assert!(!cfg.heartbeat.enabled);
    assert_eq!(cfg.logging.level_filter(), log::LevelFilter::Debug);

    let discovery = cfg.discovery_config();
    assert_eq!(discovery.devices.len(), 1);
    assert_eq!(discovery.whitelist_vids, vec![0x239A]);
    // Unspecified lists fall back to the built-in values.
    assert!(!discovery.blacklist_vids.is_empty());
}

#[tokio::test]
async fn missing_and_malformed_files_report_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("nope.toml");
    let err = Config::load(missing.to_str().unwrap()).await.unwrap_err();
    assert!(err.to_string().contains("nope.toml"), "{err}");

    let bad = dir.path().join("bad.toml");
    tokio::fs::write(&bad, "[serial\nport = 1").await.unwrap();
    let err = Config::load(bad.to_str().unwrap()).await.unwrap_err();
    assert!(err.to_string().starts_with("Failed to parse config file"), "{err}");
}

#[tokio::test]
async fn invalid_values_fail_validation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meshlink.toml");
    tokio::fs::write(&path, "[serial]\nstop_bits = 3\n").await.unwrap();
    let cfg = Config::load(path.to_str().unwrap()).await.unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("stop_bits"), "{err}");
}
