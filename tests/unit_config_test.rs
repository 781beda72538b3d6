use netcached::config::Config;

#[test]
fn test_defaults_resolve_to_microseconds() {
    let config = Config::default();
    assert_eq!(config.mirror.periodic_sync_interval, 10_000_000);
    assert_eq!(config.mirror.periodic_sync_head_time, 1_000_000);
    assert_eq!(config.mirror.periodic_sync_tail_time, 10_000_000);
    assert_eq!(config.mirror.failed_sync_retry_delay, 1_000_000);
    assert_eq!(config.mirror.network_error_timeout, 300_000_000);
    assert_eq!(config.mirror.small_blob_boundary, 100 * 1024);
    assert_eq!(config.mirror.max_slot_log_records, 100_000);
}

#[test]
fn test_small_thread_split_resolution() {
    let config = Config::default();
    // 33% of 6 instant threads, floored but never zero.
    assert_eq!(config.mirror.mirror_small_preferred, 1);
    assert_eq!(config.mirror.mirror_small_exclusive, 1);
    assert!(
        config.mirror.mirror_small_preferred + config.mirror.mirror_small_exclusive
            <= config.mirror.threads_instant
    );
}

#[test]
fn test_validation_catches_inconsistencies() {
    let mut config = Config::default();
    config.port = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.mirror.max_peer_bg_conns = config.mirror.max_peer_total_conns + 1;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.metrics.enabled = true;
    config.metrics.port = config.port;
    assert!(config.validate().is_err());

    assert!(Config::default().validate().is_ok());
}

#[test]
fn test_from_file_parses_full_mirror_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netcached.toml");
    std::fs::write(
        &path,
        r#"
host = "127.0.0.1"
port = 9001
log_level = "debug"

[metrics]
enabled = false

[mirror]
max_active_syncs = 2
max_syncs_one_server = 1
deferred_sync_interval = 5
deferred_sync_head_time = 2
small_blob_max_size = 64
max_slot_log_records = 5000
clean_slot_log_reserve = 100
sync_log_file = "events.bin"

[[mirror.servers]]
group = "grp1"
host = "127.0.0.1"
port = 9001
slots = [1, 2]

[[mirror.servers]]
group = "grp1"
host = "127.0.0.1"
port = 9002
slots = [2, 3]
"#,
    )
    .unwrap();

    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.port, 9001);
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.mirror.servers.len(), 2);
    assert_eq!(config.mirror.servers[1].slots, vec![2, 3]);
    assert_eq!(config.mirror.max_active_syncs, 2);
    assert_eq!(config.mirror.periodic_sync_interval, 5_000_000);
    assert_eq!(config.mirror.periodic_sync_head_time, 2_000_000);
    assert_eq!(config.mirror.small_blob_boundary, 64 * 1024);
    assert_eq!(config.mirror.max_slot_log_records, 5000);
    assert_eq!(config.mirror.sync_log_file, "events.bin");
    // Untouched keys keep their defaults.
    assert_eq!(config.mirror.max_mirror_queue_size, 10_000);
}

#[test]
fn test_reserve_is_clamped_below_cap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netcached.toml");
    std::fs::write(
        &path,
        r#"
[mirror]
max_slot_log_records = 100
clean_slot_log_reserve = 5000
"#,
    )
    .unwrap();
    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.mirror.max_slot_log_records, 100);
    assert_eq!(config.mirror.clean_slot_log_reserve, 99);
}
