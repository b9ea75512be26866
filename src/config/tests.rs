//! Config module tests

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

#[test]
fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.default_qos, 1);
    assert_eq!(config.max_qos, 2);
    assert_eq!(config.queue_capacity, 10_000);
    assert_eq!(config.worker_count, 0);
    assert_eq!(config.back_pressure, BackPressure::BlockWithTimeout);
    assert_eq!(config.enqueue_timeout, Duration::from_secs(1));
    assert_eq!(config.qos1_deadline, Duration::from_secs(10));
    assert_eq!(config.qos2_phase_deadline, Duration::from_secs(10));
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.retry_initial, Duration::from_secs(1));
    assert_eq!(config.retry_cap, Duration::from_secs(30));
    assert_eq!(config.shutdown_drain, Duration::from_secs(30));
    assert_eq!(config.retained_payload_max_bytes, 1024 * 1024);
    assert_eq!(config.subscriber_queue_capacity, 1024);
    assert_eq!(config.wait_poll_interval, Duration::from_millis(100));
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full() {
    let toml = r#"
        default_qos = 0
        max_qos = 1
        queue_capacity = 256
        worker_count = 4
        back_pressure = "drop-and-error"
        enqueue_timeout = "250ms"
        qos1_deadline = "2s"
        qos2_phase_deadline = "3s"
        max_attempts = 3
        retry_initial = "100ms"
        retry_cap = "5s"
        shutdown_drain = "10s"
        retained_payload_max_bytes = 4096
        subscriber_queue_capacity = 32
        wait_poll_interval = "50ms"
    "#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.default_qos_level(), QoS::AtMostOnce);
    assert_eq!(config.max_qos_level(), QoS::AtLeastOnce);
    assert_eq!(config.queue_capacity, 256);
    assert_eq!(config.worker_count, 4);
    assert_eq!(config.back_pressure, BackPressure::DropAndError);
    assert_eq!(config.enqueue_timeout, Duration::from_millis(250));
    assert_eq!(config.qos1_deadline, Duration::from_secs(2));
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.retry_initial, Duration::from_millis(100));
    assert_eq!(config.retained_payload_max_bytes, 4096);
}

#[test]
fn test_parse_partial_uses_defaults() {
    let config = Config::parse("max_qos = 1\ndefault_qos = 1\n").unwrap();
    assert_eq!(config.max_qos, 1);
    assert_eq!(config.queue_capacity, 10_000);
    assert_eq!(config.back_pressure, BackPressure::BlockWithTimeout);
}

#[test]
fn test_parse_invalid_toml() {
    assert!(matches!(
        Config::parse("queue_capacity = "),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_validate_max_qos_range() {
    let config = Config {
        max_qos: 3,
        ..Config::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_validate_default_qos_exceeds_max() {
    let config = Config {
        default_qos: 2,
        max_qos: 1,
        ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("default_qos"));
}

#[test]
fn test_validate_zero_capacities() {
    let config = Config {
        queue_capacity: 0,
        ..Config::default()
    };
    assert!(config.validate().is_err());

    let config = Config {
        subscriber_queue_capacity: 0,
        ..Config::default()
    };
    assert!(config.validate().is_err());

    let config = Config {
        max_attempts: 0,
        ..Config::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_retry_ladder() {
    let config = Config {
        retry_initial: Duration::ZERO,
        ..Config::default()
    };
    assert!(config.validate().is_err());

    let config = Config {
        retry_initial: Duration::from_secs(5),
        retry_cap: Duration::from_secs(1),
        ..Config::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_effective_worker_count() {
    let config = Config {
        worker_count: 3,
        ..Config::default()
    };
    assert_eq!(config.effective_worker_count(), 3);

    // 0 resolves to at least 2 workers
    let config = Config::default();
    assert!(config.effective_worker_count() >= 2);
}

#[test]
fn test_route_shard_capacity() {
    let config = Config {
        queue_capacity: 100,
        worker_count: 4,
        ..Config::default()
    };
    assert_eq!(config.route_shard_capacity(), 25);

    // Capacity smaller than worker count still yields usable shards
    let config = Config {
        queue_capacity: 2,
        worker_count: 8,
        ..Config::default()
    };
    assert_eq!(config.route_shard_capacity(), 1);
}
