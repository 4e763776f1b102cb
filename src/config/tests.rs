//! Config module tests

use pretty_assertions::assert_eq;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("ROSMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${ROSMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("ROSMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("ROSMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${ROSMQ_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    // Set var should use env value
    std::env::set_var("ROSMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${ROSMQ_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("ROSMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("ROSMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${ROSMQ_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let temp_dir = std::env::temp_dir();
    let config_path = temp_dir.join("rosmq_test_config.toml");

    std::env::set_var("ROSMQ_TEST_LOG_LEVEL", "debug");

    let config_content = r#"
[log]
level = "${ROSMQ_TEST_LOG_LEVEL}"

[limits]
max_inflight = ${ROSMQ_TEST_INFLIGHT:-7}
"#;

    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.limits.max_inflight, 7); // Uses default

    std::fs::remove_file(&config_path).ok();
    std::env::remove_var("ROSMQ_TEST_LOG_LEVEL");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.limits.max_inflight, 20);
    assert_eq!(config.limits.max_queued_messages, 100);
    assert_eq!(config.session.default_keep_alive, 60);
    assert_eq!(config.mqtt.max_qos, 2);
}

#[test]
fn test_missing_file_uses_defaults() {
    let config = Config::load("/nonexistent/rosmq.toml").unwrap();
    assert_eq!(config.limits.max_inflight, 20);
}

#[test]
fn test_parse_rejects_invalid_max_qos() {
    let err = Config::parse("[mqtt]\nmax_qos = 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_parse_rejects_zero_inflight() {
    let err = Config::parse("[limits]\nmax_inflight = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_broker_options_derivation() {
    let config = Config::parse(
        r#"
[limits]
max_inflight = 5
max_queued_messages = 10
retry_interval = 3

[mqtt]
max_qos = 1
"#,
    )
    .unwrap();

    let options = config.broker_options();
    assert_eq!(options.limits.max_inflight, 5);
    assert_eq!(options.limits.max_queued, 10);
    assert_eq!(options.retry_interval, Duration::from_secs(3));
    assert_eq!(options.max_qos, crate::protocol::QoS::AtLeastOnce);
}
