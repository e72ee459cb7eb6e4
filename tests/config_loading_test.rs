//! Integration tests for configuration loading from files and the environment.

use daq_supervisor::config::SupervisorConfig;
use daq_supervisor::error::EquipmentError;
use daq_supervisor::transport::MockTransportFactory;
use daq_supervisor::Supervisor;
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const RACK: &str = r#"
    [application]
    name = "Scope rack"
    log_level = "info"

    [supervisor]
    ping_timeout = "500ms"
    shutdown_grace = "2s"

    [[devices]]
    name = "oscilloscope1"
    address = "10.0.0.3"
    port = 1865
    channels = "XY"
    rate = 1000
    packet_size = 3
    duration = 12.0
    file = "thread1.csv"

    [[devices]]
    name = "oscilloscope2"
    address = "10.0.0.4"
    port = 1866
    channels = "XY"
    rate = 1000
    packet_size = 3
    duration = 12.0
    file = "thread2.csv"
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp config");
    file.write_all(contents.as_bytes())
        .expect("Failed to write temp config");
    file
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = write_config(RACK);
    let config = SupervisorConfig::load_from(file.path()).expect("Failed to load config");
    config.validate().unwrap();

    assert_eq!(config.application.name, "Scope rack");
    assert_eq!(config.supervisor.ping_timeout, Duration::from_millis(500));
    assert_eq!(config.supervisor.shutdown_grace, Duration::from_secs(2));
    assert_eq!(config.devices.len(), 2);
    assert_eq!(config.devices[1].file.as_deref(), Some("thread2.csv"));
}

#[test]
fn test_plain_toml_deserialization_matches_figment() {
    let parsed: SupervisorConfig = toml::from_str(RACK).expect("Failed to parse test config");
    let extracted = SupervisorConfig::from_toml_str(RACK).unwrap();

    assert_eq!(parsed.devices.len(), extracted.devices.len());
    assert_eq!(
        parsed.equipment_settings(),
        extracted.equipment_settings()
    );
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(RACK);
    std::env::set_var("DAQ_SUPERVISOR_APPLICATION__LOG_LEVEL", "debug");
    std::env::set_var("DAQ_SUPERVISOR_SUPERVISOR__PING_TIMEOUT", "250ms");

    let result = SupervisorConfig::load_from(file.path());

    std::env::remove_var("DAQ_SUPERVISOR_APPLICATION__LOG_LEVEL");
    std::env::remove_var("DAQ_SUPERVISOR_SUPERVISOR__PING_TIMEOUT");

    let config = result.expect("Failed to load config");
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.supervisor.ping_timeout, Duration::from_millis(250));
    // Untouched keys keep the file's values.
    assert_eq!(config.supervisor.shutdown_grace, Duration::from_secs(2));
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig::load_from(dir.path().join("absent.toml")).unwrap();
    config.validate().unwrap();
    assert!(config.devices.is_empty());
    assert_eq!(config.application.log_level, "info");
}

#[test]
#[serial]
fn test_malformed_duration_is_a_config_error() {
    let file = write_config(
        r#"
        [worker]
        control_poll = "soon"
        "#,
    );
    assert!(matches!(
        SupervisorConfig::load_from(file.path()),
        Err(EquipmentError::Config(_))
    ));
}

#[tokio::test]
async fn test_supervisor_from_config_registers_devices() {
    let config = SupervisorConfig::from_toml_str(RACK).unwrap();
    let mut supervisor =
        Supervisor::from_config(&config, Arc::new(MockTransportFactory::new())).unwrap();

    let mut names = supervisor.names();
    names.sort();
    assert_eq!(names, vec!["oscilloscope1", "oscilloscope2"]);
    assert_eq!(supervisor.equipment("oscilloscope2").unwrap().port(), 1866);

    supervisor.configure_all(&config.configure_params()).await.unwrap();
    supervisor.start_all(&config.start_params()).await.unwrap();
    let reachable = supervisor.ping_all(config.supervisor.ping_timeout).await;
    assert!(reachable.values().all(|ok| *ok));
    supervisor.shutdown().await.unwrap();
}

#[test]
fn test_from_config_rejects_invalid_rack() {
    let config = SupervisorConfig::from_toml_str(
        r#"
        [[devices]]
        name = ""
        address = "10.0.0.3"
        port = 1865
        "#,
    )
    .unwrap();
    assert!(matches!(
        Supervisor::from_config(&config, Arc::new(MockTransportFactory::new())),
        Err(EquipmentError::Configuration(_))
    ));
}
