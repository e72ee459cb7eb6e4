//! Integration tests for health checks and shutdown escalation.

use async_trait::async_trait;
use daq_supervisor::equipment::{Equipment, EquipmentSettings, Lifecycle};
use daq_supervisor::error::EquipmentResult;
use daq_supervisor::protocol::{Command, ConfigureParams};
use daq_supervisor::transport::{Endpoint, MockTransportFactory, Transport, TransportFactory};
use daq_supervisor::worker::WorkerSettings;
use daq_supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

/// Factory whose `open` never completes in reasonable time, wedging the worker
/// inside its `configure` handler.
struct StuckFactory;

#[async_trait]
impl TransportFactory for StuckFactory {
    async fn open(
        &self,
        endpoint: &Endpoint,
        config: &ConfigureParams,
    ) -> EquipmentResult<Box<dyn Transport>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        MockTransportFactory::new().open(endpoint, config).await
    }
}

fn mock_supervisor() -> Supervisor {
    Supervisor::new().with_transport(Arc::new(MockTransportFactory::new()))
}

#[tokio::test]
async fn test_ping_all_flags_unstarted_worker() {
    let mut supervisor = mock_supervisor();
    for (index, name) in ["alpha", "beta", "gamma"].into_iter().enumerate() {
        supervisor
            .add_equipment(name, "127.0.0.1", 1865 + index as u16)
            .unwrap();
    }
    supervisor.equipment_mut("alpha").unwrap().start().unwrap();
    supervisor.equipment_mut("beta").unwrap().start().unwrap();

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let results = supervisor.ping_all(timeout).await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 3);
    assert!(results["alpha"]);
    assert!(results["beta"]);
    assert!(!results["gamma"]);

    // Only the silent worker consumes its full wait.
    assert!(elapsed >= timeout, "returned too early: {:?}", elapsed);
    assert!(elapsed < timeout * 3, "ping_all took too long: {:?}", elapsed);

    assert_ok!(supervisor.shutdown().await);
}

#[tokio::test]
async fn test_ping_all_on_empty_supervisor() {
    let mut supervisor = mock_supervisor();
    assert!(supervisor.ping_all(Duration::from_millis(50)).await.is_empty());
}

#[tokio::test]
async fn test_stuck_worker_is_aborted_after_grace() {
    let settings = EquipmentSettings {
        shutdown_grace: Duration::from_millis(200),
        ..EquipmentSettings::default()
    };
    let mut equipment =
        Equipment::with_settings("stuck", "127.0.0.1", 1865, settings, Arc::new(StuckFactory));
    equipment.start().unwrap();
    equipment
        .send_command(Command::Configure(ConfigureParams::default()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    // An abort after the grace period is not an error.
    assert_ok!(equipment.stop().await);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2), "stop hung: {:?}", elapsed);
    assert_eq!(equipment.lifecycle(), Lifecycle::Terminated);
    assert!(!equipment.is_running());
}

/// Starts an Equipment wedged in `configure` with its command queue full.
async fn wedged_equipment_with_full_queue() -> Equipment {
    let settings = EquipmentSettings {
        shutdown_grace: Duration::from_millis(200),
        command_capacity: 2,
        ..EquipmentSettings::default()
    };
    let mut equipment =
        Equipment::with_settings("wedged", "127.0.0.1", 1865, settings, Arc::new(StuckFactory));
    equipment.start().unwrap();
    equipment
        .send_command(Command::Configure(ConfigureParams::default()))
        .await
        .unwrap();
    // Let the worker pick up `configure` before filling the queue behind it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    equipment.send_command(Command::GetData).await.unwrap();
    equipment.send_command(Command::GetData).await.unwrap();
    equipment
}

#[tokio::test]
async fn test_ping_with_full_queue_times_out() {
    let mut equipment = wedged_equipment_with_full_queue().await;

    let started = Instant::now();
    let pinging = equipment.ping(Duration::from_millis(100));
    let reachable = tokio::time::timeout(Duration::from_secs(2), pinging)
        .await
        .expect("ping must honour its own timeout");
    let elapsed = started.elapsed();

    assert!(!reachable);
    assert!(elapsed < Duration::from_secs(1), "ping took {:?}", elapsed);

    assert_ok!(equipment.stop().await);
}

#[tokio::test]
async fn test_stop_with_full_queue_aborts_within_grace() {
    let mut equipment = wedged_equipment_with_full_queue().await;

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(2), equipment.stop())
        .await
        .expect("stop must not wait for queue space");
    let elapsed = started.elapsed();

    assert_ok!(result);
    assert!(elapsed < Duration::from_secs(1), "stop took {:?}", elapsed);
    assert_eq!(equipment.lifecycle(), Lifecycle::Terminated);
    assert!(!equipment.is_running());
}

#[tokio::test]
async fn test_ping_all_and_shutdown_with_wedged_worker() {
    let settings = EquipmentSettings {
        shutdown_grace: Duration::from_millis(200),
        command_capacity: 1,
        ..EquipmentSettings::default()
    };
    let mut supervisor = Supervisor::new()
        .with_settings(settings)
        .with_transport(Arc::new(StuckFactory));
    supervisor.add_equipment("wedged", "127.0.0.1", 1865).unwrap();
    supervisor.equipment_mut("wedged").unwrap().start().unwrap();
    supervisor.configure_all(&HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.stop_all().await.unwrap();

    let timeout = Duration::from_millis(100);
    let started = Instant::now();
    let results = tokio::time::timeout(Duration::from_secs(2), supervisor.ping_all(timeout))
        .await
        .expect("ping_all must stay within N x timeout");
    assert!(!results["wedged"]);
    assert!(started.elapsed() < timeout * 3);

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
        .await
        .expect("shutdown must not hang");
    assert_ok!(result);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_shutdown_mixes_graceful_and_forced_stops() {
    let settings = EquipmentSettings {
        shutdown_grace: Duration::from_millis(200),
        worker: WorkerSettings::default(),
        command_capacity: 8,
    };
    let mut supervisor = Supervisor::new()
        .with_settings(settings)
        .with_transport(Arc::new(StuckFactory));
    supervisor.add_equipment("stuck", "127.0.0.1", 1865).unwrap();

    let mut supervisor_ok = mock_supervisor().with_settings(settings);
    supervisor_ok.add_equipment("fine", "127.0.0.1", 1866).unwrap();

    supervisor.start_all(&HashMap::new()).await.unwrap();
    supervisor_ok.start_all(&HashMap::new()).await.unwrap();
    supervisor.configure_all(&HashMap::new()).await.unwrap();

    let started = Instant::now();
    assert_ok!(supervisor.shutdown().await);
    assert_ok!(supervisor_ok.shutdown().await);
    assert!(started.elapsed() < Duration::from_secs(2));

    // Shutdown is idempotent.
    assert_ok!(supervisor.shutdown().await);
}

#[tokio::test]
async fn test_dropping_supervisor_aborts_workers() {
    let mut supervisor = mock_supervisor();
    supervisor.add_equipment("a", "127.0.0.1", 1865).unwrap();
    supervisor.start_all(&HashMap::new()).await.unwrap();
    assert!(supervisor.equipment("a").unwrap().is_running());

    // Must not hang or panic.
    drop(supervisor);
    tokio::time::sleep(Duration::from_millis(20)).await;
}
