//! Supervisor - fan-out and aggregation over many device workers
//!
//! The Supervisor owns a registry of [`Equipment`] keyed by name and runs in the
//! caller's task. Each operation walks the registry and talks to every worker through
//! that worker's private channel; there is no state shared between workers.
//!
//! ## Responsibilities
//!
//! 1. **Registry**: `add_equipment` builds handles with the Supervisor's settings and
//!    transport factory
//! 2. **Fan-out**: configure, start, stop and flush commands to every worker
//! 3. **Health**: `ping_all` probes workers one after the other, each bounded by the
//!    same timeout, so the worst case is `N × timeout`
//! 4. **Shutdown**: stops every worker, escalating to abort after the grace period
//!
//! Fan-out keeps going when one worker fails; failures are collected and returned
//! together once every worker was addressed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::equipment::{Equipment, EquipmentSettings};
use crate::error::{EquipmentError, EquipmentResult};
use crate::packet::Sample;
use crate::protocol::{Command, ConfigureParams, StartParams};
use crate::transport::{TransportFactory, UdpTransportFactory};

/// Coordinates every registered Equipment.
pub struct Supervisor {
    equipment: HashMap<String, Equipment>,
    settings: EquipmentSettings,
    factory: Arc<dyn TransportFactory>,
}

impl Supervisor {
    /// Empty Supervisor streaming over UDP with default settings.
    pub fn new() -> Self {
        Self {
            equipment: HashMap::new(),
            settings: EquipmentSettings::default(),
            factory: Arc::new(UdpTransportFactory),
        }
    }

    /// Replaces the transport factory used for Equipment added from now on.
    pub fn with_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Replaces the settings used for Equipment added from now on.
    pub fn with_settings(mut self, settings: EquipmentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Builds a Supervisor with every device listed in the configuration registered.
    pub fn from_config(
        config: &SupervisorConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> EquipmentResult<Self> {
        config.validate()?;

        let mut supervisor = Self::new()
            .with_settings(config.equipment_settings())
            .with_transport(factory);
        for device in &config.devices {
            supervisor.add_equipment(&device.name, &device.address, device.port)?;
        }
        Ok(supervisor)
    }

    /// Registers a new Equipment (not started).
    ///
    /// Re-using a name replaces the previous entry; its worker, if running, is aborted.
    pub fn add_equipment(
        &mut self,
        name: &str,
        address: &str,
        port: u16,
    ) -> EquipmentResult<&mut Equipment> {
        if name.is_empty() {
            return Err(EquipmentError::EmptyName);
        }

        let equipment = Equipment::with_settings(
            name,
            address,
            port,
            self.settings,
            Arc::clone(&self.factory),
        );
        if let Some(previous) = self.equipment.insert(name.to_string(), equipment) {
            warn!(
                equipment = name,
                previous_endpoint = %previous.endpoint(),
                "Equipment name reused, replacing previous entry"
            );
        }

        debug!(equipment = name, address, port, "Equipment added");
        self.equipment
            .get_mut(name)
            .ok_or_else(|| EquipmentError::NotFound(name.to_string()))
    }

    /// Sends `configure` to every Equipment; names missing from `configs` get defaults.
    pub async fn configure_all(
        &mut self,
        configs: &HashMap<String, ConfigureParams>,
    ) -> EquipmentResult<()> {
        let mut errors = Vec::new();
        for (name, equipment) in &self.equipment {
            let params = configs.get(name).cloned().unwrap_or_default();
            if let Err(err) = equipment.send_command(Command::Configure(params)).await {
                errors.push(err);
            }
        }
        broadcast_result("configure", errors)
    }

    /// Starts every worker that is not running yet, then sends `start_collection`.
    pub async fn start_all(&mut self, params: &HashMap<String, StartParams>) -> EquipmentResult<()> {
        let mut errors = Vec::new();
        for (name, equipment) in &mut self.equipment {
            if !equipment.is_running() {
                if let Err(err) = equipment.start() {
                    errors.push(err);
                    continue;
                }
            }

            let start = params.get(name).cloned().unwrap_or_default();
            if let Err(err) = equipment.send_command(Command::StartCollection(start)).await {
                errors.push(err);
            }
        }
        info!(count = self.equipment.len(), "Collection started on all equipment");
        broadcast_result("start_collection", errors)
    }

    /// Sends `stop_collection` to every Equipment.
    pub async fn stop_all(&mut self) -> EquipmentResult<()> {
        self.broadcast(Command::StopCollection).await
    }

    /// Sends `get_data` to every Equipment without waiting for replies.
    ///
    /// Replies are read with [`Equipment::recv_response`] / [`Equipment::recv_data`],
    /// or use [`collect_data`](Self::collect_data).
    pub async fn get_data_from_all(&mut self) -> EquipmentResult<()> {
        self.broadcast(Command::GetData).await
    }

    /// Flushes every worker and gathers the replies.
    ///
    /// Each Equipment is given up to `wait` for its `data` response. A worker with
    /// an empty buffer never replies and maps to an empty vector after its wait.
    pub async fn collect_data(
        &mut self,
        wait: Duration,
    ) -> EquipmentResult<HashMap<String, Vec<Sample>>> {
        self.get_data_from_all().await?;

        let mut collected = HashMap::with_capacity(self.equipment.len());
        for (name, equipment) in &mut self.equipment {
            let samples = equipment.recv_data(wait).await.unwrap_or_default();
            debug!(equipment = %name, samples = samples.len(), "Collected data");
            collected.insert(name.clone(), samples);
        }
        Ok(collected)
    }

    /// Probes every Equipment in turn and reports reachability by name.
    ///
    /// Never fails: an unreachable worker is simply `false`.
    pub async fn ping_all(&mut self, timeout: Duration) -> HashMap<String, bool> {
        let mut results = HashMap::with_capacity(self.equipment.len());
        for (name, equipment) in &mut self.equipment {
            let reachable = equipment.ping(timeout).await;
            if !reachable {
                warn!(equipment = %name, timeout_ms = timeout.as_millis() as u64, "Ping timed out");
            }
            results.insert(name.clone(), reachable);
        }
        results
    }

    /// Stops every Equipment.
    pub async fn shutdown(&mut self) -> EquipmentResult<()> {
        let mut errors = Vec::new();
        for equipment in self.equipment.values_mut() {
            if let Err(err) = equipment.stop().await {
                errors.push(err);
            }
        }
        info!(count = self.equipment.len(), "Supervisor shutdown complete");
        EquipmentError::from_shutdown_errors(errors)
    }

    async fn broadcast(&self, command: Command) -> EquipmentResult<()> {
        let state = command.state();
        let mut errors = Vec::new();
        for equipment in self.equipment.values() {
            if let Err(err) = equipment.send_command(command.clone()).await {
                errors.push(err);
            }
        }
        broadcast_result(state, errors)
    }

    /// Looks up an Equipment by name.
    pub fn equipment(&self, name: &str) -> Option<&Equipment> {
        self.equipment.get(name)
    }

    /// Mutable lookup, e.g. to start a single worker or read its responses.
    pub fn equipment_mut(&mut self, name: &str) -> Option<&mut Equipment> {
        self.equipment.get_mut(name)
    }

    /// Registered names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.equipment.keys().cloned().collect()
    }

    /// Number of registered Equipment.
    pub fn len(&self) -> usize {
        self.equipment.len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.equipment.is_empty()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn broadcast_result(command: &'static str, errors: Vec<EquipmentError>) -> EquipmentResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EquipmentError::Broadcast { command, errors })
    }
}
