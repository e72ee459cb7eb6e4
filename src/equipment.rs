//! Supervisor-side handle for one device worker.
//!
//! An [`Equipment`] owns the Supervisor half of the duplex channel and, once started,
//! the worker task's `JoinHandle`. The worker itself ([`DeviceWorker`]) is only built
//! when [`Equipment::start`] spawns it. Commands sent before that are queued in the
//! channel and processed in order once the loop runs.
//!
//! ## Lifecycle
//!
//! ```text
//! Constructed --start()--> Running --stop()--> Terminated
//! ```
//!
//! A terminated Equipment cannot be restarted; build a new one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{EquipmentError, EquipmentResult};
use crate::packet::Sample;
use crate::protocol::{Command, Response};
use crate::transport::{Endpoint, TransportFactory, UdpTransportFactory};
use crate::worker::{DeviceWorker, WorkerSettings};

/// Maximum number of unread responses an Equipment keeps aside while pinging.
///
/// When full, the oldest response is discarded.
pub const PENDING_CAPACITY: usize = 32;

/// Channel and shutdown settings shared by every Equipment of a Supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquipmentSettings {
    /// Worker loop timings.
    pub worker: WorkerSettings,
    /// Capacity of the Supervisor → worker command queue.
    pub command_capacity: usize,
    /// How long `stop` waits for the worker to exit before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for EquipmentSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            command_capacity: 64,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Where an Equipment is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Registered, worker not spawned yet.
    Constructed,
    /// Worker task spawned.
    Running,
    /// Stopped; cannot be restarted.
    Terminated,
}

struct WorkerEndpoint {
    commands: mpsc::Receiver<Command>,
    responses: mpsc::UnboundedSender<Response>,
}

/// Handle to one instrument's worker.
pub struct Equipment {
    name: String,
    endpoint: Endpoint,
    settings: EquipmentSettings,
    factory: Arc<dyn TransportFactory>,
    commands: Option<mpsc::Sender<Command>>,
    responses: Option<mpsc::UnboundedReceiver<Response>>,
    worker_endpoint: Option<WorkerEndpoint>,
    task: Option<JoinHandle<()>>,
    lifecycle: Lifecycle,
    pending: VecDeque<Response>,
}

impl Equipment {
    /// Equipment streaming over UDP with default settings.
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self::with_settings(
            name,
            address,
            port,
            EquipmentSettings::default(),
            Arc::new(UdpTransportFactory),
        )
    }

    /// Equipment with explicit settings and transport factory.
    pub fn with_settings(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        settings: EquipmentSettings,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.command_capacity.max(1));
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();

        Self {
            name: name.into(),
            endpoint: Endpoint::new(address, port),
            settings,
            factory,
            commands: Some(cmd_tx),
            responses: Some(resp_rx),
            worker_endpoint: Some(WorkerEndpoint {
                commands: cmd_rx,
                responses: resp_tx,
            }),
            task: None,
            lifecycle: Lifecycle::Constructed,
            pending: VecDeque::new(),
        }
    }

    /// Spawns the worker loop.
    ///
    /// Fails if the worker is already running or has terminated.
    pub fn start(&mut self) -> EquipmentResult<()> {
        match self.lifecycle {
            Lifecycle::Running => return Err(EquipmentError::AlreadyRunning(self.name.clone())),
            Lifecycle::Terminated => return Err(EquipmentError::Terminated(self.name.clone())),
            Lifecycle::Constructed => {}
        }

        let WorkerEndpoint {
            commands,
            responses,
        } = self
            .worker_endpoint
            .take()
            .ok_or_else(|| EquipmentError::Terminated(self.name.clone()))?;

        let worker = DeviceWorker::new(
            self.name.clone(),
            self.endpoint.clone(),
            self.settings.worker,
            Arc::clone(&self.factory),
            commands,
            responses,
        );
        let span = info_span!("equipment", name = %self.name);
        self.task = Some(tokio::spawn(worker.run().instrument(span)));
        self.lifecycle = Lifecycle::Running;

        info!(equipment = %self.name, endpoint = %self.endpoint, "Equipment started");
        Ok(())
    }

    /// Stops the worker: sends `shutdown`, waits the grace period, aborts if needed,
    /// then closes the Supervisor side of the channel.
    ///
    /// Returns within the grace period even when the worker is wedged and its
    /// command queue is full.
    ///
    /// A no-op for Equipment that was never started or is already stopped.
    /// Responses still queued in the channel stay available via [`recv_response`].
    ///
    /// [`recv_response`]: Self::recv_response
    pub async fn stop(&mut self) -> EquipmentResult<()> {
        if self.lifecycle != Lifecycle::Running {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Terminated;

        // Queueing the shutdown and joining the task share one grace period.
        let deadline = Instant::now() + self.settings.shutdown_grace;
        if let Some(commands) = &self.commands {
            match commands
                .send_timeout(Command::Shutdown, self.settings.shutdown_grace)
                .await
            {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(equipment = %self.name, "Command queue full, shutdown not delivered");
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(equipment = %self.name, "Worker already gone before shutdown");
                }
            }
        }

        let mut result = Ok(());
        if let Some(mut task) = self.task.take() {
            match timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {
                    info!(equipment = %self.name, "Equipment shutdown successfully");
                }
                Ok(Err(err)) => {
                    error!(equipment = %self.name, error = %err, "Worker task panicked");
                    result = Err(EquipmentError::WorkerPanicked(
                        self.name.clone(),
                        err.to_string(),
                    ));
                }
                Err(_) => {
                    warn!(
                        equipment = %self.name,
                        grace_ms = self.settings.shutdown_grace.as_millis() as u64,
                        "Equipment shutdown timeout, aborting"
                    );
                    task.abort();
                }
            }
        }

        self.commands = None;
        if let Some(mut responses) = self.responses.take() {
            responses.close();
            while let Ok(response) = responses.try_recv() {
                self.stash(response);
            }
        }

        result
    }

    /// Queues a command for the worker.
    ///
    /// Before `start`, commands are buffered up to the channel capacity.
    pub async fn send_command(&self, command: Command) -> EquipmentResult<()> {
        let sender = self
            .commands
            .as_ref()
            .ok_or_else(|| EquipmentError::ChannelClosed(self.name.clone()))?;

        if self.lifecycle == Lifecycle::Constructed {
            // Nobody drains the queue yet, so waiting for space would never finish.
            return sender.try_send(command).map_err(|err| match err {
                TrySendError::Full(_) => EquipmentError::QueueFull(self.name.clone()),
                TrySendError::Closed(_) => EquipmentError::ChannelClosed(self.name.clone()),
            });
        }

        sender
            .send(command)
            .await
            .map_err(|_| EquipmentError::ChannelClosed(self.name.clone()))
    }

    /// Like [`send_command`](Self::send_command), but gives up once `wait` has passed
    /// without room in the queue.
    pub async fn send_command_within(
        &self,
        command: Command,
        wait: Duration,
    ) -> EquipmentResult<()> {
        if self.lifecycle == Lifecycle::Constructed {
            return self.send_command(command).await;
        }

        let sender = self
            .commands
            .as_ref()
            .ok_or_else(|| EquipmentError::ChannelClosed(self.name.clone()))?;
        sender
            .send_timeout(command, wait)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => EquipmentError::QueueFull(self.name.clone()),
                SendTimeoutError::Closed(_) => EquipmentError::ChannelClosed(self.name.clone()),
            })
    }

    /// Next response from the worker, waiting at most `wait`.
    pub async fn recv_response(&mut self, wait: Duration) -> Option<Response> {
        if let Some(response) = self.pending.pop_front() {
            return Some(response);
        }
        let responses = self.responses.as_mut()?;
        timeout(wait, responses.recv()).await.ok().flatten()
    }

    /// Sends a uniquely tagged ping and waits for the matching pong.
    ///
    /// The whole probe, including queueing the command, is bounded by `wait`.
    /// Other responses that arrive meanwhile are kept for [`recv_response`], up to
    /// [`PENDING_CAPACITY`]; stale pongs from earlier probes are discarded.
    ///
    /// [`recv_response`]: Self::recv_response
    pub async fn ping(&mut self, wait: Duration) -> bool {
        let id = format!("ping-{}", Uuid::new_v4());
        let deadline = Instant::now() + wait;
        if let Err(err) = self.send_command_within(Command::ping(id.clone()), wait).await {
            debug!(equipment = %self.name, error = %err, "Ping not sent");
            return false;
        }

        let Some(responses) = self.responses.as_mut() else {
            return false;
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, responses.recv()).await {
                Ok(Some(response)) => {
                    if response.as_pong_for(&id).is_some() {
                        return true;
                    }
                    if !matches!(response, Response::Pong(_)) {
                        stash_into(&mut self.pending, &self.name, response);
                    }
                }
                Ok(None) | Err(_) => return false,
            }
        }
    }

    /// Waits up to `wait` for the next `data` response and returns its samples.
    ///
    /// Pongs seen while waiting are dropped. Returns `None` when no data arrived,
    /// which is also the outcome for a worker whose buffer was empty.
    pub async fn recv_data(&mut self, wait: Duration) -> Option<Vec<Sample>> {
        if let Some(index) = self
            .pending
            .iter()
            .position(|response| matches!(response, Response::Data(_)))
        {
            if let Some(Response::Data(data)) = self.pending.remove(index) {
                return Some(data.buffer);
            }
        }

        let deadline = Instant::now() + wait;
        let responses = self.responses.as_mut()?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, responses.recv()).await {
                Ok(Some(Response::Data(data))) => return Some(data.buffer),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    fn stash(&mut self, response: Response) {
        stash_into(&mut self.pending, &self.name, response);
    }

    /// Responses set aside by `ping` and not read yet.
    pub fn pending_responses(&self) -> usize {
        self.pending.len()
    }

    /// Whether the worker task is alive.
    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Current lifecycle stage.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Equipment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument address.
    pub fn address(&self) -> &str {
        &self.endpoint.address
    }

    /// Streaming port.
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Address and port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

fn stash_into(pending: &mut VecDeque<Response>, name: &str, response: Response) {
    if pending.len() >= PENDING_CAPACITY {
        if let Some(dropped) = pending.pop_front() {
            warn!(
                equipment = %name,
                state = dropped.state(),
                "Pending responses full, discarding oldest"
            );
        }
    }
    pending.push_back(response);
}

impl Drop for Equipment {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!(equipment = %self.name, "Aborting worker of dropped equipment");
                task.abort();
            }
        }
    }
}
