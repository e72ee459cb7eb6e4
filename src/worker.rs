//! Device worker event loop.
//!
//! One `DeviceWorker` runs per instrument, as its own tokio task. It exclusively owns
//! the instrument's transport, its sample buffer, and the worker half of the duplex
//! channel. Nothing in it is shared with other workers or with the Supervisor.
//!
//! # State Machine
//!
//! ```text
//!                 start_collection
//!        +------+ ---------------> +-----------+
//!        | Idle |                  | Streaming |
//!        +------+ <--------------- +-----------+
//!           |      stop_collection       |
//!           |                            |
//!           +--------- shutdown ---------+----> Terminated
//! ```
//!
//! # Loop Body
//!
//! - **Streaming**: `tokio::select!` (biased) between the command channel and one
//!   bounded transport receive. The command branch is polled first, so a pending
//!   command always wins over a ready packet.
//! - **Idle**: wait on the command channel for at most `control_poll`, then loop.
//!
//! Both waits are bounded, so the loop never blocks indefinitely and never spins.
//! Receive timeouts are the normal case and are not logged.

use bytes::Bytes;
use chrono::Utc;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::EquipmentResult;
use crate::packet::{Packet, Sample, SequenceTracker};
use crate::protocol::{
    Command, ConfigureParams, DataPayload, PingParams, PongPayload, Response, StartParams,
};
use crate::transport::{Endpoint, Transport, TransportFactory};

/// Timing knobs for the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Maximum wait on the command channel while idle.
    pub control_poll: Duration,
    /// Maximum wait for one datagram while streaming.
    pub receive_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            control_poll: Duration::from_millis(100),
            receive_timeout: Duration::from_millis(10),
        }
    }
}

/// Whether the worker is ingesting packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Not reading from the transport.
    #[default]
    Idle,
    /// Reading and buffering packets.
    Streaming,
}

/// Counters kept while ingesting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Packets decoded and buffered.
    pub packets_received: u64,
    /// Datagrams dropped for having the wrong layout.
    pub packets_dropped: u64,
    /// Transport errors other than timeouts.
    pub receive_errors: u64,
    /// Counter discontinuities (lost or reordered packets).
    pub sequence_gaps: u64,
}

enum Event {
    Command(Option<Command>),
    Datagram(EquipmentResult<Option<Bytes>>),
    Idle,
}

/// Worker side of one instrument.
pub struct DeviceWorker {
    name: String,
    endpoint: Endpoint,
    settings: WorkerSettings,
    factory: Arc<dyn TransportFactory>,
    commands: mpsc::Receiver<Command>,
    responses: mpsc::UnboundedSender<Response>,
    transport: Option<Box<dyn Transport>>,
    running: bool,
    stream: StreamState,
    config: Option<ConfigureParams>,
    collection: Option<StartParams>,
    buffer: Vec<Sample>,
    sequence: SequenceTracker,
    stats: IngestStats,
}

impl DeviceWorker {
    /// Creates a worker in the `Idle, Running` state with no transport.
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        settings: WorkerSettings,
        factory: Arc<dyn TransportFactory>,
        commands: mpsc::Receiver<Command>,
        responses: mpsc::UnboundedSender<Response>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            settings,
            factory,
            commands,
            responses,
            transport: None,
            running: true,
            stream: StreamState::Idle,
            config: None,
            collection: None,
            buffer: Vec::new(),
            sequence: SequenceTracker::default(),
            stats: IngestStats::default(),
        }
    }

    /// Runs until `shutdown` is received or the Supervisor drops its command sender.
    ///
    /// Consumes the worker; its channel halves are closed when this returns.
    pub async fn run(mut self) {
        info!(equipment = %self.name, endpoint = %self.endpoint, "Worker loop started");

        while self.running {
            match self.next_event().await {
                Event::Command(Some(command)) => self.dispatch(command).await,
                Event::Command(None) => {
                    debug!(equipment = %self.name, "Command channel closed, shutting down");
                    self.shutdown().await;
                }
                Event::Datagram(result) => self.ingest(result).await,
                Event::Idle => {}
            }
        }

        self.commands.close();
        info!(
            equipment = %self.name,
            packets_received = self.stats.packets_received,
            packets_dropped = self.stats.packets_dropped,
            sequence_gaps = self.stats.sequence_gaps,
            "Worker loop exited"
        );
    }

    async fn next_event(&mut self) -> Event {
        let receive_timeout = self.settings.receive_timeout;

        match (self.stream, self.transport.as_mut()) {
            (StreamState::Streaming, Some(transport)) => {
                tokio::select! {
                    biased;
                    command = self.commands.recv() => Event::Command(command),
                    datagram = transport.receive(receive_timeout) => Event::Datagram(datagram),
                }
            }
            _ => match timeout(self.settings.control_poll, self.commands.recv()).await {
                Ok(command) => Event::Command(command),
                Err(_) => Event::Idle,
            },
        }
    }

    /// Applies exactly one command.
    pub async fn dispatch(&mut self, command: Command) {
        trace!(equipment = %self.name, state = command.state(), "Dispatching command");

        match command {
            Command::Configure(params) => self.configure(params).await,
            Command::StartCollection(params) => self.start_collection(params),
            Command::StopCollection => self.stop_collection(),
            Command::GetData => self.send_data(),
            Command::Ping(params) => self.respond_to_ping(params),
            Command::Shutdown => self.shutdown().await,
        }
    }

    async fn configure(&mut self, params: ConfigureParams) {
        info!(
            equipment = %self.name,
            channels = %params.channels,
            rate = params.rate,
            packet_size = params.packet_size,
            "Configuring equipment"
        );

        self.close_transport().await;

        match self.factory.open(&self.endpoint, &params).await {
            Ok(mut transport) => {
                match serde_json::to_vec(&params) {
                    Ok(frame) => {
                        if let Err(err) = transport.send(&frame).await {
                            warn!(equipment = %self.name, error = %err, "Failed to send configuration frame");
                        }
                    }
                    Err(err) => {
                        warn!(equipment = %self.name, error = %err, "Failed to encode configuration frame");
                    }
                }
                self.transport = Some(transport);
            }
            Err(err) => {
                error!(equipment = %self.name, endpoint = %self.endpoint, error = %err, "Failed to open transport");
                self.stream = StreamState::Idle;
            }
        }

        self.config = Some(params);
    }

    fn start_collection(&mut self, params: StartParams) {
        self.buffer.clear();
        self.sequence.reset();

        if self.transport.is_none() {
            warn!(equipment = %self.name, "start_collection ignored: equipment not configured");
            self.collection = Some(params);
            return;
        }

        info!(
            equipment = %self.name,
            duration_secs = params.duration,
            file = ?params.file,
            "Starting collection"
        );
        self.stream = StreamState::Streaming;
        self.collection = Some(params);
    }

    fn stop_collection(&mut self) {
        info!(
            equipment = %self.name,
            buffered = self.buffer.len(),
            packets_received = self.stats.packets_received,
            packets_dropped = self.stats.packets_dropped,
            sequence_gaps = self.stats.sequence_gaps,
            "Stopping collection"
        );
        self.stream = StreamState::Idle;
    }

    fn send_data(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let buffer = mem::take(&mut self.buffer);
        debug!(equipment = %self.name, samples = buffer.len(), "Flushing buffer");
        self.respond(Response::Data(DataPayload { buffer }));
    }

    fn respond_to_ping(&mut self, params: PingParams) {
        self.respond(Response::Pong(PongPayload {
            id: params.id,
            name: self.name.clone(),
        }));
    }

    async fn shutdown(&mut self) {
        info!(equipment = %self.name, "Shutting down");
        self.stream = StreamState::Idle;
        self.running = false;
        self.close_transport().await;
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                debug!(equipment = %self.name, error = %err, "Transport close failed");
            }
        }
    }

    fn respond(&self, response: Response) {
        if let Err(err) = self.responses.send(response) {
            warn!(
                equipment = %self.name,
                state = err.0.state(),
                "Supervisor dropped the response channel"
            );
        }
    }

    async fn ingest(&mut self, result: EquipmentResult<Option<Bytes>>) {
        match result {
            Ok(Some(datagram)) => match Packet::decode(&datagram) {
                Ok(packet) => {
                    if self.sequence.observe(packet.counter) {
                        self.stats.sequence_gaps = self.sequence.gaps();
                        trace!(equipment = %self.name, counter = packet.counter, "Sequence gap");
                    }
                    self.stats.packets_received += 1;
                    self.buffer.push(packet.into_sample(Utc::now()));
                }
                Err(err) => {
                    self.stats.packets_dropped += 1;
                    warn!(equipment = %self.name, error = %err, "Dropping malformed packet");
                }
            },
            Ok(None) => {}
            Err(err) => {
                self.stats.receive_errors += 1;
                debug!(equipment = %self.name, error = %err, "Transport receive failed");
                // Failing sockets return immediately; back off instead of spinning.
                tokio::time::sleep(self.settings.receive_timeout).await;
            }
        }
    }

    /// Equipment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current streaming state.
    pub fn stream_state(&self) -> StreamState {
        self.stream
    }

    /// `false` once `shutdown` was handled.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether a transport is currently open.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Last applied configuration.
    pub fn config(&self) -> Option<&ConfigureParams> {
        self.config.as_ref()
    }

    /// Parameters of the last `start_collection`.
    pub fn collection(&self) -> Option<&StartParams> {
        self.collection.as_ref()
    }

    /// Samples accumulated since the last flush.
    pub fn buffered(&self) -> &[Sample] {
        &self.buffer
    }

    /// Ingestion counters.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }
}
