//! Transport Capability
//!
//! A worker reads its instrument's sample stream through a [`Transport`]. The worker
//! does not know whether packets come from a real UDP socket or from a test double.
//! It only needs three operations:
//!
//! - `send` a frame to the instrument (used to push the acquisition configuration)
//! - `receive` one datagram, or report that none arrived within a timeout
//! - `close` the underlying resource
//!
//! Transports are created inside the worker when it handles `configure`, through the
//! [`TransportFactory`] the caller injected when building the Equipment. Choosing between
//! real and simulated hardware is therefore the caller's decision, not ambient
//! process state.
//!
//! # Design Philosophy
//!
//! - Async (uses #[async_trait])
//! - `receive` must be cancel-safe: the worker races it against the command channel
//!   and drops the future when a command wins
//! - A timeout is `Ok(None)`, never an error

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::error::EquipmentResult;
use crate::protocol::ConfigureParams;

pub mod mock;
pub mod udp;

pub use mock::{MockTransport, MockTransportFactory};
pub use udp::{UdpTransport, UdpTransportFactory};

/// Network location of an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address of the instrument.
    pub address: String,
    /// Streaming port; the worker binds it locally and sends control frames to it.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Packet source owned by a single worker.
#[async_trait]
pub trait Transport: Send {
    /// Sends one frame to the instrument.
    async fn send(&mut self, frame: &[u8]) -> EquipmentResult<()>;

    /// Waits up to `timeout` for one datagram.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn receive(&mut self, timeout: Duration) -> EquipmentResult<Option<Bytes>>;

    /// Releases the underlying resource. Further calls fail.
    async fn close(&mut self) -> EquipmentResult<()>;
}

/// Opens transports on behalf of workers.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a transport for `endpoint` with the settings being applied.
    async fn open(
        &self,
        endpoint: &Endpoint,
        params: &ConfigureParams,
    ) -> EquipmentResult<Box<dyn Transport>>;
}
