//! Mock Transport
//!
//! Simulated instrument stream for testing without hardware.
//!
//! # Behaviour
//!
//! - Delivers a finite queue of datagrams, one per `interval` (10ms by default)
//! - Once the queue is exhausted every `receive` waits the full timeout and returns `None`
//! - Frames passed to `send` are recorded and can be inspected through the factory
//!
//! The default stream matches a freshly armed instrument: 10 packets with counters
//! 0..9 and every measurement equal to 1.0.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{Endpoint, Transport, TransportFactory};
use crate::error::{EquipmentError, EquipmentResult};
use crate::packet::Packet;
use crate::protocol::ConfigureParams;

/// Default number of packets a mock stream produces.
pub const DEFAULT_PACKET_COUNT: usize = 10;

/// Default delay between mock packets.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);

/// Finite, in-memory packet source.
pub struct MockTransport {
    packets: VecDeque<Bytes>,
    interval: Duration,
    sent: Arc<Mutex<Vec<Bytes>>>,
    closed: bool,
}

impl MockTransport {
    /// Stream of `count` packets, counters `0..count` (wrapping), payload all `value`.
    pub fn uniform(count: usize, value: f32) -> Self {
        Self::scripted(uniform_packets(count, value))
    }

    /// Delivers exactly the given datagrams, in order, including malformed ones.
    pub fn scripted(packets: Vec<Bytes>) -> Self {
        Self {
            packets: packets.into(),
            interval: DEFAULT_INTERVAL,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Overrides the delay between packets.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Datagrams not yet delivered.
    pub fn remaining(&self) -> usize {
        self.packets.len()
    }

    fn ensure_open(&self) -> EquipmentResult<()> {
        if self.closed {
            Err(EquipmentError::Transport("mock transport is closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: &[u8]) -> EquipmentResult<()> {
        self.ensure_open()?;
        self.sent.lock().await.push(Bytes::copy_from_slice(frame));
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> EquipmentResult<Option<Bytes>> {
        self.ensure_open()?;

        if self.packets.is_empty() {
            sleep(timeout).await;
            return Ok(None);
        }

        // Pop only after the delay so a cancelled receive loses nothing.
        sleep(self.interval).await;
        Ok(self.packets.pop_front())
    }

    async fn close(&mut self) -> EquipmentResult<()> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

/// Creates a fresh [`MockTransport`] each time a worker is configured.
#[derive(Clone)]
pub struct MockTransportFactory {
    packets: Vec<Bytes>,
    interval: Duration,
    sent: Arc<Mutex<Vec<Bytes>>>,
    opened: Arc<AtomicUsize>,
}

impl MockTransportFactory {
    /// Ten packets of 1.0, counters 0..9.
    pub fn new() -> Self {
        Self::uniform(DEFAULT_PACKET_COUNT, 1.0)
    }

    /// `count` packets with every measurement equal to `value`.
    pub fn uniform(count: usize, value: f32) -> Self {
        Self::scripted(uniform_packets(count, value))
    }

    /// Every opened transport replays exactly these datagrams.
    pub fn scripted(packets: Vec<Bytes>) -> Self {
        Self {
            packets,
            interval: DEFAULT_INTERVAL,
            sent: Arc::new(Mutex::new(Vec::new())),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Overrides the delay between packets.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Frames sent by all transports this factory opened, in send order.
    pub async fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().await.clone()
    }

    /// Number of transports opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(
        &self,
        _endpoint: &Endpoint,
        _params: &ConfigureParams,
    ) -> EquipmentResult<Box<dyn Transport>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            packets: self.packets.iter().cloned().collect(),
            interval: self.interval,
            sent: Arc::clone(&self.sent),
            closed: false,
        }))
    }
}

fn uniform_packets(count: usize, value: f32) -> Vec<Bytes> {
    (0..count)
        .map(|i| Packet::filled((i & 0xff) as u8, value).encode())
        .collect()
}
