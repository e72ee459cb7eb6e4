//! Streaming packet codec.
//!
//! Instruments push fixed-layout UDP datagrams:
//!
//! ```text
//! +----------------+-------------------------------------------+
//! | header: u32 BE | payload: 256 x f32 BE (IEEE-754)          |
//! +----------------+-------------------------------------------+
//!   4 bytes          1024 bytes                     = 1028 bytes
//! ```
//!
//! Only the low byte of the header is meaningful: a cyclic sequence counter used for
//! diagnostics. The payload length does not depend on the configured channel set.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PacketError;

/// Number of measurements carried by every packet.
pub const PAYLOAD_VALUES: usize = 256;

/// Size of the big-endian header word.
pub const HEADER_LEN: usize = 4;

/// Total datagram size on the wire.
pub const PACKET_LEN: usize = HEADER_LEN + PAYLOAD_VALUES * 4;

/// A decoded streaming packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Cyclic sequence counter (header & 0xff).
    pub counter: u8,
    /// Exactly [`PAYLOAD_VALUES`] measurements.
    pub payload: Vec<f32>,
}

impl Packet {
    /// Builds a packet, rejecting payloads that are not exactly 256 values long.
    pub fn new(counter: u8, payload: Vec<f32>) -> Result<Self, PacketError> {
        if payload.len() != PAYLOAD_VALUES {
            return Err(PacketError::PayloadSize {
                expected: PAYLOAD_VALUES,
                actual: payload.len(),
            });
        }
        Ok(Self { counter, payload })
    }

    /// Packet with every measurement set to `value`.
    pub fn filled(counter: u8, value: f32) -> Self {
        Self {
            counter,
            payload: vec![value; PAYLOAD_VALUES],
        }
    }

    /// Serializes the packet into its 1028-byte wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_LEN);
        buf.put_u32(u32::from(self.counter));
        for value in &self.payload {
            buf.put_f32(*value);
        }
        buf.freeze()
    }

    /// Parses a datagram.
    ///
    /// The length is checked before any byte is consumed; truncated or oversized
    /// datagrams are rejected rather than partially parsed.
    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() != PACKET_LEN {
            return Err(PacketError::Length {
                expected: PACKET_LEN,
                actual: datagram.len(),
            });
        }

        let mut buf = datagram;
        let header = buf.get_u32();
        let payload = (0..PAYLOAD_VALUES).map(|_| buf.get_f32()).collect();

        Ok(Self {
            counter: (header & 0xff) as u8,
            payload,
        })
    }

    /// Stamps the packet payload with a receive time.
    pub fn into_sample(self, timestamp: DateTime<Utc>) -> Sample {
        Sample {
            timestamp,
            values: self.payload,
        }
    }
}

/// One timestamped vector of measurements, as buffered by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Wall-clock receive time.
    pub timestamp: DateTime<Utc>,
    /// The packet payload.
    pub values: Vec<f32>,
}

impl Sample {
    /// Receive time in nanoseconds since the Unix epoch.
    ///
    /// Saturates at `i64::MAX` for dates past 2262.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    /// Number of fields in a flattened row: the timestamp plus every value.
    pub fn width(&self) -> usize {
        1 + self.values.len()
    }
}

/// Tracks the cyclic counter to spot lost or reordered packets.
///
/// Purely diagnostic: nothing is reordered or re-requested.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceTracker {
    last: Option<u8>,
    gaps: u64,
}

impl SequenceTracker {
    /// Records a counter value; returns `true` if it does not follow the previous one.
    pub fn observe(&mut self, counter: u8) -> bool {
        let gap = matches!(self.last, Some(prev) if prev.wrapping_add(1) != counter);
        if gap {
            self.gaps += 1;
        }
        self.last = Some(counter);
        gap
    }

    /// Discontinuities observed so far.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Forgets the previous counter, e.g. when a new collection starts.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
