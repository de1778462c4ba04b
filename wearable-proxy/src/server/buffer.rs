//! Fixed-size receive and transmit buffers.
//!
//! Both buffers are allocated once per server and reused for every client.
//! The receive side reassembles frames that arrive split across reads and
//! throws everything away when the stream stops making sense.

use log::warn;

use wearable_protocol::{decode_inbound, encode, Packet, ProtocolError, ServerError};

/// Inbound byte buffer with frame reassembly.
///
/// Bytes `[0, receive_index)` are pending data. `packet_index` marks how far
/// the current read cycle has decoded; it is always 0 between cycles.
pub struct ReceiveBuffer {
    buf: Box<[u8]>,
    receive_index: usize,
    packet_index: usize,
    /// Set after a malformed frame is reported, cleared by the next good one.
    warned_malformed: bool,
    malformed_count: u64,
    /// Bytes thrown away with malformed frames.
    discarded_bytes: u64,
    overflow_count: u64,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            receive_index: 0,
            packet_index: 0,
            warned_malformed: false,
            malformed_count: 0,
            discarded_bytes: 0,
            overflow_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes waiting to be decoded.
    pub fn len(&self) -> usize {
        self.receive_index - self.packet_index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes waiting to be decoded.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.packet_index..self.receive_index]
    }

    /// Times the stream was discarded because of a malformed frame.
    pub fn malformed_count(&self) -> u64 {
        self.malformed_count
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Times the buffer was dumped because it filled up.
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    /// Drop all pending bytes and reset the per-client counters.
    pub fn clear(&mut self) {
        self.receive_index = 0;
        self.packet_index = 0;
        self.warned_malformed = false;
        self.malformed_count = 0;
        self.discarded_bytes = 0;
        self.overflow_count = 0;
    }

    /// Free space to read into.
    ///
    /// A full buffer that still holds no complete frame can never make
    /// progress, so it is emptied first. That loses data, but only happens
    /// when the peer sends a frame larger than the buffer.
    pub fn spare_capacity(&mut self) -> &mut [u8] {
        if self.packet_index > 0 {
            self.compact();
        }

        if self.receive_index == self.capacity() {
            warn!(
                "{}; dropping buffered bytes",
                ServerError::BufferExhausted {
                    capacity: self.capacity()
                }
            );
            self.overflow_count += 1;
            self.receive_index = 0;
        }

        &mut self.buf[self.receive_index..]
    }

    /// Mark `n` bytes of [`spare_capacity`](Self::spare_capacity) as received.
    pub fn commit(&mut self, n: usize) {
        assert!(
            self.receive_index + n <= self.buf.len(),
            "committed past the end of the receive buffer"
        );
        self.receive_index += n;
    }

    /// Copy as much of `data` as fits. Returns the number of bytes taken.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_capacity();
        let n = data.len().min(spare.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }

    /// Decode the next complete packet.
    ///
    /// Returns `None` when the read cycle is over: either everything was
    /// consumed, the remaining bytes are a partial frame (moved to the front
    /// of the buffer for the next read), or the stream was malformed and
    /// the whole buffer was discarded.
    pub fn next_packet(&mut self) -> Option<Packet> {
        if self.packet_index == self.receive_index {
            self.receive_index = 0;
            self.packet_index = 0;
            return None;
        }

        match decode_inbound(&self.buf[self.packet_index..self.receive_index]) {
            Ok((packet, consumed)) => {
                self.packet_index += consumed;
                self.warned_malformed = false;
                Some(packet)
            }
            Err(e) if e.is_incomplete() => {
                self.compact();
                None
            }
            Err(e) => {
                self.discard_malformed(e);
                None
            }
        }
    }

    /// Move the undecoded tail `[packet_index, receive_index)` to the front.
    fn compact(&mut self) {
        self.buf.copy_within(self.packet_index..self.receive_index, 0);
        self.receive_index -= self.packet_index;
        self.packet_index = 0;
    }

    fn discard_malformed(&mut self, error: ProtocolError) {
        // Frames before packet_index were already dispatched.
        let discarded = self.receive_index - self.packet_index;

        // One warning per streak; a version mismatch would otherwise log
        // on every read.
        if !self.warned_malformed {
            warn!(
                "Malformed packet, discarding {} buffered bytes: {}",
                discarded, error
            );
            self.warned_malformed = true;
        }
        self.malformed_count += 1;
        self.discarded_bytes += discarded as u64;
        self.receive_index = 0;
        self.packet_index = 0;
    }
}

/// Outbound byte buffer.
pub struct TransmitBuffer {
    buf: Box<[u8]>,
    transmit_index: usize,
}

impl TransmitBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            transmit_index: 0,
        }
    }

    /// Start building a new outbound payload.
    pub fn reset(&mut self) {
        self.transmit_index = 0;
    }

    /// Append an encoded packet.
    pub fn encode(&mut self, packet: &Packet) -> Result<usize, ProtocolError> {
        encode(packet, &mut self.buf, &mut self.transmit_index)
    }

    /// The pending outbound payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.transmit_index]
    }

    pub fn len(&self) -> usize {
        self.transmit_index
    }

    pub fn is_empty(&self) -> bool {
        self.transmit_index == 0
    }
}
