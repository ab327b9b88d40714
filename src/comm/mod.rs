//! Inter-rank communication.
//!
//! The exchange and target-list layers talk to other ranks only through the
//! [`Communicator`] trait: non-blocking point-to-point spike messages plus a
//! handful of collectives. [`local::LocalCluster`] implements it with one OS
//! thread per rank.

pub mod local;

pub use local::{LocalCluster, LocalComm};

use crate::error::NetResult;
use crate::types::{Gid, Rank, SimTime};

/// Size of an encoded [`SpikeMessage`].
pub const SPIKE_MESSAGE_BYTES: usize = 12;

/// A spike on the wire: `(gid, time)`.
///
/// The gid is bitwise complemented when the spike belongs to the odd
/// receive buffer, so a negative wire gid identifies buffer 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpikeMessage {
    pub gid: i32,
    pub time: f64,
}

impl SpikeMessage {
    pub fn new(gid: Gid, time: SimTime) -> Self {
        Self { gid, time }
    }

    /// Encodes the gid for receive buffer `parity` (0 or 1).
    pub fn for_buffer(gid: Gid, time: SimTime, parity: usize) -> Self {
        let gid = if parity == 1 { !gid } else { gid };
        Self { gid, time }
    }

    /// Decodes the buffer parity and the original gid.
    pub fn buffer_and_gid(&self) -> (usize, Gid) {
        if self.gid < 0 {
            (1, !self.gid)
        } else {
            (0, self.gid)
        }
    }

    /// Little-endian `gid:i32, time:f64`.
    pub fn to_bytes(&self) -> [u8; SPIKE_MESSAGE_BYTES] {
        let mut buf = [0u8; SPIKE_MESSAGE_BYTES];
        buf[..4].copy_from_slice(&self.gid.to_le_bytes());
        buf[4..].copy_from_slice(&self.time.to_le_bytes());
        buf
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(buf: &[u8; SPIKE_MESSAGE_BYTES]) -> Self {
        let mut gid = [0u8; 4];
        let mut time = [0u8; 8];
        gid.copy_from_slice(&buf[..4]);
        time.copy_from_slice(&buf[4..]);
        Self { gid: i32::from_le_bytes(gid), time: f64::from_le_bytes(time) }
    }

    /// Concatenates the wire form of `spikes`.
    pub fn encode_all(spikes: &[SpikeMessage]) -> Vec<u8> {
        spikes.iter().flat_map(SpikeMessage::to_bytes).collect()
    }

    /// Decodes a buffer written by [`encode_all`](Self::encode_all). A
    /// trailing partial record is ignored.
    pub fn decode_all(bytes: &[u8]) -> Vec<SpikeMessage> {
        bytes
            .chunks_exact(SPIKE_MESSAGE_BYTES)
            .filter_map(|chunk| <&[u8; SPIKE_MESSAGE_BYTES]>::try_from(chunk).ok())
            .map(SpikeMessage::from_bytes)
            .collect()
    }
}

/// Point-to-point and collective operations between ranks.
///
/// Collectives must be entered by every rank in the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Sends a spike to `dest` without blocking.
    fn send_spike(&self, dest: Rank, msg: SpikeMessage) -> NetResult<()>;

    /// Returns one arrived spike, if any, without blocking.
    fn try_recv_spike(&self) -> NetResult<Option<SpikeMessage>>;

    /// Personalized all-to-all: `send[r]` goes to rank `r`. The result holds
    /// at index `r` what rank `r` sent here.
    fn alltoallv(&self, send: Vec<Vec<i32>>) -> NetResult<Vec<Vec<i32>>>;

    fn allreduce_sum(&self, value: i64) -> NetResult<i64>;

    fn allreduce_min(&self, value: f64) -> NetResult<f64>;

    /// Every rank receives every rank's buffer, indexed by rank.
    fn allgather_bytes(&self, bytes: Vec<u8>) -> NetResult<Vec<Vec<u8>>>;

    /// Every rank receives the concatenation of all ranks' spikes, in rank order.
    fn allgather_spikes(&self, spikes: Vec<SpikeMessage>) -> NetResult<Vec<SpikeMessage>> {
        let parts = self.allgather_bytes(SpikeMessage::encode_all(&spikes))?;
        Ok(parts.iter().flat_map(|part| SpikeMessage::decode_all(part)).collect())
    }

    fn barrier(&self) -> NetResult<()> {
        self.allreduce_sum(0).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_parity_encoding() {
        let even = SpikeMessage::for_buffer(7, 1.0, 0);
        let odd = SpikeMessage::for_buffer(7, 1.0, 1);
        assert_eq!(even.gid, 7);
        assert!(odd.gid < 0);
        assert_eq!(even.buffer_and_gid(), (0, 7));
        assert_eq!(odd.buffer_and_gid(), (1, 7));
        assert_eq!(SpikeMessage::for_buffer(0, 1.0, 1).buffer_and_gid(), (1, 0));
    }

    #[test]
    fn test_wire_layout() {
        let msg = SpikeMessage::new(-2, 0.125);
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..4], &(-2i32).to_le_bytes());
        assert_eq!(SpikeMessage::from_bytes(&bytes), msg);
    }

    #[test]
    fn test_decode_ignores_partial_record() {
        let spikes = [SpikeMessage::new(3, 1.5), SpikeMessage::for_buffer(9, 2.0, 1)];
        let mut bytes = SpikeMessage::encode_all(&spikes);
        assert_eq!(bytes.len(), 2 * SPIKE_MESSAGE_BYTES);
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(SpikeMessage::decode_all(&bytes), spikes.to_vec());
    }
}
