//! Broadcast spike exchange.
//!
//! Every rank contributes the spikes it fired during the interval and
//! receives everyone's. Spikes for gids without a local sink are ignored.
//! No target lists are needed, which makes this the reference method the
//! targeted exchange is checked against.
//!
//! With compression a spike shrinks from twelve bytes to two or five. Its
//! time becomes the number of `dt` steps since the previous exchange, and
//! its gid either four big-endian bytes or a one-byte index into the
//! sender's output gids.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::comm::{Communicator, SpikeMessage};
use crate::config::SpikeCompression;
use crate::error::{NetError, NetResult};
use crate::exchange::{ExchangeReport, ExchangeStats};
use crate::registry::{Source, SourceRegistry};
use crate::scheduler::{DeliveryEnv, SpikeOutput};
use crate::thread::ThreadState;
use crate::types::{Gid, SimTime, TIME_EPSILON};

/// Longest interval, in steps, a one-byte spike time can express.
pub const MAX_COMPRESSED_STEPS: u32 = u8::MAX as u32;

/// Most output gids a rank may have for one-byte gid indices.
const MAX_LOCAL_GIDS: usize = 256;

/// Bytes of the spike count that starts a compressed buffer.
const HEADER_BYTES: usize = 2;

/// Compact wire form shared by all ranks.
#[derive(Debug)]
struct Packing {
    dt: SimTime,
    nspike: usize,
    gid_bytes: usize,
    /// Output gids of every rank, indexed by one-byte gid, when gids are
    /// sent as indices.
    rank_gids: Option<Vec<Vec<Gid>>>,
    /// This rank's gid to index map, when gids are sent as indices.
    local_index: HashMap<Gid, u8>,
}

impl Packing {
    fn record_bytes(&self) -> usize {
        1 + self.gid_bytes
    }

    fn encode(&self, spikes: &[SpikeMessage], t_exchange: SimTime) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_BYTES + self.nspike.max(spikes.len()) * self.record_bytes());
        buf.extend_from_slice(&(spikes.len() as u16).to_be_bytes());
        for msg in spikes {
            let steps = ((msg.time - t_exchange) / self.dt + 0.5).max(0.0) as u8;
            buf.push(steps);
            match self.local_index.get(&msg.gid) {
                Some(&index) if self.rank_gids.is_some() => buf.push(index),
                _ => buf.extend_from_slice(&msg.gid.to_be_bytes()[4 - self.gid_bytes..]),
            }
        }
        buf
    }

    /// Spike count announced by a buffer header.
    fn count(buf: &[u8]) -> usize {
        match buf {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]) as usize,
            _ => 0,
        }
    }

    fn decode(&self, buf: &[u8], from: usize, t_exchange: SimTime) -> Vec<SpikeMessage> {
        let body = buf.get(HEADER_BYTES..).unwrap_or(&[]);
        body.chunks_exact(self.record_bytes())
            .take(Self::count(buf))
            .filter_map(|record| {
                let time = record[0] as f64 * self.dt + t_exchange;
                let gid = match &self.rank_gids {
                    Some(rank_gids) => *rank_gids.get(from)?.get(record[1] as usize)?,
                    None => {
                        let mut be = [0u8; 4];
                        be[4 - self.gid_bytes..].copy_from_slice(&record[1..]);
                        i32::from_be_bytes(be)
                    }
                };
                Some(SpikeMessage::new(gid, time))
            })
            .collect()
    }
}

/// Allgather exchange state for one rank.
pub struct AllgatherExchange {
    comm: Arc<dyn Communicator>,
    outgoing: Mutex<Vec<SpikeMessage>>,
    packing: Option<Packing>,
    t_exchange: Mutex<SimTime>,
    stats: Mutex<ExchangeStats>,
}

impl AllgatherExchange {
    /// Exchanges full twelve-byte spike messages.
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self {
            comm,
            outgoing: Mutex::new(Vec::new()),
            packing: None,
            t_exchange: Mutex::new(0.0),
            stats: Mutex::new(ExchangeStats::new("allgather")),
        }
    }

    /// Exchanges compressed spikes.
    ///
    /// Collective: with `gid_compress` every rank publishes its output gids.
    /// If any rank has more than 256 of them, gids fall back to four bytes.
    pub fn compressed(
        comm: Arc<dyn Communicator>,
        compression: SpikeCompression,
        dt: SimTime,
        registry: &SourceRegistry,
    ) -> NetResult<Self> {
        let mut packing = Packing {
            dt,
            nspike: compression.nspike,
            gid_bytes: 4,
            rank_gids: None,
            local_index: HashMap::new(),
        };

        if compression.gid_compress {
            let mine: Vec<Gid> = registry.output_gids().map(|(gid, _)| gid).collect();
            let most = -comm.allreduce_min(-(mine.len() as f64))?;
            if most as usize <= MAX_LOCAL_GIDS {
                let rank_gids = comm.alltoallv(vec![mine.clone(); comm.size()])?;
                packing.local_index = mine.iter().enumerate().map(|(i, &gid)| (gid, i as u8)).collect();
                packing.rank_gids = Some(rank_gids);
                packing.gid_bytes = 1;
            } else if comm.rank() == 0 {
                tracing::info!(most, "gid compression skipped; a rank has more than 256 output gids");
            }
        }

        tracing::debug!(
            rank = comm.rank(),
            nspike = packing.nspike,
            gid_bytes = packing.gid_bytes,
            "compressed allgather set up"
        );
        let mut ag = Self::new(comm);
        ag.packing = Some(packing);
        Ok(ag)
    }

    /// Keeps a histogram of the most spikes any rank sent per interval.
    pub fn with_max_histogram(mut self, bins: usize) -> Self {
        if bins > 0 {
            self.stats.get_mut().max_histogram = vec![0; bins];
        }
        self
    }

    /// True if spikes travel in the packed form.
    pub fn is_compressed(&self) -> bool {
        self.packing.is_some()
    }

    /// True if gids travel as one-byte indices.
    pub fn uses_local_gids(&self) -> bool {
        self.packing.as_ref().map_or(false, |p| p.rank_gids.is_some())
    }

    /// Compressed spike times only cover [`MAX_COMPRESSED_STEPS`] steps.
    pub fn check_interval(&self, usable_min_delay: SimTime) -> NetResult<()> {
        let Some(packing) = &self.packing else {
            return Ok(());
        };
        let steps = ((usable_min_delay + TIME_EPSILON) / packing.dt).floor();
        if steps > MAX_COMPRESSED_STEPS as f64 {
            return Err(NetError::IntervalTooLong {
                usable: usable_min_delay,
                dt: packing.dt,
                max_steps: MAX_COMPRESSED_STEPS,
            });
        }
        Ok(())
    }

    /// Drops unsent spikes and restarts interval timing at `t0`.
    pub fn reset(&self, t0: SimTime) {
        self.outgoing.lock().clear();
        *self.t_exchange.lock() = t0;
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ExchangeStats {
        self.stats.lock().clone()
    }

    /// Gathers every rank's spikes of the interval and delivers those with
    /// a local sink through thread 0.
    pub fn exchange(&self, env: &DeliveryEnv<'_>, thread0: &mut ThreadState) -> NetResult<ExchangeReport> {
        let outgoing = std::mem::take(&mut *self.outgoing.lock());
        let sent = outgoing.len();
        let me = self.comm.rank();
        let t_exchange = *self.t_exchange.lock();

        let payload = match &self.packing {
            Some(packing) => {
                if sent > u16::MAX as usize {
                    return Err(NetError::SendBufferOverflow { rank: me, count: sent });
                }
                packing.encode(&outgoing, t_exchange)
            }
            None => SpikeMessage::encode_all(&outgoing),
        };
        let parts = self.comm.allgather_bytes(payload)?;

        let mut counts = Vec::with_capacity(parts.len());
        let mut gathered = 0u64;
        let mut received = 0i64;
        for (from, part) in parts.iter().enumerate() {
            let spikes = match &self.packing {
                Some(packing) => packing.decode(part, from, t_exchange),
                None => SpikeMessage::decode_all(part),
            };
            counts.push(spikes.len());
            if from == me {
                continue;
            }
            gathered += spikes.len() as u64;
            for msg in spikes {
                if let Some(sink) = env.registry.sink_by_gid(msg.gid) {
                    env.send_sink(sink, msg.time, thread0);
                    received += 1;
                }
            }
        }
        *self.t_exchange.lock() = thread0.t();

        let most = counts.iter().copied().max().unwrap_or(0);
        let mut stats = self.stats.lock();
        stats.exchanges += 1;
        stats.spikes_sent += sent as u64;
        stats.spikes_received += gathered;
        stats.spikes_useful += received as u64;
        stats.max_sent = stats.max_sent.max(sent as u64);
        stats.retry_histogram[0] += 1;
        stats.record_max(most);
        if self.packing.as_ref().map_or(false, |p| sent > p.nspike) {
            stats.overflows += 1;
        }
        stats.max_buffer = stats.max_buffer.max(counts.iter().sum());
        Ok(ExchangeReport { received, retries: 0 })
    }
}

impl SpikeOutput for AllgatherExchange {
    fn output_spike(&self, source: &Source, t: SimTime) {
        self.outgoing.lock().push(SpikeMessage::new(source.gid, t));
    }
}

impl std::fmt::Debug for AllgatherExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllgatherExchange")
            .field("rank", &self.comm.rank())
            .field("compressed", &self.is_compressed())
            .field("local_gids", &self.uses_local_gids())
            .field("pending", &self.outgoing.lock().len())
            .finish()
    }
}
