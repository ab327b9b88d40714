//! Targeted spike exchange with a conservation check.
//!
//! An output source sends each spike straight to the ranks listed in its
//! phase-1 entry. Two receive buffers alternate between exchange intervals,
//! so a spike sent during interval `k` is only required to have arrived at
//! the end of interval `k + 1`. That leaves a full interval for the message
//! to travel while cells keep integrating. The buffer a spike belongs to
//! travels with it: the gid is complemented for buffer 1.
//!
//! At each exchange the ranks agree, through a global sum, that every spike
//! counted as sent for the current buffer has been counted as received.
//! Only then is the buffer handed to the local sinks and swapped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::comm::{Communicator, SpikeMessage};
use crate::error::{NetError, NetResult, OrFatal};
use crate::exchange::{ExchangeReport, ExchangeStats, RETRY_HISTOGRAM_BINS};
use crate::registry::Source;
use crate::scheduler::{DeliveryEnv, SpikeOutput};
use crate::target_list::RankLists;
use crate::thread::ThreadState;
use crate::types::{Gid, SimTime};

/// Warn about a stuck conservation loop every this many retries.
const RETRY_WARN_INTERVAL: u32 = 1000;

#[derive(Debug, Default)]
struct ReceiveBuffer {
    spikes: Vec<(Gid, SimTime)>,
    nsend: i64,
    nsend_cell: i64,
    nrecv: i64,
    max_count: usize,
}

impl ReceiveBuffer {
    fn reset_counts(&mut self) -> i64 {
        let received = self.nrecv;
        self.nsend = 0;
        self.nsend_cell = 0;
        self.nrecv = 0;
        received
    }
}

/// Multisend exchange state for one rank.
pub struct Multisend {
    comm: Arc<dyn Communicator>,
    tables: RankLists,
    buffers: [Mutex<ReceiveBuffer>; 2],
    current: AtomicUsize,
    next: AtomicUsize,
    intervals: usize,
    two_phase: bool,
    max_retries: Option<u32>,
    stats: Mutex<ExchangeStats>,
}

impl Multisend {
    /// `intervals` is 1 (single buffer) or 2 (even/odd buffers).
    pub fn new(
        comm: Arc<dyn Communicator>,
        tables: RankLists,
        intervals: usize,
        two_phase: bool,
        max_retries: Option<u32>,
    ) -> Self {
        let ms = Self {
            comm,
            tables,
            buffers: [Mutex::new(ReceiveBuffer::default()), Mutex::new(ReceiveBuffer::default())],
            current: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            intervals: intervals.clamp(1, 2),
            two_phase,
            max_retries,
            stats: Mutex::new(ExchangeStats::new("multisend")),
        };
        ms.reset();
        ms
    }

    /// Empties both buffers and restarts the even/odd cycle.
    pub fn reset(&self) {
        for buffer in &self.buffers {
            let mut b = buffer.lock();
            b.spikes.clear();
            b.reset_counts();
        }
        self.current.store(0, Ordering::Relaxed);
        self.next.store(if self.intervals == 2 { 1 } else { 0 }, Ordering::Relaxed);
    }

    /// Phase-1 and phase-2 rank tables this rank sends from.
    pub fn tables(&self) -> &RankLists {
        &self.tables
    }

    /// Exchange intervals per min delay, 1 or 2.
    pub fn intervals(&self) -> usize {
        self.intervals
    }

    /// Buffer whose spikes are checked and delivered at the next exchange.
    pub fn current_buffer(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Buffer newly sent spikes are counted against.
    pub fn next_buffer(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ExchangeStats {
        self.stats.lock().clone()
    }

    /// Polls arrived spikes into their buffers, then delivers whatever the
    /// current buffer holds. Returns the number of spikes polled.
    pub fn advance(&self, env: &DeliveryEnv<'_>, thread0: &mut ThreadState) -> NetResult<usize> {
        let mut polled = 0;
        while let Some(msg) = self.comm.try_recv_spike()? {
            let (parity, gid) = msg.buffer_and_gid();
            let mut buffer = self.buffers[parity].lock();
            buffer.spikes.push((gid, msg.time));
            buffer.nrecv += 1;
            buffer.max_count = buffer.max_count.max(buffer.spikes.len());
            polled += 1;
        }
        if polled > 0 {
            self.stats.lock().spikes_received += polled as u64;
        }
        self.enqueue(self.current_buffer(), env, thread0)?;
        Ok(polled)
    }

    /// Hands the spikes of buffer `parity` to their sinks and forwards the
    /// ones this rank relays.
    fn enqueue(&self, parity: usize, env: &DeliveryEnv<'_>, thread0: &mut ThreadState) -> NetResult<()> {
        let spikes = std::mem::take(&mut self.buffers[parity].lock().spikes);
        if spikes.is_empty() {
            return Ok(());
        }
        let mut relays = Vec::new();
        let useful = spikes.len() as u64;
        for (gid, t) in spikes {
            let sink = env.registry.sink_by_gid(gid).ok_or(NetError::UnknownGid {
                gid,
                rank: self.comm.rank(),
                time: t,
            })?;
            if self.two_phase {
                if let Some(index) = env.registry.sink(sink).phase2_index() {
                    relays.push((index, gid, t));
                }
            }
            env.send_sink(sink, t, thread0);
        }

        let mut relayed = 0u64;
        for (index, gid, t) in relays {
            let msg = SpikeMessage::for_buffer(gid, t, parity);
            for &rank in self.tables.phase2(index) {
                self.comm.send_spike(rank as usize, msg)?;
                relayed += 1;
            }
        }
        let mut stats = self.stats.lock();
        stats.spikes_useful += useful;
        stats.relayed += relayed;
        Ok(())
    }

    /// Completes one exchange interval.
    ///
    /// Drains, synchronizes, and retries until the global count of sent and
    /// received spikes for the current buffer agrees. Then delivers the
    /// buffer and, with two intervals, swaps buffers.
    pub fn exchange(&self, env: &DeliveryEnv<'_>, thread0: &mut ThreadState) -> NetResult<ExchangeReport> {
        self.advance(env, thread0)?;
        self.comm.barrier()?;
        self.advance(env, thread0)?;

        let current = self.current_buffer();
        let mut retries = 0u32;
        loop {
            let (nsend, nrecv) = {
                let b = self.buffers[current].lock();
                (b.nsend, b.nrecv)
            };
            let outstanding = self.comm.allreduce_sum(nsend - nrecv)?;
            if outstanding == 0 {
                break;
            }
            retries += 1;
            if let Some(max) = self.max_retries {
                if retries > max {
                    return Err(NetError::ConservationDiverged {
                        rank: self.comm.rank(),
                        retries: max,
                        outstanding,
                    });
                }
            }
            if retries % RETRY_WARN_INTERVAL == 0 {
                tracing::warn!(rank = self.comm.rank(), retries, outstanding, "spike conservation not reached");
            }
            self.advance(env, thread0)?;
        }

        self.enqueue(current, env, thread0)?;
        let (received, fired) = {
            let mut b = self.buffers[current].lock();
            let fired = b.nsend_cell;
            (b.reset_counts(), fired)
        };
        if self.intervals == 2 {
            let next = self.next_buffer();
            self.current.store(next, Ordering::Relaxed);
            self.next.store((next + 1) & 1, Ordering::Relaxed);
        }

        let mut stats = self.stats.lock();
        stats.exchanges += 1;
        stats.conservation_retries += retries as u64;
        stats.max_sent = stats.max_sent.max(fired as u64);
        stats.retry_histogram[(retries as usize).min(RETRY_HISTOGRAM_BINS - 1)] += 1;
        stats.max_buffer = stats
            .max_buffer
            .max(self.buffers.iter().map(|b| b.lock().max_count).max().unwrap_or(0));
        Ok(ExchangeReport { received, retries })
    }
}

impl SpikeOutput for Multisend {
    fn output_spike(&self, source: &Source, t: SimTime) {
        let (total, ranks) = self.tables.targets(source.multisend_index());
        if total == 0 {
            return;
        }
        let parity = self.next_buffer();
        {
            let mut buffer = self.buffers[parity].lock();
            buffer.nsend += total as i64;
            buffer.nsend_cell += 1;
        }
        let msg = SpikeMessage::for_buffer(source.gid, t, parity);
        for &rank in ranks {
            self.comm.send_spike(rank as usize, msg).or_fatal();
        }
        self.stats.lock().spikes_sent += ranks.len() as u64;
    }
}

impl std::fmt::Debug for Multisend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multisend")
            .field("rank", &self.comm.rank())
            .field("intervals", &self.intervals)
            .field("two_phase", &self.two_phase)
            .field("current", &self.current_buffer())
            .field("phase1_entries", &self.tables.phase1_len())
            .field("phase2_entries", &self.tables.phase2_len())
            .finish()
    }
}
