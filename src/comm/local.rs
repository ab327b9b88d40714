//! In-process communicator: every rank is an OS thread.
//!
//! Point-to-point spikes travel in their wire encoding over one unbounded
//! channel per receiving rank. Collectives use a dedicated FIFO channel for every ordered rank
//! pair, so consecutive collectives can never overtake each other.
//!
//! A cluster may be built with a delivery lag: each arrived spike stays
//! invisible for that many polls of [`Communicator::try_recv_spike`]. That
//! mimics messages still in flight when the exchange starts counting.

use std::collections::VecDeque;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::comm::{Communicator, SpikeMessage, SPIKE_MESSAGE_BYTES};
use crate::error::{NetError, NetResult};
use crate::types::Rank;

enum Collective {
    Ints(Vec<i32>),
    Sum(i64),
    Min(f64),
    Bytes(Vec<u8>),
}

impl Collective {
    fn name(&self) -> &'static str {
        match self {
            Collective::Ints(_) => "alltoallv",
            Collective::Sum(_) => "allreduce_sum",
            Collective::Min(_) => "allreduce_min",
            Collective::Bytes(_) => "allgather_bytes",
        }
    }
}

/// One rank's endpoint of a [`LocalCluster`].
pub struct LocalComm {
    rank: Rank,
    size: usize,
    spike_tx: Vec<Sender<[u8; SPIKE_MESSAGE_BYTES]>>,
    spike_rx: Receiver<[u8; SPIKE_MESSAGE_BYTES]>,
    coll_tx: Vec<Sender<Collective>>,
    coll_rx: Vec<Receiver<Collective>>,
    lag: u32,
    inflight: Mutex<VecDeque<(u32, SpikeMessage)>>,
}

impl LocalComm {
    fn comm_error(&self, reason: impl Into<String>) -> NetError {
        NetError::Comm { rank: self.rank, reason: reason.into() }
    }

    fn exchange(&self, payloads: Vec<Collective>) -> NetResult<Vec<Collective>> {
        for (dest, payload) in payloads.into_iter().enumerate() {
            let name = payload.name();
            self.coll_tx[dest]
                .send(payload)
                .map_err(|_| self.comm_error(format!("{name}: rank {dest} hung up")))?;
        }
        self.coll_rx
            .iter()
            .enumerate()
            .map(|(src, rx)| {
                rx.recv()
                    .map_err(|_| self.comm_error(format!("collective: rank {src} hung up")))
            })
            .collect()
    }

    fn broadcast(&self, make: impl Fn() -> Collective) -> NetResult<Vec<Collective>> {
        self.exchange((0..self.size).map(|_| make()).collect())
    }

    fn mismatch(&self, expected: &str, got: &Collective) -> NetError {
        self.comm_error(format!("collective mismatch: expected {expected}, got {}", got.name()))
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_spike(&self, dest: Rank, msg: SpikeMessage) -> NetResult<()> {
        let tx = self
            .spike_tx
            .get(dest)
            .ok_or_else(|| self.comm_error(format!("no rank {dest}")))?;
        tx.send(msg.to_bytes())
            .map_err(|_| self.comm_error(format!("rank {dest} hung up")))
    }

    fn try_recv_spike(&self) -> NetResult<Option<SpikeMessage>> {
        let mut inflight = self.inflight.lock();
        inflight.extend(self.spike_rx.try_iter().map(|buf| (self.lag, SpikeMessage::from_bytes(&buf))));
        match inflight.front() {
            Some((0, _)) => Ok(inflight.pop_front().map(|(_, msg)| msg)),
            Some(_) => {
                for (remaining, _) in inflight.iter_mut() {
                    *remaining = remaining.saturating_sub(1);
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn alltoallv(&self, send: Vec<Vec<i32>>) -> NetResult<Vec<Vec<i32>>> {
        if send.len() != self.size {
            return Err(self.comm_error(format!(
                "alltoallv expects {} send buffers, got {}",
                self.size,
                send.len()
            )));
        }
        self.exchange(send.into_iter().map(Collective::Ints).collect())?
            .into_iter()
            .map(|c| match c {
                Collective::Ints(v) => Ok(v),
                other => Err(self.mismatch("alltoallv", &other)),
            })
            .collect()
    }

    fn allreduce_sum(&self, value: i64) -> NetResult<i64> {
        self.broadcast(|| Collective::Sum(value))?
            .into_iter()
            .try_fold(0i64, |acc, c| match c {
                Collective::Sum(v) => Ok(acc + v),
                other => Err(self.mismatch("allreduce_sum", &other)),
            })
    }

    fn allreduce_min(&self, value: f64) -> NetResult<f64> {
        self.broadcast(|| Collective::Min(value))?
            .into_iter()
            .try_fold(f64::INFINITY, |acc, c| match c {
                Collective::Min(v) => Ok(acc.min(v)),
                other => Err(self.mismatch("allreduce_min", &other)),
            })
    }

    fn allgather_bytes(&self, bytes: Vec<u8>) -> NetResult<Vec<Vec<u8>>> {
        self.broadcast(|| Collective::Bytes(bytes.clone()))?
            .into_iter()
            .map(|c| match c {
                Collective::Bytes(v) => Ok(v),
                other => Err(self.mismatch("allgather_bytes", &other)),
            })
            .collect()
    }
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("lag", &self.lag)
            .finish()
    }
}

/// Factory for the endpoints of an in-process cluster.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates `size` connected endpoints, indexed by rank.
    pub fn new(size: usize) -> Vec<LocalComm> {
        Self::with_lag(size, 0)
    }

    /// Like [`new`](Self::new), with spikes held back for `lag` polls.
    pub fn with_lag(size: usize, lag: u32) -> Vec<LocalComm> {
        let mut spike_tx = Vec::with_capacity(size);
        let mut spike_rx = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = unbounded();
            spike_tx.push(tx);
            spike_rx.push(rx);
        }

        // coll_tx[src][dst] pairs with coll_rx[dst][src]
        let mut coll_tx: Vec<Vec<Sender<Collective>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut coll_rx: Vec<Vec<Receiver<Collective>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = unbounded();
                coll_tx[src].push(tx);
                coll_rx[dst].push(rx);
            }
        }

        spike_rx
            .into_iter()
            .zip(coll_tx)
            .zip(coll_rx)
            .enumerate()
            .map(|(rank, ((spike_rx, coll_tx), coll_rx))| LocalComm {
                rank,
                size,
                spike_tx: spike_tx.clone(),
                spike_rx,
                coll_tx,
                coll_rx,
                lag,
                inflight: Mutex::new(VecDeque::new()),
            })
            .collect()
    }

    /// Runs `f` once per rank on its own thread and collects the results in
    /// rank order. A panic on any rank is propagated.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(LocalComm) -> R + Sync,
    {
        Self::run_with_lag(size, 0, f)
    }

    /// Like [`run`](Self::run), over a cluster built with [`with_lag`](Self::with_lag).
    pub fn run_with_lag<R, F>(size: usize, lag: u32, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(LocalComm) -> R + Sync,
    {
        let comms = Self::with_lag(size, lag);
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}
