//! Source and sink registry.
//!
//! The [`SourceRegistry`] maps gids to local event endpoints:
//!
//! - a [`Source`] is a spike generator owned by this rank;
//! - a [`Sink`] stands in for a source that lives on another rank and is
//!   created on demand when an edge names a gid with no local source.
//!
//! Edges are kept in one arena. [`SourceRegistry::finalize`] lays them out
//! contiguously per presynaptic object in insertion order, after which the
//! registry is read-only for the rest of the run (apart from exchange
//! indices assigned while building target lists).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};
use crate::types::{EdgeId, Gid, Presyn, Rank, SimTime, SinkId, SourceId, TargetRef, ThreadIndex};

/// Spike threshold on one variable of the owning thread's state vector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub var_index: usize,
    pub value: f64,
}

impl Threshold {
    /// Fires when state variable `var_index` crosses `value` upward.
    pub fn new(var_index: usize, value: f64) -> Self {
        Self { var_index, value }
    }
}

/// A contiguous range of the registry's edge order array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EdgeSlice {
    pub index: usize,
    pub count: usize,
}

/// A spike generator owned by this rank.
#[derive(Clone, Debug)]
pub struct Source {
    pub gid: Gid,
    pub thread: ThreadIndex,
    pub threshold: Option<Threshold>,
    /// Whether spikes of this source are sent to other ranks.
    pub output: bool,
    /// Artificial cell whose `net_event` fires this source.
    pub target: Option<TargetRef>,
    pub(crate) edges: EdgeSlice,
    pub(crate) multisend_index: Option<usize>,
}

impl Source {
    pub fn edges(&self) -> EdgeSlice {
        self.edges
    }

    /// Index into the phase-1 rank table, once target lists are built.
    pub fn multisend_index(&self) -> Option<usize> {
        self.multisend_index
    }

    /// True if spikes are handed to the exchange.
    pub fn is_exchanged(&self) -> bool {
        self.output && self.gid >= 0
    }
}

/// Local receiving endpoint for a gid owned by another rank.
#[derive(Clone, Debug)]
pub struct Sink {
    pub gid: Gid,
    pub(crate) edges: EdgeSlice,
    pub(crate) phase2_index: Option<usize>,
}

impl Sink {
    pub fn edges(&self) -> EdgeSlice {
        self.edges
    }

    /// Index into the phase-2 relay table, if this rank relays the gid.
    pub fn phase2_index(&self) -> Option<usize> {
        self.phase2_index
    }
}

/// A directed connection from a presynaptic object to a target.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub presyn: Presyn,
    pub target: TargetRef,
    pub delay: SimTime,
    /// First weight slot in the target thread's weight vector.
    pub weight_index: usize,
    pub weight_count: usize,
    pub active: bool,
}

/// Description of a source to register.
#[derive(Clone, Debug)]
pub struct SourceSpec {
    pub thread: ThreadIndex,
    pub gid: Gid,
    pub threshold: Option<Threshold>,
    pub output: bool,
    pub target: Option<TargetRef>,
}

impl SourceSpec {
    /// A cell whose spikes are detected by a threshold crossing.
    pub fn cell(thread: ThreadIndex, gid: Gid, threshold: Threshold) -> Self {
        Self { thread, gid, threshold: Some(threshold), output: gid >= 0, target: None }
    }

    /// An artificial cell that fires through `net_event`.
    pub fn artificial(gid: Gid, target: TargetRef) -> Self {
        Self { thread: target.thread, gid, threshold: None, output: gid >= 0, target: Some(target) }
    }

    /// Keeps spikes on this rank.
    pub fn passive(mut self) -> Self {
        self.output = false;
        self
    }
}

/// Description of an edge to connect.
#[derive(Clone, Copy, Debug)]
pub struct EdgeSpec {
    pub target: TargetRef,
    pub delay: SimTime,
    pub weight_index: usize,
    pub weight_count: usize,
    pub active: bool,
}

impl EdgeSpec {
    pub fn new(target: TargetRef, delay: SimTime, weight_index: usize, weight_count: usize) -> Self {
        Self { target, delay, weight_index, weight_count, active: true }
    }

    /// An edge that is kept but skipped at delivery.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// How a rank holds a gid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GidStatus {
    /// No local source has the gid.
    Absent,
    /// A local source whose spikes stay on this rank.
    Local,
    /// A local source whose spikes are exchanged.
    Output,
}

/// Gid to endpoint maps plus the source, sink and edge arenas.
pub struct SourceRegistry {
    rank: Rank,
    nthreads: usize,
    sources: Vec<Source>,
    sinks: Vec<Sink>,
    edges: Vec<Edge>,
    edge_order: Vec<EdgeId>,
    gid2out: BTreeMap<Gid, SourceId>,
    gid2in: BTreeMap<Gid, SinkId>,
    local_gids: Vec<HashMap<Gid, SourceId>>,
    target_sources: HashMap<TargetRef, SourceId>,
    thread_sources: Vec<Vec<SourceId>>,
    frozen: bool,
}

impl SourceRegistry {
    /// An open registry for `rank`; sources and sinks may be added until
    /// [`finalize`](Self::finalize).
    pub fn new(rank: Rank, nthreads: usize) -> Self {
        Self {
            rank,
            nthreads,
            sources: Vec::new(),
            sinks: Vec::new(),
            edges: Vec::new(),
            edge_order: Vec::new(),
            gid2out: BTreeMap::new(),
            gid2in: BTreeMap::new(),
            local_gids: vec![HashMap::new(); nthreads],
            target_sources: HashMap::new(),
            thread_sources: vec![Vec::new(); nthreads],
            frozen: false,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_thread(&self, thread: ThreadIndex) -> NetResult<()> {
        if thread >= self.nthreads {
            return Err(NetError::NoSuchThread { thread, nthreads: self.nthreads });
        }
        Ok(())
    }

    /// Registers a spike source.
    ///
    /// A non-negative gid must be unique on this rank and must not already
    /// have an input sink. A negative gid must be unique on its thread.
    pub fn register_source(&mut self, spec: SourceSpec) -> NetResult<SourceId> {
        if self.frozen {
            return Err(NetError::RegistryFrozen("source registration"));
        }
        self.check_thread(spec.thread)?;
        if let Some(target) = spec.target {
            if let Some(&existing) = self.target_sources.get(&target) {
                return Err(NetError::TargetHasSource {
                    thread: target.thread,
                    index: target.index,
                    gid: self.sources[existing.index()].gid,
                });
            }
        }
        let id = SourceId(self.sources.len() as u32);
        if spec.gid >= 0 {
            if self.gid2out.contains_key(&spec.gid) {
                return Err(NetError::DuplicateSource { gid: spec.gid, rank: self.rank });
            }
            if self.gid2in.contains_key(&spec.gid) {
                return Err(NetError::DualRegistration { gid: spec.gid, rank: self.rank });
            }
            self.gid2out.insert(spec.gid, id);
        } else {
            let local = &mut self.local_gids[spec.thread];
            if local.contains_key(&spec.gid) {
                return Err(NetError::DuplicateSource { gid: spec.gid, rank: self.rank });
            }
            local.insert(spec.gid, id);
        }
        if let Some(target) = spec.target {
            self.target_sources.insert(target, id);
        }
        self.sources.push(Source {
            gid: spec.gid,
            thread: spec.thread,
            threshold: spec.threshold,
            output: spec.output && spec.gid >= 0,
            target: spec.target,
            edges: EdgeSlice::default(),
            multisend_index: None,
        });
        Ok(id)
    }

    /// Connects the presynaptic object named by `gid` to a target.
    ///
    /// A negative gid is resolved on `from_thread`. A non-negative gid with no
    /// local source gets an input sink, created on first use.
    pub fn connect(&mut self, gid: Gid, from_thread: ThreadIndex, spec: EdgeSpec) -> NetResult<EdgeId> {
        if self.frozen {
            return Err(NetError::RegistryFrozen("connect"));
        }
        if spec.delay < 0.0 || spec.delay.is_nan() {
            return Err(NetError::NegativeDelay { gid, delay: spec.delay });
        }
        self.check_thread(spec.target.thread)?;
        let presyn = if gid >= 0 {
            match self.gid2out.get(&gid) {
                Some(&source) => Presyn::Source(source),
                None => Presyn::Sink(self.sink_for(gid)),
            }
        } else {
            self.check_thread(from_thread)?;
            Presyn::Source(self.local_source(from_thread, gid)?)
        };
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            presyn,
            target: spec.target,
            delay: spec.delay,
            weight_index: spec.weight_index,
            weight_count: spec.weight_count,
            active: spec.active,
        });
        Ok(id)
    }

    fn sink_for(&mut self, gid: Gid) -> SinkId {
        let sinks = &mut self.sinks;
        *self.gid2in.entry(gid).or_insert_with(|| {
            sinks.push(Sink { gid, edges: EdgeSlice::default(), phase2_index: None });
            SinkId((sinks.len() - 1) as u32)
        })
    }

    /// Lays out edges contiguously per presynaptic object and freezes the
    /// gid maps. Calling it again is a no-op.
    pub fn finalize(&mut self) {
        if self.frozen {
            return;
        }
        let mut by_source: Vec<Vec<EdgeId>> = vec![Vec::new(); self.sources.len()];
        let mut by_sink: Vec<Vec<EdgeId>> = vec![Vec::new(); self.sinks.len()];
        for (i, edge) in self.edges.iter().enumerate() {
            match edge.presyn {
                Presyn::Source(s) => by_source[s.index()].push(EdgeId(i as u32)),
                Presyn::Sink(s) => by_sink[s.index()].push(EdgeId(i as u32)),
            }
        }

        self.edge_order.clear();
        for (source, list) in self.sources.iter_mut().zip(by_source) {
            source.edges = EdgeSlice { index: self.edge_order.len(), count: list.len() };
            self.edge_order.extend(list);
        }
        for (sink, list) in self.sinks.iter_mut().zip(by_sink) {
            sink.edges = EdgeSlice { index: self.edge_order.len(), count: list.len() };
            self.edge_order.extend(list);
        }

        for (i, source) in self.sources.iter().enumerate() {
            if source.threshold.is_some() {
                self.thread_sources[source.thread].push(SourceId(i as u32));
            }
        }
        self.frozen = true;

        tracing::debug!(
            rank = self.rank,
            sources = self.sources.len(),
            sinks = self.sinks.len(),
            edges = self.edges.len(),
            "source registry finalized"
        );
    }

    /// # Panics
    ///
    /// Panics if `id` was not issued by this registry. The same holds for
    /// [`sink`](Self::sink) and [`edge`](Self::edge).
    pub fn source(&self, id: SourceId) -> &Source {
        &self.sources[id.index()]
    }

    pub fn sink(&self, id: SinkId) -> &Sink {
        &self.sinks[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.index()]
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn sinks(&self) -> &[Sink] {
        &self.sinks
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Local source for a non-negative gid.
    pub fn source_by_gid(&self, gid: Gid) -> Option<SourceId> {
        self.gid2out.get(&gid).copied()
    }

    /// Whether a local source owns the non-negative `gid`.
    pub fn gid_status(&self, gid: Gid) -> GidStatus {
        match self.gid2out.get(&gid) {
            Some(id) if self.sources[id.index()].output => GidStatus::Output,
            Some(_) => GidStatus::Local,
            None => GidStatus::Absent,
        }
    }

    /// True if a local source owns `gid`. Sinks do not count.
    pub fn gid_exists(&self, gid: Gid) -> bool {
        self.gid_status(gid) != GidStatus::Absent
    }

    /// Forgets every source, sink and edge and reopens the registry for
    /// setup.
    pub fn clear(&mut self) {
        tracing::debug!(
            rank = self.rank,
            sources = self.sources.len(),
            sinks = self.sinks.len(),
            edges = self.edges.len(),
            "source registry cleared"
        );
        *self = Self::new(self.rank, self.nthreads);
    }

    /// Input sink for a gid owned elsewhere.
    pub fn sink_by_gid(&self, gid: Gid) -> Option<SinkId> {
        self.gid2in.get(&gid).copied()
    }

    /// Resolves a thread-local (negative) gid.
    pub fn local_source(&self, thread: ThreadIndex, gid: Gid) -> NetResult<SourceId> {
        self.local_gids
            .get(thread)
            .and_then(|map| map.get(&gid))
            .copied()
            .ok_or(NetError::UnknownLocalGid { gid, thread })
    }

    /// Source fired by the given artificial cell's `net_event`.
    pub fn source_for_target(&self, target: TargetRef) -> Option<SourceId> {
        self.target_sources.get(&target).copied()
    }

    /// Threshold-detected sources owned by `thread`.
    pub fn threshold_sources(&self, thread: ThreadIndex) -> &[SourceId] {
        self.thread_sources.get(thread).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Edges of a presynaptic object, in insertion order.
    pub fn edges_of(&self, presyn: Presyn) -> &[EdgeId] {
        let slice = match presyn {
            Presyn::Source(s) => self.sources[s.index()].edges,
            Presyn::Sink(s) => self.sinks[s.index()].edges,
        };
        &self.edge_order[slice.index..slice.index + slice.count]
    }

    /// Gids of sources whose spikes leave this rank, ascending.
    pub fn output_gids(&self) -> impl Iterator<Item = (Gid, SourceId)> + '_ {
        self.gid2out
            .iter()
            .filter(|(_, id)| self.sources[id.index()].output)
            .map(|(&gid, &id)| (gid, id))
    }

    /// Gids this rank wants to receive, ascending.
    pub fn input_gids(&self) -> impl Iterator<Item = (Gid, SinkId)> + '_ {
        self.gid2in.iter().map(|(&gid, &id)| (gid, id))
    }

    /// Forgets every exchange index so target lists can be rebuilt.
    pub fn clear_exchange_indices(&mut self) {
        for source in &mut self.sources {
            source.multisend_index = None;
        }
        for sink in &mut self.sinks {
            sink.phase2_index = None;
        }
    }

    /// Points an output source at its phase-1 rank table entry.
    pub fn set_multisend_index(&mut self, id: SourceId, index: usize) {
        self.sources[id.index()].multisend_index = Some(index);
    }

    /// Marks a sink as relayed through phase-2 table entry `index`.
    pub fn set_phase2_index(&mut self, id: SinkId, index: usize) {
        self.sinks[id.index()].phase2_index = Some(index);
    }

    /// Smallest delay over edges that cross a thread or rank boundary.
    ///
    /// Returns `None` when no such edge exists.
    pub fn min_exchange_delay(&self) -> Option<SimTime> {
        self.edges
            .iter()
            .filter(|edge| match edge.presyn {
                Presyn::Sink(_) => true,
                Presyn::Source(s) => {
                    self.nthreads > 1 && self.sources[s.index()].thread != edge.target.thread
                }
            })
            .map(|edge| edge.delay)
            .min_by(|a, b| a.total_cmp(b))
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("rank", &self.rank)
            .field("nthreads", &self.nthreads)
            .field("sources", &self.sources.len())
            .field("sinks", &self.sinks.len())
            .field("edges", &self.edges.len())
            .field("frozen", &self.frozen)
            .finish()
    }
}
