//! One-time construction of per-gid destination rank lists.
//!
//! No rank knows up front which other ranks want its spikes. The lists are
//! built with the help of an intermediate rank, `gid mod nranks`:
//!
//! 1. every rank tells the intermediate which gids it has sinks for;
//! 2. every rank tells the intermediate which gids it owns;
//! 3. the intermediate replies to the owner with the list of wanting ranks.
//!
//! With two-phase delivery enabled, long lists are split into
//! `floor(sqrt(n))` groups. The owner only sends to one randomly chosen
//! relay per group, and the relay forwards to the rest of its group.

use std::collections::BTreeMap;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::comm::Communicator;
use crate::error::{NetError, NetResult};
use crate::registry::SourceRegistry;
use crate::types::{Gid, Rank};

/// Default list length from which two-phase relays are used.
pub const DEFAULT_PHASE2_MIN_TARGETS: usize = 4;

/// Destination tables produced by [`TargetListBuilder`].
///
/// Phase-1 entries belong to local sources and hold the total number of
/// receiving ranks plus the ranks this rank sends to directly. Phase-2
/// entries belong to local sinks this rank relays for.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RankLists {
    phase1: Vec<i32>,
    phase1_offsets: Vec<usize>,
    phase2: Vec<i32>,
    phase2_offsets: Vec<usize>,
}

impl RankLists {
    /// Empty tables; every source sends nowhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a phase-1 entry and returns its index.
    pub fn push_phase1(&mut self, total: usize, ranks: &[i32]) -> usize {
        self.phase1_offsets.push(self.phase1.len());
        self.phase1.push(total as i32);
        self.phase1.push(ranks.len() as i32);
        self.phase1.extend_from_slice(ranks);
        self.phase1_offsets.len() - 1
    }

    /// Adds a phase-2 entry and returns its index.
    pub fn push_phase2(&mut self, ranks: &[i32]) -> usize {
        self.phase2_offsets.push(self.phase2.len());
        self.phase2.push(ranks.len() as i32);
        self.phase2.extend_from_slice(ranks);
        self.phase2_offsets.len() - 1
    }

    /// `(total receivers, direct ranks)` of a phase-1 entry.
    pub fn phase1(&self, index: usize) -> (usize, &[i32]) {
        let o = self.phase1_offsets[index];
        let total = self.phase1[o] as usize;
        let count = self.phase1[o + 1] as usize;
        (total, &self.phase1[o + 2..o + 2 + count])
    }

    /// Ranks a phase-2 entry forwards to.
    pub fn phase2(&self, index: usize) -> &[i32] {
        let o = self.phase2_offsets[index];
        let count = self.phase2[o] as usize;
        &self.phase2[o + 1..o + 1 + count]
    }

    /// Phase-1 entry for an optional index; a missing index means no receivers.
    pub fn targets(&self, index: Option<usize>) -> (usize, &[i32]) {
        index.map_or((0, &[]), |i| self.phase1(i))
    }

    /// Number of phase-1 entries, one per output source with receivers.
    pub fn phase1_len(&self) -> usize {
        self.phase1_offsets.len()
    }

    /// Number of phase-2 entries, one per gid this rank relays.
    pub fn phase2_len(&self) -> usize {
        self.phase2_offsets.len()
    }

    /// Largest number of ranks any local source sends to directly.
    pub fn max_direct_targets(&self) -> usize {
        (0..self.phase1_len()).map(|i| self.phase1(i).1.len()).max().unwrap_or(0)
    }
}

/// Wanting ranks for one gid, as seen by its intermediate rank.
#[derive(Debug, Default)]
struct TarList {
    ranks: Vec<i32>,
    owner: Option<Rank>,
    /// Group bounds into `ranks` when split for two-phase delivery.
    groups: Option<Vec<usize>>,
}

impl TarList {
    /// Splits the list into `floor(sqrt(len))` groups and swaps a random
    /// member to the head of each group. The head becomes the relay.
    fn organize(&mut self, rng: &mut ChaCha8Rng, min_targets: usize) {
        let nt = self.ranks.len();
        let n = (nt as f64).sqrt() as usize;
        if nt < min_targets || n <= 1 {
            return;
        }
        let bounds: Vec<usize> = (0..=n).map(|i| if i == n { nt } else { i * nt / n }).collect();
        for i in 0..n {
            let (first, last) = (bounds[i], bounds[i + 1] - 1);
            let pick = rng.gen_range(first..=last);
            self.ranks.swap(first, pick);
        }
        self.groups = Some(bounds);
    }

    fn direct_ranks(&self) -> Vec<i32> {
        match &self.groups {
            Some(bounds) => bounds[..bounds.len() - 1].iter().map(|&b| self.ranks[b]).collect(),
            None => self.ranks.clone(),
        }
    }
}

/// Builds [`RankLists`] collectively; every rank must call [`build`](Self::build).
pub struct TargetListBuilder<'a> {
    comm: &'a dyn Communicator,
    two_phase: bool,
    phase2_min_targets: usize,
    rng: ChaCha8Rng,
}

impl<'a> TargetListBuilder<'a> {
    /// One-phase lists with the default relay threshold and seed 0.
    pub fn new(comm: &'a dyn Communicator) -> Self {
        Self {
            comm,
            two_phase: false,
            phase2_min_targets: DEFAULT_PHASE2_MIN_TARGETS,
            rng: ChaCha8Rng::seed_from_u64(comm.rank() as u64 + 1),
        }
    }

    /// Splits long target lists into relay groups.
    pub fn with_two_phase(mut self, enabled: bool) -> Self {
        self.two_phase = enabled;
        self
    }

    /// Shortest target list that is split when two-phase is enabled.
    pub fn with_phase2_min_targets(mut self, min: usize) -> Self {
        self.phase2_min_targets = min;
        self
    }

    /// Seeds relay selection. Each rank derives its own stream from `seed`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(self.comm.rank() as u64 + 1));
        self
    }

    fn protocol_error(&self, reason: String) -> NetError {
        NetError::Comm { rank: self.comm.rank(), reason }
    }

    /// Runs the three all-to-all rounds and assigns exchange indices to the
    /// registry's sources and sinks.
    pub fn build(mut self, registry: &mut SourceRegistry) -> NetResult<RankLists> {
        let nranks = self.comm.size();
        let me = self.comm.rank();
        let home = |gid: Gid| gid as usize % nranks;

        // Round 1: who wants which gid
        let mut send = vec![Vec::new(); nranks];
        for (gid, _) in registry.input_gids() {
            send[home(gid)].push(gid);
        }
        let mut lists: BTreeMap<Gid, TarList> = BTreeMap::new();
        for (src, gids) in self.comm.alltoallv(send)?.into_iter().enumerate() {
            for gid in gids {
                lists.entry(gid).or_default().ranks.push(src as i32);
            }
        }

        // Round 2: who owns which gid
        let mut send = vec![Vec::new(); nranks];
        for (gid, _) in registry.output_gids() {
            send[home(gid)].push(gid);
        }
        for (src, gids) in self.comm.alltoallv(send)?.into_iter().enumerate() {
            for gid in gids {
                if let Some(list) = lists.get_mut(&gid) {
                    list.owner = Some(src);
                }
            }
        }

        if self.two_phase {
            for list in lists.values_mut().filter(|l| l.owner.is_some()) {
                list.organize(&mut self.rng, self.phase2_min_targets);
            }
        }

        // Round 3: lists back to owners, groups to relays
        let mut send = vec![Vec::new(); nranks];
        let mut dangling = 0usize;
        for (&gid, list) in &lists {
            let Some(owner) = list.owner else {
                dangling += 1;
                continue;
            };
            let direct = list.direct_ranks();
            let buf = &mut send[owner];
            buf.push(gid);
            buf.push(direct.len() as i32);
            if self.two_phase {
                buf.push(list.ranks.len() as i32);
            }
            buf.extend_from_slice(&direct);

            if let Some(bounds) = &list.groups {
                for window in bounds.windows(2) {
                    let (head, end) = (window[0], window[1]);
                    let rest = &list.ranks[head + 1..end];
                    let buf = &mut send[list.ranks[head] as usize];
                    buf.push(gid);
                    buf.push(rest.len() as i32);
                    buf.extend_from_slice(rest);
                }
            }
        }
        if dangling > 0 {
            tracing::debug!(rank = me, dangling, "gids wanted but owned by no rank");
        }
        let recv = self.comm.alltoallv(send)?;

        registry.clear_exchange_indices();
        let mut tables = RankLists::new();
        for (src, buf) in recv.iter().enumerate() {
            let mut i = 0;
            while i < buf.len() {
                let malformed = || self.protocol_error(format!("truncated target list from rank {src}"));
                let gid = buf[i];
                let count = *buf.get(i + 1).ok_or_else(malformed)? as usize;
                i += 2;
                let relay_sink = if self.two_phase { registry.sink_by_gid(gid) } else { None };
                if let Some(sink) = relay_sink {
                    let ranks = buf.get(i..i + count).ok_or_else(malformed)?;
                    i += count;
                    debug_assert!(!ranks.contains(&(me as i32)));
                    let index = tables.push_phase2(ranks);
                    registry.set_phase2_index(sink, index);
                } else {
                    let total = if self.two_phase {
                        let total = *buf.get(i).ok_or_else(malformed)? as usize;
                        i += 1;
                        total
                    } else {
                        count
                    };
                    let ranks = buf.get(i..i + count).ok_or_else(malformed)?;
                    i += count;
                    debug_assert!(!ranks.contains(&(me as i32)));
                    let source = registry
                        .source_by_gid(gid)
                        .ok_or(NetError::UnknownGid { gid, rank: me, time: 0.0 })?;
                    let index = tables.push_phase1(total, ranks);
                    registry.set_multisend_index(source, index);
                }
            }
        }

        tracing::debug!(
            rank = me,
            phase1 = tables.phase1_len(),
            phase2 = tables.phase2_len(),
            max_direct = tables.max_direct_targets(),
            "target lists built"
        );
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_lists_layout() {
        let mut t = RankLists::new();
        let a = t.push_phase1(5, &[1, 3]);
        let b = t.push_phase1(1, &[2]);
        let c = t.push_phase2(&[4, 6, 7]);
        assert_eq!(t.phase1(a), (5, &[1, 3][..]));
        assert_eq!(t.phase1(b), (1, &[2][..]));
        assert_eq!(t.phase2(c), &[4, 6, 7]);
        assert_eq!(t.targets(None), (0, &[][..]));
        assert_eq!(t.max_direct_targets(), 2);
    }

    #[test]
    fn test_organize_groups_cover_list() {
        let mut list = TarList { ranks: (1..=10).collect(), owner: Some(0), groups: None };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        list.organize(&mut rng, DEFAULT_PHASE2_MIN_TARGETS);

        // floor(sqrt(10)) = 3 groups with bounds i*10/3
        assert_eq!(list.groups, Some(vec![0, 3, 6, 10]));
        let mut sorted = list.ranks.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=10).collect::<Vec<_>>());
        for (g, window) in [(0usize, 1..=3), (3, 4..=6), (6, 7..=10)] {
            assert!(window.contains(&list.ranks[g]));
        }
        assert_eq!(list.direct_ranks().len(), 3);
    }

    #[test]
    fn test_short_lists_stay_single_phase() {
        let mut list = TarList { ranks: vec![1, 2, 3], owner: Some(0), groups: None };
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        list.organize(&mut rng, DEFAULT_PHASE2_MIN_TARGETS);
        assert!(list.groups.is_none());
        assert_eq!(list.direct_ranks(), vec![1, 2, 3]);
    }
}
