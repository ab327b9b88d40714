//! Integration tests for TargetListBuilder.
//!
//! These tests verify:
//! - Soundness against a known gid to rank adjacency, with and without relays
//! - The single-gid scenario with three wanting ranks
//! - Gids wanted but owned by nobody, and sources nobody wants
//! - Reproducible relay selection for a fixed seed

use std::collections::{BTreeMap, BTreeSet};

use netspike::comm::local::LocalCluster;
use netspike::comm::Communicator;
use netspike::registry::{EdgeSpec, SourceRegistry, SourceSpec, Threshold};
use netspike::target_list::TargetListBuilder;
use netspike::types::{Gid, TargetRef};

// ============================================================================
// Helpers
// ============================================================================

/// Lists one rank ended up with.
#[derive(Debug, Default)]
struct RankView {
    /// Owned gid to `(total, direct ranks)`
    owned: BTreeMap<Gid, (usize, Vec<i32>)>,
    /// Relayed gid to the ranks this rank forwards to
    relays: BTreeMap<Gid, Vec<i32>>,
}

fn owner_of(gid: Gid, nranks: usize) -> usize {
    (gid as usize * 3 + 1) % nranks
}

/// Deterministic adjacency: `rank` wants `gid` unless it owns it.
fn wants(rank: usize, gid: Gid, nranks: usize) -> bool {
    rank != owner_of(gid, nranks) && (gid as usize * 5 + rank * 11) % 3 != 0
}

fn registry_for(
    rank: usize,
    owned: impl IntoIterator<Item = Gid>,
    wanted: impl IntoIterator<Item = Gid>,
) -> SourceRegistry {
    let mut reg = SourceRegistry::new(rank, 1);
    for gid in owned {
        reg.register_source(SourceSpec::cell(0, gid, Threshold::new(0, 0.0))).unwrap();
    }
    for gid in wanted {
        reg.connect(gid, 0, EdgeSpec::new(TargetRef::new(0, 0), 1.0, 0, 1)).unwrap();
    }
    reg.finalize();
    reg
}

fn build_view(comm: &dyn Communicator, reg: &mut SourceRegistry, two_phase: bool, seed: u64) -> RankView {
    let tables = TargetListBuilder::new(comm)
        .with_two_phase(two_phase)
        .with_seed(seed)
        .build(reg)
        .unwrap();

    let mut view = RankView::default();
    for (gid, id) in reg.output_gids().collect::<Vec<_>>() {
        let (total, ranks) = tables.targets(reg.source(id).multisend_index());
        view.owned.insert(gid, (total, ranks.to_vec()));
    }
    for (gid, id) in reg.input_gids().collect::<Vec<_>>() {
        if let Some(index) = reg.sink(id).phase2_index() {
            view.relays.insert(gid, tables.phase2(index).to_vec());
        }
    }
    view
}

fn run_synthetic(nranks: usize, ngids: Gid, two_phase: bool, seed: u64) -> Vec<RankView> {
    LocalCluster::run(nranks, |comm| {
        let rank = comm.rank();
        let owned = (0..ngids).filter(|&g| owner_of(g, nranks) == rank);
        let wanted = (0..ngids).filter(|&g| wants(rank, g, nranks));
        let mut reg = registry_for(rank, owned, wanted);
        build_view(&comm, &mut reg, two_phase, seed)
    })
}

fn expected_receivers(gid: Gid, nranks: usize) -> BTreeSet<i32> {
    (0..nranks).filter(|&r| wants(r, gid, nranks)).map(|r| r as i32).collect()
}

// ============================================================================
// Soundness
// ============================================================================

#[test]
fn test_one_phase_lists_match_adjacency() {
    let (nranks, ngids) = (5, 40);
    let views = run_synthetic(nranks, ngids, false, 0);

    for gid in 0..ngids {
        let owner = owner_of(gid, nranks);
        let expected = expected_receivers(gid, nranks);
        let (total, ranks) = views[owner].owned.get(&gid).cloned().unwrap_or_default();
        let got: BTreeSet<i32> = ranks.iter().copied().collect();
        assert_eq!(got.len(), ranks.len(), "gid {gid}: duplicate ranks");
        assert_eq!(got, expected, "gid {gid}");
        assert_eq!(total, expected.len());
    }
    assert!(views.iter().all(|v| v.relays.is_empty()));
}

#[test]
fn test_two_phase_lists_cover_adjacency() {
    let (nranks, ngids) = (9, 30);
    let views = run_synthetic(nranks, ngids, true, 3);

    let mut split = 0;
    for gid in 0..ngids {
        let owner = owner_of(gid, nranks);
        let expected = expected_receivers(gid, nranks);
        let (total, direct) = views[owner].owned.get(&gid).cloned().unwrap_or_default();
        assert_eq!(total, expected.len(), "gid {gid}");

        let mut reached: Vec<i32> = direct.clone();
        for &relay in &direct {
            if let Some(group) = views[relay as usize].relays.get(&gid) {
                reached.extend_from_slice(group);
            }
        }
        let unique: BTreeSet<i32> = reached.iter().copied().collect();
        assert_eq!(unique.len(), reached.len(), "gid {gid}: rank reached twice");
        assert_eq!(unique, expected, "gid {gid}");

        if direct.len() < expected.len() {
            split += 1;
            let groups = (expected.len() as f64).sqrt() as usize;
            assert_eq!(direct.len(), groups, "gid {gid}");
        }
    }
    assert!(split > 0);
}

#[test]
fn test_relay_selection_is_reproducible() {
    let a = run_synthetic(9, 20, true, 11);
    let b = run_synthetic(9, 20, true, 11);
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.owned, y.owned);
        assert_eq!(x.relays, y.relays);
    }
}

// ============================================================================
// Concrete Cases
// ============================================================================

#[test]
fn test_gid_seven_wanted_by_three_ranks() {
    let views = LocalCluster::run(5, |comm| {
        let rank = comm.rank();
        let owned: Vec<Gid> = if rank == 0 { vec![7] } else { vec![] };
        let wanted: Vec<Gid> = if [1, 3, 4].contains(&rank) { vec![7] } else { vec![] };
        let mut reg = registry_for(rank, owned, wanted);
        build_view(&comm, &mut reg, false, 0)
    });

    let (total, ranks) = views[0].owned[&7].clone();
    let got: BTreeSet<i32> = ranks.into_iter().collect();
    assert_eq!(got, BTreeSet::from([1, 3, 4]));
    assert_eq!(total, 3);
    for view in &views[1..] {
        assert!(view.owned.is_empty());
    }
}

#[test]
fn test_unowned_and_unwanted_gids() {
    let views = LocalCluster::run(3, |comm| {
        let rank = comm.rank();
        // gid 4 is wanted by rank 1 but owned by nobody; gid 5 is owned by
        // rank 2 and wanted by nobody; gid 6 is owned but kept local
        let mut reg = SourceRegistry::new(rank, 1);
        match rank {
            1 => {
                reg.connect(4, 0, EdgeSpec::new(TargetRef::new(0, 0), 1.0, 0, 1)).unwrap();
                reg.connect(6, 0, EdgeSpec::new(TargetRef::new(0, 0), 1.0, 0, 1)).unwrap();
            }
            2 => {
                reg.register_source(SourceSpec::cell(0, 5, Threshold::new(0, 0.0))).unwrap();
                reg.register_source(SourceSpec::cell(0, 6, Threshold::new(0, 0.0)).passive()).unwrap();
            }
            _ => {}
        }
        reg.finalize();
        let tables = TargetListBuilder::new(&comm).build(&mut reg).unwrap();
        let five = reg.source_by_gid(5).map(|id| reg.source(id).multisend_index());
        let six = reg.source_by_gid(6).map(|id| reg.source(id).multisend_index());
        (tables.phase1_len(), five, six)
    });

    assert_eq!(views[0], (0, None, None));
    assert_eq!(views[1], (0, None, None));
    // Neither source got an entry, so both send nowhere
    assert_eq!(views[2], (0, Some(None), Some(None)));
}
