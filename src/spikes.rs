//! Output spike record.
//!
//! Every spike fired by a local source with a non-negative gid is appended
//! here, from whichever thread detected it. A selection narrows the record
//! to chosen gids. At the end of a run the record can be sorted by time and
//! gid and written out.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;

use crate::types::{Gid, SimTime};

/// Thread-safe list of `(time, gid)` pairs.
#[derive(Debug, Default)]
pub struct SpikeLog {
    spikes: Mutex<Vec<(SimTime, Gid)>>,
    /// Gids to keep; everything when unset.
    selected: Option<HashSet<Gid>>,
}

impl SpikeLog {
    /// An empty record that keeps every gid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a spike unless a selection excludes `gid`.
    pub fn record(&self, gid: Gid, time: SimTime) {
        if self.is_recorded(gid) {
            self.spikes.lock().push((time, gid));
        }
    }

    /// Adds `gid` to the selection. The first call switches the record from
    /// every gid to the selected ones.
    pub fn select(&mut self, gid: Gid) {
        self.selected.get_or_insert_with(HashSet::new).insert(gid);
    }

    /// Drops the selection so every gid is recorded again.
    pub fn select_all(&mut self) {
        self.selected = None;
    }

    pub fn is_recorded(&self, gid: Gid) -> bool {
        self.selected.as_ref().map_or(true, |set| set.contains(&gid))
    }

    pub fn len(&self) -> usize {
        self.spikes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spikes.lock().is_empty()
    }

    /// Empties the record. The selection is kept.
    pub fn clear(&self) {
        self.spikes.lock().clear();
    }

    /// Takes the record, leaving it empty.
    pub fn take(&self) -> Vec<(SimTime, Gid)> {
        std::mem::take(&mut *self.spikes.lock())
    }

    /// Copy of the record ordered by time, then gid.
    pub fn sorted(&self) -> Vec<(SimTime, Gid)> {
        let mut spikes = self.spikes.lock().clone();
        spikes.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        spikes
    }

    /// Writes the sorted record as `time<TAB>gid` lines.
    pub fn write_to<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        for (time, gid) in self.sorted() {
            writeln!(w, "{time:.8}\t{gid}")?;
        }
        Ok(())
    }

    /// Writes the sorted record to a new file at `path`.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        self.write_to(std::io::BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_by_time_then_gid() {
        let log = SpikeLog::new();
        log.record(5, 2.0);
        log.record(3, 1.0);
        log.record(1, 2.0);
        assert_eq!(log.sorted(), vec![(1.0, 3), (2.0, 1), (2.0, 5)]);
    }

    #[test]
    fn test_write_format() {
        let log = SpikeLog::new();
        log.record(7, 0.5);
        let mut out = Vec::new();
        log.write_to(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0.50000000\t7\n");
    }

    #[test]
    fn test_selection_narrows_record() {
        let mut log = SpikeLog::new();
        log.select(2);
        log.select(4);
        for gid in 0..6 {
            log.record(gid, gid as f64);
        }
        assert_eq!(log.sorted(), vec![(2.0, 2), (4.0, 4)]);

        log.clear();
        assert!(!log.is_recorded(3));
        log.select_all();
        log.record(3, 1.0);
        assert_eq!(log.take(), vec![(1.0, 3)]);
    }
}
