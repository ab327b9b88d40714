//! Per-thread timed event queues.
//!
//! [`TimedQueue`] is a min-priority queue keyed by delivery time. Items with
//! equal times come out in insertion order. Every insert returns a
//! [`QueueHandle`] that can later remove or reschedule that exact item. Each
//! slot carries a generation counter, so using a handle after its item left
//! the queue is detected and treated as fatal.
//!
//! [`BinQueue`] is the fixed-step alternative: items are bucketed by `dt`
//! and drained bin by bin.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{fatal, NetError};
use crate::types::{SimTime, ThreadIndex, TIME_EPSILON};

/// Handle to an item inside a [`TimedQueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    slot: u32,
    generation: u32,
}

/// An item taken from the queue.
#[derive(Debug)]
pub struct Due<T> {
    pub time: SimTime,
    pub handle: QueueHandle,
    pub item: T,
}

/// Queue activity counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub inserted: u64,
    pub extracted: u64,
    pub removed: u64,
    pub moved: u64,
    pub peak_len: usize,
}

#[derive(Clone, Copy, Debug)]
struct QueueKey {
    time: SimTime,
    seq: u64,
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.seq.cmp(&other.seq))
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<(QueueKey, T)>,
}

/// Min-priority queue of timed items with FIFO tie-breaking.
pub struct TimedQueue<T> {
    order: BTreeMap<QueueKey, u32>,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    next_seq: u64,
    now: SimTime,
    owner: ThreadIndex,
    stats: QueueStats,
}

impl<T> Default for TimedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimedQueue<T> {
    /// Creates an empty queue whose current time is zero.
    pub fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            next_seq: 0,
            now: 0.0,
            owner: 0,
            stats: QueueStats::default(),
        }
    }

    /// Tags the queue with the thread that owns it, for diagnostics.
    /// Tags the bins with the thread that owns them, for diagnostics.
    pub fn with_owner(mut self, owner: ThreadIndex) -> Self {
        self.owner = owner;
        self
    }

    /// The earliest time an item may still be inserted at (minus tolerance).
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Sets the owning thread's current time.
    pub fn set_now(&mut self, now: SimTime) {
        self.now = now;
    }

    /// Inserts an item and returns a handle to it.
    ///
    /// Inserting before the queue's current time (beyond [`TIME_EPSILON`])
    /// is fatal.
    pub fn insert(&mut self, time: SimTime, item: T) -> QueueHandle {
        self.check_not_past(time);
        let key = self.next_key(time);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].entry = Some((key, item));
                slot
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some((key, item)) });
                (self.slots.len() - 1) as u32
            }
        };
        self.order.insert(key, slot);
        self.stats.inserted += 1;
        self.stats.peak_len = self.stats.peak_len.max(self.order.len());
        QueueHandle { slot, generation: self.slots[slot as usize].generation }
    }

    /// Removes and returns the earliest item whose time is `<= deadline`.
    pub fn extract_due(&mut self, deadline: SimTime) -> Option<Due<T>> {
        let (&key, &slot) = self.order.iter().next()?;
        if key.time > deadline {
            return None;
        }
        self.order.remove(&key);
        let handle = QueueHandle { slot, generation: self.slots[slot as usize].generation };
        let item = self.release(slot);
        self.stats.extracted += 1;
        Some(Due { time: key.time, handle, item })
    }

    /// Returns the handle and time of the earliest item without removing it.
    pub fn peek_least(&self) -> Option<(QueueHandle, SimTime)> {
        self.order.iter().next().map(|(key, &slot)| {
            (QueueHandle { slot, generation: self.slots[slot as usize].generation }, key.time)
        })
    }

    /// Removes the item behind `handle`. A stale handle is fatal.
    pub fn remove(&mut self, handle: QueueHandle) -> T {
        let key = self.live_key(handle);
        self.order.remove(&key);
        self.stats.removed += 1;
        self.release(handle.slot)
    }

    /// Moves the item behind `handle` to `new_time`.
    ///
    /// The item is ordered after any items already queued at `new_time`.
    /// The handle stays valid.
    pub fn reschedule(&mut self, handle: QueueHandle, new_time: SimTime) {
        let old = self.live_key(handle);
        self.check_not_past(new_time);
        let key = self.next_key(new_time);
        self.order.remove(&old);
        self.order.insert(key, handle.slot);
        if let Some(entry) = self.slots[handle.slot as usize].entry.as_mut() {
            entry.0 = key;
        }
        self.stats.moved += 1;
    }

    /// Returns the scheduled time of a live handle.
    pub fn time_of(&self, handle: QueueHandle) -> Option<SimTime> {
        self.slots
            .get(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(key, _)| key.time)
    }

    /// Returns true if `handle` still refers to a queued item.
    pub fn contains(&self, handle: QueueHandle) -> bool {
        self.time_of(handle).is_some()
    }

    /// Returns a reference to a queued item.
    pub fn get(&self, handle: QueueHandle) -> Option<&T> {
        self.slots
            .get(handle.slot as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(_, item)| item)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Queued times and items in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = (SimTime, &T)> + '_ {
        self.order.iter().filter_map(move |(key, &slot)| {
            self.slots[slot as usize].entry.as_ref().map(|(_, item)| (key.time, item))
        })
    }

    /// Drops every queued item, invalidating all handles. Returns how many
    /// items were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.order.len();
        let slots: Vec<u32> = self.order.values().copied().collect();
        self.order.clear();
        for slot in slots {
            self.release(slot);
        }
        dropped
    }

    /// Insert, extract and removal counters.
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn next_key(&mut self, time: SimTime) -> QueueKey {
        let key = QueueKey { time, seq: self.next_seq };
        self.next_seq += 1;
        key
    }

    fn check_not_past(&self, time: SimTime) {
        if time < self.now - TIME_EPSILON {
            fatal(NetError::EventInPast { thread: self.owner, time, now: self.now });
        }
    }

    fn live_key(&self, handle: QueueHandle) -> QueueKey {
        match self.slots.get(handle.slot as usize) {
            Some(Slot { generation, entry: Some((key, _)) }) if *generation == handle.generation => *key,
            _ => fatal(NetError::StaleHandle { slot: handle.slot, generation: handle.generation }),
        }
    }

    fn release(&mut self, slot: u32) -> T {
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        let (_, item) = match entry.entry.take() {
            Some(entry) => entry,
            None => fatal(NetError::StaleHandle { slot, generation: entry.generation }),
        };
        self.free.push(slot);
        item
    }
}

/// Fixed-step bin queue.
///
/// Bin `k` holds items due at `tt + k*dt`, where `tt` is the time of the
/// current bin. Items in one bin are delivered in insertion order.
pub struct BinQueue<T> {
    bins: VecDeque<VecDeque<T>>,
    tt: SimTime,
    dt: SimTime,
    len: usize,
    owner: ThreadIndex,
}

impl<T> BinQueue<T> {
    /// Bins of width `dt`, starting at time zero.
    pub fn new(dt: SimTime) -> Self {
        Self { bins: VecDeque::new(), tt: 0.0, dt, len: 0, owner: 0 }
    }

    /// Tags the bins with the thread that owns them, for diagnostics.
    pub fn with_owner(mut self, owner: ThreadIndex) -> Self {
        self.owner = owner;
        self
    }

    /// Time of the current bin.
    pub fn tt(&self) -> SimTime {
        self.tt
    }

    /// Empties all bins and restarts at `tt`.
    pub fn reset(&mut self, tt: SimTime) {
        self.bins.clear();
        self.tt = tt;
        self.len = 0;
    }

    /// Places `item` in the bin covering `td`. A time before the current bin is fatal.
    pub fn enqueue(&mut self, td: SimTime, item: T) {
        let offset = ((td - self.tt) / self.dt + 1e-10).floor();
        if offset < 0.0 {
            fatal(NetError::EventInPast { thread: self.owner, time: td, now: self.tt });
        }
        let bin = offset as usize;
        while self.bins.len() <= bin {
            self.bins.push_back(VecDeque::new());
        }
        self.bins[bin].push_back(item);
        self.len += 1;
    }

    /// Pops the next item of the current bin.
    pub fn dequeue(&mut self) -> Option<T> {
        let item = self.bins.front_mut()?.pop_front()?;
        self.len -= 1;
        Some(item)
    }

    /// Advances to the next bin. The current bin must already be empty.
    pub fn shift(&mut self, tt: SimTime) {
        debug_assert!(self.bins.front().map_or(true, VecDeque::is_empty));
        self.bins.pop_front();
        self.tt = tt;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
