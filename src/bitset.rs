//! A fixed-resolution bitset over a byte range, with run-length queries
//! and an optional bounded event stream describing every mutation.
//!
//! Two bitsets are kept per export: an allocation bitset at 4096-byte
//! resolution (has this block ever been written?) and, while a mirror is
//! running, a dirty bitset at the same resolution, whose event stream
//! the mirror drains to learn what changed since it last looked.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Entries fit in about 1 MiB total, matching the original
/// implementation's `(1024*1024) / sizeof(entry)` sizing with a 24-byte
/// encoded entry (tag + two u64 fields, padded).
const STREAM_CAPACITY: usize = (1 << 20) / 24;

/// A mutation reported on a bitset's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Bits were cleared.
    Unset = 0,
    /// Bits were set.
    Set = 1,
    /// The stream was (re-)enabled; synthetic, spans the whole bitset.
    On = 2,
    /// The stream is about to be disabled; synthetic, spans the whole
    /// bitset.
    Off = 3,
}

/// One queued mutation: `event` happened over byte range `[from, from+len)`.
#[derive(Debug, Clone, Copy)]
pub struct StreamEntry {
    /// What happened.
    pub event: Event,
    /// Start of the affected byte range.
    pub from: u64,
    /// Length of the affected byte range.
    pub len: u64,
}

struct StreamState {
    entries: VecDeque<StreamEntry>,
    queued_bytes: [u64; 4],
}

/// A bounded FIFO of bitset mutations. Producers block when full,
/// consumers block when empty — simple backpressure that keeps a slow
/// mirror peer from making the server buffer unboundedly.
pub struct EventStream {
    state: Mutex<StreamState>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl EventStream {
    fn new() -> Self {
        EventStream {
            state: Mutex::new(StreamState { entries: VecDeque::new(), queued_bytes: [0; 4] }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    fn enqueue(&self, event: Event, from: u64, len: u64) {
        let mut state = self.state.lock().unwrap();
        while state.entries.len() >= STREAM_CAPACITY {
            state = self.not_full.wait(state).unwrap();
        }
        state.queued_bytes[event as usize] += len;
        state.entries.push_back(StreamEntry { event, from, len });
        self.not_empty.notify_one();
    }

    /// Block until an entry is available, then remove and return it.
    pub fn dequeue(&self) -> StreamEntry {
        let mut state = self.state.lock().unwrap();
        while state.entries.is_empty() {
            state = self.not_empty.wait(state).unwrap();
        }
        let entry = state.entries.pop_front().unwrap();
        state.queued_bytes[entry.event as usize] -= entry.len;
        self.not_full.notify_one();
        entry
    }

    /// Remove and return the next entry without blocking; `None` if the
    /// stream is currently empty. Used by pollers that can't afford to
    /// block a single-threaded event loop on a condvar.
    pub fn try_dequeue(&self) -> Option<StreamEntry> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.pop_front()?;
        state.queued_bytes[entry.event as usize] -= entry.len;
        self.not_full.notify_one();
        Some(entry)
    }

    /// Number of entries currently queued.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Fraction of capacity currently occupied, in `[0.0, 1.0]`.
    pub fn fill_ratio(&self) -> f64 {
        self.size() as f64 / STREAM_CAPACITY as f64
    }

    /// Total bytes queued for a given event kind (used by the mirror to
    /// decide how much work remains).
    pub fn queued_bytes(&self, event: Event) -> u64 {
        self.state.lock().unwrap().queued_bytes[event as usize]
    }
}

struct Inner {
    bits: Vec<u64>,
    size: u64,
    resolution: u64,
    stream_enabled: bool,
}

impl Inner {
    fn get_bit(&self, idx: u64) -> bool {
        (self.bits[(idx / 64) as usize] >> (idx % 64)) & 1 == 1
    }

    fn set_bit(&mut self, idx: u64, value: bool) {
        let word = &mut self.bits[(idx / 64) as usize];
        let mask = 1u64 << (idx % 64);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    fn bit_len(&self) -> u64 {
        self.size.div_ceil(self.resolution)
    }

    fn set_range_bits(&mut self, first: u64, bitlen: u64, value: bool) {
        for i in first..first + bitlen {
            self.set_bit(i, value);
        }
    }

    /// Count how many consecutive bits starting at `first` equal
    /// `bits[first]`, capped at `max_bits`.
    fn run_len(&self, first: u64, max_bits: u64) -> u64 {
        if max_bits == 0 {
            return 0;
        }
        let want = self.get_bit(first);
        let mut count = 1;
        while count < max_bits && self.get_bit(first + count) == want {
            count += 1;
        }
        count
    }
}

/// Convert a byte range to the inclusive `[first, last]` bit indices it
/// touches at the given resolution, and the bit count spanned.
fn range_to_bits(from: u64, len: u64, resolution: u64) -> (u64, u64) {
    let first = from / resolution;
    let last = (from + len - 1) / resolution;
    (first, last - first + 1)
}

/// A thread-safe bitset tracking allocation or dirtiness of an export at
/// a fixed byte resolution (4096 for both allocation and dirty
/// tracking).
pub struct Bitset {
    inner: Mutex<Inner>,
    stream: EventStream,
}

impl Bitset {
    /// Allocate a bitset covering `size` bytes at `resolution`-byte
    /// granularity, all bits clear.
    pub fn new(size: u64, resolution: u64) -> Self {
        assert!(resolution > 0);
        let bit_len = size.div_ceil(resolution);
        let words = (bit_len as usize).div_ceil(64);
        Bitset {
            inner: Mutex::new(Inner { bits: vec![0u64; words], size, resolution, stream_enabled: false }),
            stream: EventStream::new(),
        }
    }

    /// Size of the range this bitset covers, in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    /// Mark `[from, from+len)` as set, emitting a `Set` event if the
    /// stream is enabled.
    pub fn set_range(&self, from: u64, len: u64) {
        self.mutate_range(from, len, true, Event::Set);
    }

    /// Mark `[from, from+len)` as clear, emitting an `Unset` event if
    /// the stream is enabled.
    pub fn clear_range(&self, from: u64, len: u64) {
        self.mutate_range(from, len, false, Event::Unset);
    }

    fn mutate_range(&self, from: u64, len: u64, value: bool, event: Event) {
        if len == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let (first, bitlen) = range_to_bits(from, len, inner.resolution);
        inner.set_range_bits(first, bitlen, value);
        let enabled = inner.stream_enabled;
        drop(inner);
        if enabled {
            self.stream.enqueue(event, from, len);
        }
    }

    /// Mark the whole bitset set.
    pub fn set_all(&self) {
        let size = self.size();
        self.set_range(0, size);
    }

    /// Is the bit covering byte `offset` set?
    pub fn is_set_at(&self, offset: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.get_bit(offset / inner.resolution)
    }

    /// Is the bit covering byte `offset` clear?
    pub fn is_clear_at(&self, offset: u64) -> bool {
        !self.is_set_at(offset)
    }

    /// Length (in bytes, from `from`) of the run of bits sharing the
    /// value of the bit at `from`, clipped to `len` and to the bitset's
    /// own size. Returns `(run_bytes, value_at_from)`.
    pub fn run_count_ex(&self, from: u64, len: u64) -> (u64, bool) {
        let inner = self.inner.lock().unwrap();
        let from = from.min(inner.size);
        let len = len.min(inner.size.saturating_sub(from));
        if len == 0 {
            return (0, false);
        }
        let (first, max_bits) = range_to_bits(from, len, inner.resolution);
        let value = inner.get_bit(first);
        let run_bits = inner.run_len(first, inner.bit_len() - first).min(max_bits);
        let run_bytes = run_bits * inner.resolution - (from % inner.resolution);
        (run_bytes.min(len), value)
    }

    /// Enable the event stream, also enqueueing a synthetic [`Event::On`]
    /// spanning the whole bitset so a fresh consumer knows to treat
    /// everything as potentially dirty.
    pub fn enable_stream(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stream_enabled = true;
        let size = inner.size;
        self.stream.enqueue(Event::On, 0, size);
    }

    /// Disable the event stream, first enqueueing a synthetic
    /// [`Event::Off`] spanning the whole bitset.
    pub fn disable_stream(&self) {
        let mut inner = self.inner.lock().unwrap();
        let size = inner.size;
        self.stream.enqueue(Event::Off, 0, size);
        inner.stream_enabled = false;
    }

    /// The underlying event stream, for direct draining by the mirror
    /// engine.
    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    /// Clear every bit and discard any queued stream entries, then (if
    /// the stream is enabled) enqueue a fresh [`Event::On`] framing a
    /// new producer lifetime. Used to start a mirror retry with a clean
    /// dirty bitset while keeping the same `Arc` identity, so clients
    /// that already hold a clone of it pick up the reset transparently.
    pub fn reinitialize(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.bits.iter_mut().for_each(|w| *w = 0);
        let enabled = inner.stream_enabled;
        let size = inner.size;
        let mut state = self.stream.state.lock().unwrap();
        state.entries.clear();
        state.queued_bytes = [0; 4];
        if enabled {
            state.queued_bytes[Event::On as usize] += size;
            state.entries.push_back(StreamEntry { event: Event::On, from: 0, len: size });
        }
        drop(state);
        self.stream.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_range_then_run_count() {
        let bs = Bitset::new(16384, 4096);
        bs.set_range(4096, 4096);
        let (run, value) = bs.run_count_ex(0, 16384);
        assert_eq!(run, 4096);
        assert!(!value);
        let (run, value) = bs.run_count_ex(4096, 16384);
        assert_eq!(run, 4096);
        assert!(value);
    }

    #[test]
    fn run_count_clips_to_bitset_size() {
        let bs = Bitset::new(8192, 4096);
        let (run, value) = bs.run_count_ex(0, 1 << 30);
        assert_eq!(run, 8192);
        assert!(!value);
    }

    #[test]
    fn partial_offset_within_a_run_tiles_exactly() {
        let bs = Bitset::new(4096 * 4, 4096);
        bs.set_range(4096, 4096 * 2);
        let (run, value) = bs.run_count_ex(4096 + 100, 4096 * 4);
        assert!(value);
        assert_eq!(run, 4096 * 2 - 100);
    }

    #[test]
    fn is_set_at_tracks_resolution() {
        let bs = Bitset::new(4096 * 3, 4096);
        bs.set_range(4096, 1);
        assert!(!bs.is_set_at(0));
        assert!(bs.is_set_at(4096));
        assert!(bs.is_set_at(4096 + 4095));
        assert!(!bs.is_set_at(4096 * 2));
    }

    #[test]
    fn stream_emits_on_and_set_events_in_order() {
        let bs = Bitset::new(4096 * 2, 4096);
        bs.enable_stream();
        bs.set_range(0, 4096);
        let e1 = bs.stream().dequeue();
        assert_eq!(e1.event, Event::On);
        let e2 = bs.stream().dequeue();
        assert_eq!(e2.event, Event::Set);
        assert_eq!(e2.from, 0);
        assert_eq!(e2.len, 4096);
    }

    #[test]
    fn stream_disabled_by_default_emits_nothing() {
        let bs = Bitset::new(4096, 4096);
        bs.set_range(0, 4096);
        assert_eq!(bs.stream().size(), 0);
    }

    #[test]
    fn reinitialize_clears_bits_and_replays_a_fresh_on_event() {
        let bs = Bitset::new(4096 * 2, 4096);
        bs.enable_stream();
        bs.set_range(0, 4096);
        assert!(bs.is_set_at(0));
        bs.reinitialize();
        assert!(bs.is_clear_at(0));
        assert_eq!(bs.stream().size(), 1);
        let entry = bs.stream().try_dequeue().unwrap();
        assert_eq!(entry.event, Event::On);
        assert_eq!(entry.len, 4096 * 2);
        assert!(bs.stream().try_dequeue().is_none());
    }
}
