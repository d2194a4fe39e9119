//! Fixed-capacity ring buffer keyed by per-second timestamps, used for
//! rate windowing. Entries carry non-decreasing timestamps; lookup by
//! timestamp is an index computation, not a scan.

use std::sync::Mutex;

struct Inner<T> {
    entries: Vec<Option<(i64, T)>>,
    /// Index of the oldest entry.
    head: usize,
    len: usize,
}

pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: vec![None; capacity.max(1)],
                head: 0,
                len: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry. When full, the oldest entry is evicted.
    pub fn push(&self, timestamp: i64, value: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (inner.head + inner.len) % self.capacity;
        inner.entries[slot] = Some((timestamp, value));
        if inner.len == self.capacity {
            inner.head = (inner.head + 1) % self.capacity;
        } else {
            inner.len += 1;
        }
    }

    /// O(1) lookup by timestamp, computed as an offset from the oldest
    /// entry. Returns `None` when the timestamp is outside the window or
    /// the computed slot holds a different timestamp.
    pub fn get(&self, timestamp: i64) -> Option<T> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len == 0 {
            return None;
        }
        let (oldest_ts, _) = inner.entries[inner.head].as_ref()?;
        let offset = timestamp.checked_sub(*oldest_ts)?;
        if offset < 0 || offset as usize >= inner.len {
            return None;
        }
        let slot = (inner.head + offset as usize) % self.capacity;
        match inner.entries[slot].as_ref() {
            Some((ts, value)) if *ts == timestamp => Some(value.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit entries oldest → newest. Returning `false` stops the walk.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(i64, &T) -> bool,
    {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for offset in 0..inner.len {
            let slot = (inner.head + offset) % self.capacity;
            if let Some((timestamp, value)) = inner.entries[slot].as_ref()
                && !visit(*timestamp, value)
            {
                return;
            }
        }
    }
}
