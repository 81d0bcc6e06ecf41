//! Fixed-capacity history ring.
//!
//! Keeps the most recent `capacity` readings; older entries are overwritten.
//! The level monitor stores its meter history here and the performance
//! monitor its per-frame timings.
//!
//! # Example
//!
//! ```rust
//! use huntmaster_pipeline::audio::RingBuffer;
//!
//! let mut ring = RingBuffer::new(3);
//! for v in [1.0_f32, 2.0, 3.0, 4.0] {
//!     ring.push(v);
//! }
//! assert_eq!(ring.to_vec(), vec![2.0, 3.0, 4.0]);
//! assert_eq!(ring.latest(), Some(4.0));
//! ```

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity circular history.
///
/// ## Overflow behaviour
///
/// Once `len() == capacity()`, every [`push`](Self::push) replaces the
/// oldest entry.  The buffer never allocates beyond its initial capacity.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: Vec<T>,
    /// Index of the oldest entry once the ring has wrapped.
    head: usize,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create an empty ring.  A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    /// Append `item`, overwriting the oldest entry when full.
    pub fn push(&mut self, item: T) {
        if self.buf.len() < self.capacity {
            self.buf.push(item);
        } else {
            self.buf[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// Entries in chronological order (oldest first).
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let (newer, older) = self.buf.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    /// Owned copy of the entries, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let skip = self.buf.len().saturating_sub(n);
        self.iter().skip(skip).cloned().collect()
    }

    /// Most recently pushed entry.
    pub fn latest(&self) -> Option<T> {
        if self.buf.is_empty() {
            return None;
        }
        let idx = if self.buf.len() < self.capacity {
            self.buf.len() - 1
        } else {
            (self.head + self.capacity - 1) % self.capacity
        };
        Some(self.buf[idx].clone())
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.head = 0;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `true` once the next push will overwrite an entry.
    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }
}

impl RingBuffer<f64> {
    /// Arithmetic mean of the stored values, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.buf.iter().sum::<f64>() / self.buf.len() as f64)
    }

    /// Largest stored value, `None` when empty.
    pub fn max(&self) -> Option<f64> {
        self.buf.iter().copied().reduce(f64::max)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
