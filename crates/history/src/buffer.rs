use std::collections::VecDeque;

/// Fixed-capacity FIFO buffer for a history sequence.
///
/// When full, the oldest element is evicted on each push.
#[derive(Debug, Clone)]
pub(crate) struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Build from an existing sequence, keeping only its newest
    /// `capacity` elements. A zero capacity is treated as one.
    pub(crate) fn from_vec(capacity: usize, items: Vec<T>) -> Self {
        let capacity = capacity.max(1);
        let mut buf = VecDeque::from(items);
        while buf.len() > capacity {
            buf.pop_front();
        }
        Self { buf, capacity }
    }

    /// Push a value, evicting the oldest entry when at capacity.
    pub(crate) fn push(&mut self, value: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Oldest → newest.
    pub(crate) fn into_vec(self) -> Vec<T> {
        self.buf.into()
    }
}
