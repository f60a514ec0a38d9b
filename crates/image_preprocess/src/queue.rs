//! Bounded random-order queue used between reader threads and lanes.

use crate::coordinator::{Coordinator, POLL_INTERVAL};
use crate::types::{PreprocessError, PreprocessResult};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Dequeues a uniformly random element, holding back `min_after_dequeue`
/// elements until the queue is closed so the draw stays well mixed.
pub struct ShuffleQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    min_after_dequeue: usize,
}

struct State<T> {
    items: Vec<T>,
    closed: bool,
    rng: StdRng,
}

impl<T> ShuffleQueue<T> {
    pub fn new(
        capacity: usize,
        min_after_dequeue: usize,
        seed: Option<u64>,
    ) -> PreprocessResult<Self> {
        if capacity <= min_after_dequeue {
            return Err(PreprocessError::Config(format!(
                "shuffle queue capacity {capacity} must exceed min_after_dequeue {min_after_dequeue}"
            )));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Ok(Self {
            state: Mutex::new(State {
                items: Vec::with_capacity(capacity.min(1 << 16)),
                closed: false,
                rng,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            min_after_dequeue,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_after_dequeue(&self) -> usize {
        self.min_after_dequeue
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks while full. Returns `false` if the item was dropped because the
    /// queue closed or the coordinator stopped.
    pub fn push(&self, item: T, coord: &Coordinator) -> bool {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity {
            if state.closed || coord.should_stop() {
                return false;
            }
            self.not_full.wait_for(&mut state, POLL_INTERVAL);
        }
        if state.closed {
            return false;
        }
        state.items.push(item);
        self.not_empty.notify_one();
        true
    }

    /// Blocks until more than `min_after_dequeue` items are buffered, or the
    /// queue is closed and non-empty. `None` once closed and drained, or on stop.
    pub fn pop(&self, coord: &Coordinator) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            let st = &mut *state;
            let len = st.items.len();
            if len > self.min_after_dequeue || (st.closed && len > 0) {
                let idx = st.rng.random_range(0..len);
                let item = st.items.swap_remove(idx);
                self.not_full.notify_one();
                return Some(item);
            }
            if st.closed || coord.should_stop() {
                return None;
            }
            self.not_empty.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    /// No further pushes are accepted; waiting consumers drain what is left.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capacity_must_exceed_minimum() {
        assert!(ShuffleQueue::<u8>::new(4, 4, None).is_err());
    }

    #[test]
    fn holds_back_minimum_until_closed() {
        let coord = Coordinator::new();
        let q = ShuffleQueue::new(8, 3, Some(1)).unwrap();
        for i in 0..3 {
            assert!(q.push(i, &coord));
        }
        coord.request_stop();
        assert!(q.pop(&coord).is_none());

        let coord = Coordinator::new();
        q.close();
        let drained: BTreeSet<_> = std::iter::from_fn(|| q.pop(&coord)).collect();
        assert_eq!(drained, (0..3).collect());
        assert!(!q.push(9, &coord));
    }

    #[test]
    fn concurrent_producers_deliver_everything() {
        let coord = Coordinator::new();
        let q = Arc::new(ShuffleQueue::new(16, 4, Some(5)).unwrap());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                let coord = coord.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        assert!(q.push(p * 100 + i, &coord));
                    }
                })
            })
            .collect();
        let closer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for h in producers {
                    h.join().unwrap();
                }
                q.close();
            })
        };
        let mut seen = Vec::new();
        while let Some(v) = q.pop(&coord) {
            seen.push(v);
        }
        closer.join().unwrap();
        assert_eq!(seen.len(), 200);
        let unique: BTreeSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 200);
        // a random draw from a 16-slot buffer should not reproduce insertion order
        let sorted: Vec<_> = unique.into_iter().collect();
        assert_ne!(seen, sorted);
    }
}
