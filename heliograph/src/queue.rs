//! Thread-safe write queue.
//!
//! Preformatted command frames waiting for the writer loop. Callers push
//! to the tail; the drain path shifts from the head and may unshift a
//! frame back when no host accepted it. The queue is an array-backed
//! deque behind one mutex; pushing a frame transfers ownership of the
//! bytes to the queue, shifting transfers it back out.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    inner: Mutex<VecDeque<Bytes>>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a frame at the tail.
    pub(crate) fn push(&self, frame: Bytes) {
        self.inner.lock().push_back(frame);
    }

    /// Re-seat a frame at the head, ahead of everything queued.
    pub(crate) fn unshift(&self, frame: Bytes) {
        self.inner.lock().push_front(frame);
    }

    /// Detach and return the head frame.
    pub(crate) fn shift(&self) -> Option<Bytes> {
        self.inner.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn frame(tag: usize) -> Bytes {
        Bytes::from(format!("cmd-{tag}"))
    }

    #[test]
    fn fifo_order_with_unshift_override() {
        let q = WriteQueue::new();
        q.push(frame(1));
        q.push(frame(2));
        q.unshift(frame(0));

        assert_eq!(q.len(), 3);
        assert_eq!(q.shift(), Some(frame(0)));
        assert_eq!(q.shift(), Some(frame(1)));
        assert_eq!(q.shift(), Some(frame(2)));
        assert_eq!(q.shift(), None);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn unshift_into_empty_queue() {
        let q = WriteQueue::new();
        q.unshift(frame(9));
        assert_eq!(q.shift(), Some(frame(9)));
        assert_eq!(q.shift(), None);
    }

    /// The multiset of frames surviving a concurrent push/shift storm is
    /// exactly the multiset pushed minus the multiset shifted.
    #[test]
    fn concurrent_push_shift_preserves_multiset() {
        const PUSHERS: usize = 4;
        const PER_PUSHER: usize = 500;

        let q = Arc::new(WriteQueue::new());

        let pushers: Vec<_> = (0..PUSHERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PUSHER {
                        q.push(frame(p * PER_PUSHER + i));
                    }
                })
            })
            .collect();

        let shifters: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..PER_PUSHER {
                        if let Some(f) = q.shift() {
                            got.push(f);
                        }
                    }
                    got
                })
            })
            .collect();

        for h in pushers {
            h.join().unwrap();
        }

        let mut seen: HashSet<Bytes> = HashSet::new();
        for h in shifters {
            for f in h.join().unwrap() {
                assert!(seen.insert(f), "frame delivered twice");
            }
        }
        while let Some(f) = q.shift() {
            assert!(seen.insert(f), "duplicate frame left in queue");
        }
        assert_eq!(seen.len(), PUSHERS * PER_PUSHER);
    }
}
