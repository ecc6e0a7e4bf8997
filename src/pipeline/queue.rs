//! Bounded drop-oldest queue connecting the pipeline stages
//!
//! Producers never block: pushing onto a full queue evicts the oldest entry
//! and hands it back to the caller, so a borrowed kernel buffer gets released
//! instead of leaking. Consumers block with a stop predicate, which bounds
//! shutdown latency by the wait step.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam::utils::CachePadded;

/// Outcome of a timed pop
#[derive(Debug)]
pub enum Popped<T> {
    Item(T),
    /// Nothing arrived within the wait step; the queue is still live
    Empty,
    /// The queue is stopped and fully drained
    Stopped,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    read: AtomicUsize,
    dropped: AtomicUsize,
}

struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// Fixed-capacity FIFO with drop-oldest overflow and stop-aware waits
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    capacity: usize,
    stats: CachePadded<Stats>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                stopped: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push without blocking. Returns the displaced element: the evicted
    /// oldest entry when the queue was full, or `item` itself when the
    /// queue is already stopped. The caller owns dropping it.
    #[must_use = "the displaced element may hold a kernel buffer that needs releasing"]
    pub fn push(&self, item: T) -> Option<T> {
        let mut inner = self.lock();
        if inner.stopped {
            return Some(item);
        }
        let evicted = if inner.items.len() >= self.capacity {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            inner.items.pop_front()
        } else {
            None
        };
        inner.items.push_back(item);
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.ready.notify_one();
        evicted
    }

    /// Wait up to `timeout` for an entry. Entries still queued when the
    /// queue stops are handed out before `Stopped` is reported.
    pub fn pop_timeout(&self, timeout: Duration) -> Popped<T> {
        let inner = self.lock();
        let (mut inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |inner| {
                inner.items.is_empty() && !inner.stopped
            })
            .unwrap_or_else(|e| e.into_inner());

        if let Some(item) = inner.items.pop_front() {
            self.stats.read.fetch_add(1, Ordering::Relaxed);
            return Popped::Item(item);
        }
        if inner.stopped {
            Popped::Stopped
        } else {
            Popped::Empty
        }
    }

    /// Stop the queue and wake every waiter. Pushes are rejected from here
    /// on; queued entries remain poppable/drainable.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.ready.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (written, read, dropped)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.written.load(Ordering::Relaxed),
            self.stats.read.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn length_never_exceeds_capacity() {
        let queue = BoundedQueue::new(3);
        for i in 0..10 {
            let _ = queue.push(i);
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.stats().2, 7);
    }

    #[test]
    fn eviction_is_oldest_first_and_newest_is_kept() {
        let queue = BoundedQueue::new(2);
        assert!(queue.push(1).is_none());
        assert!(queue.push(2).is_none());
        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.push(4), Some(2));

        match queue.pop_timeout(Duration::ZERO) {
            Popped::Item(v) => assert_eq!(v, 3),
            other => panic!("expected item, got {other:?}"),
        }
        match queue.pop_timeout(Duration::ZERO) {
            Popped::Item(v) => assert_eq!(v, 4),
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[test]
    fn capacity_one_always_yields_the_second_of_two_pushes() {
        let queue = BoundedQueue::new(1);
        assert!(queue.push("first").is_none());
        assert_eq!(queue.push("second"), Some("first"));
        match queue.pop_timeout(Duration::ZERO) {
            Popped::Item(v) => assert_eq!(v, "second"),
            other => panic!("expected item, got {other:?}"),
        }
    }

    #[test]
    fn pop_times_out_on_an_empty_live_queue() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert!(matches!(
            queue.pop_timeout(Duration::from_millis(10)),
            Popped::Empty
        ));
    }

    #[test]
    fn stop_wakes_a_blocked_consumer() {
        let queue: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new(1));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        queue.stop();
        let popped = waiter.join().expect("waiter panicked");
        assert!(matches!(popped, Popped::Stopped));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn queued_entries_survive_stop_until_drained() {
        let queue = BoundedQueue::new(4);
        let _ = queue.push(1);
        let _ = queue.push(2);
        queue.stop();

        assert_eq!(queue.push(3), Some(3), "push after stop hands the item back");
        assert!(matches!(queue.pop_timeout(Duration::ZERO), Popped::Item(1)));
        assert_eq!(queue.drain(), vec![2]);
        assert!(matches!(
            queue.pop_timeout(Duration::ZERO),
            Popped::Stopped
        ));
    }
}
