//! Thread-safe bounded FIFO with a terminal finished state.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of a [`BoundedQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    /// The queue is finished and drained.
    Finished,
    /// The timeout elapsed with the queue still empty.
    TimedOut,
}

struct Inner<T> {
    items: VecDeque<T>,
    finished: bool,
}

/// Bounded multi-producer multi-consumer queue.
///
/// `push` either blocks until space frees up or fails immediately when
/// full, per the construction flag. After [`finish`](Self::finish) pushes
/// always fail and pops drain the remaining items before reporting
/// [`Pop::Finished`].
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    blocking_push: bool,
}

impl<T> BoundedQueue<T> {
    /// A queue whose `push` blocks while full.
    pub fn blocking(capacity: usize) -> Self {
        Self::with_mode(capacity, true)
    }

    /// A queue whose `push` fails while full.
    pub fn failing(capacity: usize) -> Self {
        Self::with_mode(capacity, false)
    }

    fn with_mode(capacity: usize, blocking_push: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                finished: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            blocking_push,
        }
    }

    /// Enqueues an item. Returns false once the queue is finished, or —
    /// in failing mode — while it is at capacity.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.finished {
                return false;
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.not_empty.notify_one();
                return true;
            }
            if !self.blocking_push {
                return false;
            }
            self.not_full.wait(&mut inner);
        }
    }

    /// Enqueues without waiting, regardless of the construction flag.
    /// Returns false when the queue is finished or at capacity.
    pub fn try_push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.finished || inner.items.len() >= self.capacity {
            return false;
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Dequeues an item, waiting up to `timeout` (forever when `None`).
    pub fn pop(&self, timeout: Option<Duration>) -> Pop<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Pop::Item(item);
            }
            if inner.finished {
                return Pop::Finished;
            }
            match timeout {
                Some(timeout) => {
                    if self.not_empty.wait_for(&mut inner, timeout).timed_out() {
                        return Pop::TimedOut;
                    }
                }
                None => self.not_empty.wait(&mut inner),
            }
        }
    }

    /// Dequeues without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Clones the front item without removing it.
    pub fn front_clone(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().items.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Moves the queue to its terminal state and wakes every waiter.
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.finished = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::failing(4);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.pop(None), Pop::Item(1));
        assert_eq!(queue.pop(None), Pop::Item(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_failing_push_at_capacity() {
        let queue = BoundedQueue::failing(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_finish_drains_then_fails() {
        let queue = BoundedQueue::failing(4);
        assert!(queue.push(1));
        queue.finish();
        assert!(!queue.push(2));
        assert_eq!(queue.pop(None), Pop::Item(1));
        assert_eq!(queue.pop(None), Pop::Finished);
        assert_eq!(queue.pop(Some(Duration::from_millis(1))), Pop::Finished);
    }

    #[test]
    fn test_front_clone_peeks() {
        let queue = BoundedQueue::failing(4);
        assert_eq!(queue.front_clone(), None);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.front_clone(), Some(1));
        // Peeking does not consume.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(None), Pop::Item(1));
        assert_eq!(queue.front_clone(), Some(2));
    }

    #[test]
    fn test_try_push_never_blocks() {
        let queue = BoundedQueue::blocking(1);
        assert!(queue.try_push(1));
        assert!(!queue.try_push(2));
        queue.finish();
        assert_eq!(queue.pop(None), Pop::Item(1));
        assert!(!queue.try_push(3));
    }

    #[test]
    fn test_pop_timeout() {
        let queue: BoundedQueue<u8> = BoundedQueue::failing(1);
        assert_eq!(queue.pop(Some(Duration::from_millis(10))), Pop::TimedOut);
    }

    #[test]
    fn test_blocking_push_waits_for_space() {
        let queue = Arc::new(BoundedQueue::blocking(1));
        assert!(queue.push(1));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(None), Pop::Item(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(None), Pop::Item(2));
    }

    #[test]
    fn test_finish_unblocks_blocked_push() {
        let queue = Arc::new(BoundedQueue::blocking(1));
        assert!(queue.push(1));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        queue.finish();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn test_cross_thread_ordering() {
        let queue = Arc::new(BoundedQueue::blocking(8));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    assert!(queue.push(i));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 100 {
            if let Pop::Item(i) = queue.pop(Some(Duration::from_secs(5))) {
                seen.push(i);
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
