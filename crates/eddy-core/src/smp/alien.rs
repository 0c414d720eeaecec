//! Queues for threads that are not shards.
//!
//! An alien thread cannot own an SPSC endpoint, so each shard carries one
//! multi-producer intrusive stack aliens push closures onto; the owner swaps
//! the head and replays in submission order. The same shape as the
//! allocator's cross-shard free stack.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct AlienNode {
    next: *mut AlienNode,
    task: Option<Box<dyn FnOnce() + Send>>,
}

/// Lock-free multi-producer stack of alien work for one shard.
pub(crate) struct AlienQueue {
    head: AtomicPtr<AlienNode>,
}

// SAFETY: producers only CAS the head; the single consumer detaches the
// whole list before touching any node.
unsafe impl Send for AlienQueue {}
unsafe impl Sync for AlienQueue {}

impl AlienQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Any-thread push.
    pub(crate) fn push(&self, task: Box<dyn FnOnce() + Send>) {
        let node = Box::into_raw(Box::new(AlienNode {
            next: ptr::null_mut(),
            task: Some(task),
        }));
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node is ours until the CAS publishes it.
            unsafe { (*node).next = old };
            match self
                .head
                .compare_exchange_weak(old, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }
    }

    /// Owner-side drain, in submission order.
    pub(crate) fn drain(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        if head.is_null() {
            return Vec::new();
        }
        let mut tasks = Vec::new();
        while !head.is_null() {
            // SAFETY: the list was detached above; every node is a leaked
            // Box owned by us now.
            let mut node = unsafe { Box::from_raw(head) };
            head = node.next;
            if let Some(task) = node.task.take() {
                tasks.push(task);
            }
        }
        // The stack yields newest-first; restore submission order.
        tasks.reverse();
        tasks
    }
}

impl Drop for AlienQueue {
    fn drop(&mut self) {
        drop(self.drain());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn drain_preserves_submission_order() {
        let q = AlienQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            q.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        for task in q.drain() {
            task();
        }
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_producers_all_land() {
        let q = Arc::new(AlienQueue::new());
        let count = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            let count = Arc::clone(&count);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let count = Arc::clone(&count);
                    q.push(Box::new(move || {
                        count.fetch_add(1, Ordering::Relaxed);
                    }));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for task in q.drain() {
            task();
        }
        assert_eq!(count.load(Ordering::Relaxed), 4000);
    }
}
