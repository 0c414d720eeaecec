//! Execution stages: batched function-call aggregation.
//!
//! A stage collects homogeneous calls and runs them in batches under its
//! scheduling group, amortizing the per-call scheduling cost. The
//! execution-stage poller flushes every registered stage once per loop
//! round; within a stage, calls run in submission order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Internal erased view the flush poller drives.
pub(crate) trait StageFlush {
    /// Schedules the queued batch; returns whether anything was queued.
    fn flush(&self) -> bool;
    fn has_items(&self) -> bool;
}

struct StageInner<T> {
    name: String,
    queue: VecDeque<T>,
    handler: Box<dyn FnMut(T)>,
    /// Task queue batches are dispatched under.
    qid: usize,
}

/// A batched call aggregator for items of type `T`.
pub struct ExecutionStage<T: 'static> {
    inner: Rc<RefCell<StageInner<T>>>,
}

impl<T: 'static> Clone for ExecutionStage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> ExecutionStage<T> {
    /// Creates a stage and registers it with the calling shard's reactor.
    ///
    /// # Panics
    ///
    /// Panics off-shard.
    pub fn new(name: impl Into<String>, qid: usize, handler: impl FnMut(T) + 'static) -> Self {
        let stage = Self {
            inner: Rc::new(RefCell::new(StageInner {
                name: name.into(),
                queue: VecDeque::new(),
                handler: Box::new(handler),
                qid,
            })),
        };
        super::register_stage(Rc::new(stage.clone()));
        stage
    }

    /// Queues one call; it runs at the next stage flush.
    pub fn add(&self, item: T) {
        self.inner.borrow_mut().queue.push_back(item);
    }

    /// Queued calls not yet flushed.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }
}

impl<T: 'static> StageFlush for ExecutionStage<T> {
    fn flush(&self) -> bool {
        let (batch, qid) = {
            let mut inner = self.inner.borrow_mut();
            if inner.queue.is_empty() {
                return false;
            }
            (std::mem::take(&mut inner.queue), inner.qid)
        };
        let inner = Rc::clone(&self.inner);
        super::spawn(
            qid,
            crate::sched::make_task(move || {
                // Detach the handler so it may re-enter the stage (e.g. to
                // queue follow-up calls) without re-borrowing.
                let mut handler =
                    std::mem::replace(&mut inner.borrow_mut().handler, Box::new(|_| {}));
                let mut batch = batch;
                while let Some(item) = batch.pop_front() {
                    handler(item);
                }
                inner.borrow_mut().handler = handler;
            }),
        );
        true
    }

    fn has_items(&self) -> bool {
        !self.inner.borrow().queue.is_empty()
    }
}
