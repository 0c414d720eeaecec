//! Tasks: the unit of execution on a shard.
//!
//! A task has no return value; it publishes results by resolving
//! continuations, which are themselves tasks. Panics never escape the task
//! boundary: the reactor converts them to logged `runtime_error`s, and
//! fallible tasks hand the error to their continuation instead.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::Error;

/// A schedulable unit of work. Shard-local; tasks never migrate.
pub trait Task {
    /// Runs the task and consumes it.
    fn run_and_dispose(self: Box<Self>);

    /// The task this task is waiting on, when suspended on one. Used by
    /// diagnostics to walk wait chains.
    fn waiting_task(&self) -> Option<&dyn Task> {
        None
    }
}

struct FnTask<F: FnOnce()>(F);

impl<F: FnOnce()> Task for FnTask<F> {
    fn run_and_dispose(self: Box<Self>) {
        (self.0)();
    }
}

/// Wraps a closure as a task.
pub fn make_task<F: FnOnce() + 'static>(f: F) -> Box<dyn Task> {
    Box::new(FnTask(f))
}

struct FallibleTask<T, F, C>
where
    F: FnOnce() -> Result<T, Error>,
    C: FnOnce(Result<T, Error>),
{
    body: F,
    continuation: C,
}

impl<T, F, C> Task for FallibleTask<T, F, C>
where
    F: FnOnce() -> Result<T, Error>,
    C: FnOnce(Result<T, Error>),
{
    fn run_and_dispose(self: Box<Self>) {
        let this = *self;
        let result = match catch_unwind(AssertUnwindSafe(this.body)) {
            Ok(r) => r,
            Err(panic) => Err(Error::Runtime(crate::panic_message(&panic))),
        };
        (this.continuation)(result);
    }
}

/// Builds a task from a fallible body and the continuation that receives its
/// outcome. A panic in the body reaches the continuation as
/// [`Error::Runtime`], never as an unwind.
pub fn make_fallible_task<T, F, C>(body: F, continuation: C) -> Box<dyn Task>
where
    T: 'static,
    F: FnOnce() -> Result<T, Error> + 'static,
    C: FnOnce(Result<T, Error>) + 'static,
{
    Box::new(FallibleTask { body, continuation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn fn_task_runs_once() {
        let ran = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran);
        make_task(move || r.set(true)).run_and_dispose();
        assert!(ran.get());
    }

    #[test]
    fn fallible_task_delivers_ok() {
        let got = Rc::new(Cell::new(0));
        let g = Rc::clone(&got);
        make_fallible_task(|| Ok(7), move |r: Result<i32, Error>| g.set(r.unwrap()))
            .run_and_dispose();
        assert_eq!(got.get(), 7);
    }

    #[test]
    fn panic_becomes_runtime_error() {
        let got = Rc::new(Cell::new(false));
        let g = Rc::clone(&got);
        make_fallible_task(
            || -> Result<(), Error> { panic!("boom") },
            move |r| {
                assert!(matches!(r, Err(Error::Runtime(ref m)) if m.contains("boom")));
                g.set(true);
            },
        )
        .run_and_dispose();
        assert!(got.get());
    }
}
