//! Bridged coroutines
//!
//! A coroutine scheduled on the loop is tracked until it settles, so that
//! [`Scheduler::stop`] can wait for it. Cancellation runs the completion
//! callback with [`Completion::Cancelled`].

use super::Scheduler;
use crate::error::{classify, FlowError, Result, StreamError};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use tokio::task::AbortHandle;

/// Identifies one pending coroutine
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FutureId(pub u64);

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "future-{}", self.0)
    }
}

/// How a coroutine ended, handed to its completion callback.
#[derive(Debug)]
pub enum Completion<T> {
    Succeeded(T),
    Failed(StreamError),
    Cancelled,
}

impl<T> Completion<T> {
    fn outcome(&self) -> Outcome {
        match self {
            Completion::Succeeded(_) => Outcome::Succeeded,
            Completion::Failed(err) => Outcome::Failed(err.clone()),
            Completion::Cancelled => Outcome::Cancelled,
        }
    }
}

/// [`Completion`] without the value, as seen by stop waiters
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Succeeded,
    Failed(StreamError),
    Cancelled,
}

pub(crate) type Waiter = Box<dyn FnOnce(&Scheduler, &Outcome)>;

type DoneSlot<T> = Rc<RefCell<Option<Box<dyn FnOnce(&Scheduler, Completion<T>)>>>>;

pub(crate) struct PendingFuture {
    name: String,
    abort: Option<AbortHandle>,
    on_cancel: Option<Box<dyn FnOnce(&Scheduler)>>,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
pub(crate) struct PendingFutures {
    entries: BTreeMap<FutureId, PendingFuture>,
    next_id: u64,
}

impl PendingFutures {
    fn allocate(&mut self) -> FutureId {
        self.next_id += 1;
        FutureId(self.next_id)
    }

    fn insert(&mut self, id: FutureId, entry: PendingFuture) {
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: FutureId) -> Option<PendingFuture> {
        self.entries.remove(&id)
    }

    pub(crate) fn first_id(&self) -> Option<FutureId> {
        self.entries.keys().next().copied()
    }

    /// Returns false if `id` already settled
    pub(crate) fn add_waiter(&mut self, id: FutureId, waiter: Waiter) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.waiters.push(waiter);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Scheduler {
    /// Run `future` on the loop and track it until it settles.
    ///
    /// `done` is called exactly once: with the value, with the error, or
    /// with [`Completion::Cancelled`]. A [`FlowError`] returned by the
    /// future is recorded as fatal right away; any other error is passed to
    /// `done` and, if the scheduler is stopping, aborts the run.
    pub fn schedule_coroutine<F, T, C>(&self, name: impl Into<String>, future: F, done: C) -> FutureId
    where
        F: Future<Output = anyhow::Result<T>> + 'static,
        T: 'static,
        C: FnOnce(&Scheduler, Completion<T>) + 'static,
    {
        let name = name.into();
        let id = self.inner.pending.borrow_mut().allocate();
        let done: DoneSlot<T> = Rc::new(RefCell::new(Some(Box::new(done))));
        // registered before the task can possibly settle
        self.inner.pending.borrow_mut().insert(
            id,
            PendingFuture {
                name: name.clone(),
                abort: None,
                on_cancel: Some(Box::new({
                    let done = Rc::clone(&done);
                    move |scheduler: &Scheduler| {
                        let callback = done.borrow_mut().take();
                        if let Some(callback) = callback {
                            callback(scheduler, Completion::Cancelled);
                        }
                    }
                })),
                waiters: Vec::new(),
            },
        );

        let weak = self.downgrade();
        let abort = self.spawn(async move {
            let result = future.await;
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(value) => scheduler.settle(id, Completion::Succeeded(value), &done),
                Err(err) => match classify(err) {
                    Ok(fatal) => {
                        let summary = StreamError::msg(fatal.to_string());
                        scheduler.set_fatal(fatal);
                        scheduler.settle(id, Completion::Failed(summary), &done);
                        scheduler.stop();
                    }
                    Err(ordinary) => {
                        tracing::warn!("Coroutine {} failed: {:#}", id, ordinary);
                        scheduler.settle(id, Completion::Failed(StreamError::from(ordinary)), &done);
                    }
                },
            }
        });
        if let Some(entry) = self.inner.pending.borrow_mut().entries.get_mut(&id) {
            entry.abort = Some(abort);
        }
        tracing::debug!("Scheduled coroutine {} as {}", name, id);
        id
    }

    /// Cancel a pending coroutine. Its completion callback sees
    /// [`Completion::Cancelled`], then anything waiting on it is released.
    pub fn cancel_coroutine(&self, id: FutureId) -> Result<()> {
        let on_cancel = {
            let mut pending = self.inner.pending.borrow_mut();
            let entry = pending.entries.get_mut(&id).ok_or_else(|| {
                FlowError::schedule(format!("Coroutine {} is not pending", id))
            })?;
            entry.on_cancel.take()
        };
        if let Some(on_cancel) = on_cancel {
            on_cancel(self);
        }
        let entry = self.inner.pending.borrow_mut().remove(id);
        if let Some(entry) = entry {
            tracing::info!("Canceled coroutine {} ({})", entry.name, id);
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
            self.release_waiters(entry, &Outcome::Cancelled);
        }
        self.stop_when_idle();
        Ok(())
    }

    fn settle<T>(&self, id: FutureId, completion: Completion<T>, done: &DoneSlot<T>) {
        let outcome = completion.outcome();
        let callback = done.borrow_mut().take();
        if let Some(callback) = callback {
            callback(self, completion);
        }
        let entry = self.inner.pending.borrow_mut().remove(id);
        if let Some(entry) = entry {
            tracing::debug!("Coroutine {} ({}) settled", entry.name, id);
            self.release_waiters(entry, &outcome);
        }
        self.stop_when_idle();
    }

    fn release_waiters(&self, entry: PendingFuture, outcome: &Outcome) {
        for waiter in entry.waiters {
            waiter(self, outcome);
        }
    }

    // nothing left that could produce work
    fn stop_when_idle(&self) {
        let idle = self.inner.pending.borrow().is_empty() && self.inner.active.borrow().is_empty();
        if idle {
            self.stop();
        }
    }
}
