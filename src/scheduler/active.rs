//! The active-schedule table.
//!
//! One entry per scheduled entity, keyed by [`ThingId`]. Each entry carries
//! a generation number: a task spawned for one scheduling of an entity
//! checks its generation before acting, so a stale task never touches a
//! later scheduling of the same entity.

use crate::error::{FlowError, Result};
use crate::graph::ThingId;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tokio::task::AbortHandle;

/// How to cancel one active schedule.
pub(crate) enum CancelHandle {
    /// A task on the scheduler's loop
    Task(AbortHandle),
    /// A stop request for a worker thread or an externally driven loop
    Hook(Rc<dyn Fn()>),
}

impl CancelHandle {
    pub(crate) fn cancel(&self) {
        match self {
            CancelHandle::Task(handle) => handle.abort(),
            CancelHandle::Hook(hook) => hook(),
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelHandle::Task(_) => f.write_str("Task"),
            CancelHandle::Hook(_) => f.write_str("Hook"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ActiveEntry {
    pub(crate) name: String,
    pub(crate) generation: u64,
    pub(crate) handle: CancelHandle,
}

#[derive(Debug, Default)]
pub(crate) struct ActiveSchedules {
    entries: BTreeMap<ThingId, ActiveEntry>,
    next_generation: u64,
}

impl ActiveSchedules {
    /// Fail if `id` already has an active schedule, otherwise hand out a
    /// fresh generation for the new one.
    pub(crate) fn reserve(&mut self, id: ThingId, name: &str) -> Result<u64> {
        if let Some(entry) = self.entries.get(&id) {
            return Err(FlowError::schedule(format!(
                "{} ({}) already has an active schedule as {}",
                name, id, entry.name
            )));
        }
        self.next_generation += 1;
        Ok(self.next_generation)
    }

    pub(crate) fn insert(&mut self, id: ThingId, name: String, generation: u64, handle: CancelHandle) {
        self.entries.insert(
            id,
            ActiveEntry {
                name,
                generation,
                handle,
            },
        );
    }

    pub(crate) fn remove(&mut self, id: ThingId) -> Option<ActiveEntry> {
        self.entries.remove(&id)
    }

    /// Remove the entry only if it still belongs to `generation`
    pub(crate) fn remove_current(&mut self, id: ThingId, generation: u64) -> Option<ActiveEntry> {
        if self.is_current(id, generation) {
            self.entries.remove(&id)
        } else {
            None
        }
    }

    pub(crate) fn is_current(&self, id: ThingId, generation: u64) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|entry| entry.generation == generation)
    }

    pub(crate) fn contains(&self, id: ThingId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn drain(&mut self) -> Vec<(ThingId, ActiveEntry)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries.values().map(|e| e.name.clone()).collect()
    }
}
