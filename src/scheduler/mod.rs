//! Event-loop scheduler
//!
//! The [`Scheduler`] owns a single-threaded tokio runtime and a
//! [`LocalSet`]. Every handler in the dispatch graph runs on that one thread;
//! the graph needs no locking.
//!
//! # Scheduling strategies
//!
//! | Method | Runs `observe` | Thread |
//! |---|---|---|
//! | [`schedule_periodic`](Scheduler::schedule_periodic) | every interval | loop |
//! | [`schedule_recurring`](Scheduler::schedule_recurring) | back-to-back | loop |
//! | [`schedule_later_one_time`](Scheduler::schedule_later_one_time) | once, after a delay | loop |
//! | [`schedule_on_main_event_loop`](Scheduler::schedule_on_main_event_loop) | thing drives itself | loop |
//! | [`schedule_periodic_on_separate_thread`](Scheduler::schedule_periodic_on_separate_thread) | blocking pull | worker |
//! | [`schedule_on_private_event_loop`](Scheduler::schedule_on_private_event_loop) | thing's own loop | worker |
//!
//! Blocking sinks ([`Scheduler::schedule_blocking_sink`]) and bridged
//! coroutines ([`Scheduler::schedule_coroutine`]) are tracked as well.
//!
//! Work on worker threads reaches the loop only through [`LoopHandle`] and
//! [`RemoteOutput`]; events are always dispatched on the loop thread.
//!
//! # Shutdown
//!
//! A thing that loses all downstream connections is descheduled. When the
//! active table becomes empty the scheduler [`stop`](Scheduler::stop)s:
//! every remaining cancel handle is invoked, then the loop halts once no
//! bridged coroutine is still pending. The first fatal error recorded by
//! [`record_fatal`](Scheduler::record_fatal) is returned from
//! [`run_forever`](Scheduler::run_forever).

mod active;
pub mod blocking_sink;
pub mod bridge;
pub mod contracts;
pub mod coroutine;
mod threads;
pub mod tick;
pub mod tick_runner;

pub use blocking_sink::{BlockingInputThing, BlockingSink};
pub use bridge::{LoopHandle, RemoteOutput};
pub use contracts::{DirectOutputThing, EventLoopSource, MainLoopOutputThing, StopHook};
pub use coroutine::{Completion, FutureId};
pub use tick::TickScheduler;
pub use tick_runner::{Clock, ManualClock, SystemClock, TickRunner};

use crate::config::SchedulerSettings;
use crate::error::{FlowError, Result};
use crate::graph::{OutputThing, ThingId};
use crate::sources::{sensor_source, Sensor, SensorEvent};
use active::{ActiveSchedules, CancelHandle};
use bridge::RemoteCall;
use coroutine::{Outcome, PendingFutures};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Notify};
use tokio::task::{AbortHandle, LocalSet};

struct Inner {
    settings: SchedulerSettings,
    active: RefCell<ActiveSchedules>,
    pending: RefCell<PendingFutures>,
    fatal: RefCell<Option<FlowError>>,
    halted: Cell<bool>,
    halt: Notify,
    workers: RefCell<Vec<(String, JoinHandle<()>)>>,
    remote: mpsc::UnboundedSender<RemoteCall>,
    // dropped before the runtime
    local: LocalSet,
    runtime: Runtime,
}

/// Handle to the event-loop scheduler. Clones share the same loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

/// Non-owning reference to a [`Scheduler`], held by tasks and by things
/// that schedule themselves.
#[derive(Clone)]
pub struct WeakScheduler {
    inner: Weak<Inner>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

impl fmt::Debug for WeakScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakScheduler")
    }
}

/// Disposer returned by every scheduling call.
#[derive(Clone)]
pub struct Cancel {
    scheduler: WeakScheduler,
    id: ThingId,
    name: String,
}

impl Cancel {
    fn new(scheduler: WeakScheduler, id: ThingId, name: String) -> Self {
        Self { scheduler, id, name }
    }

    pub fn id(&self) -> ThingId {
        self.id
    }

    /// Deschedule the entity.
    ///
    /// Fails with [`FlowError::Schedule`] if it is not currently active. If
    /// this removes the last active schedule, the scheduler stops.
    pub fn cancel(&self) -> Result<()> {
        let scheduler = self.scheduler.upgrade().ok_or_else(|| {
            FlowError::schedule(format!("Scheduler for {} no longer exists", self.name))
        })?;
        scheduler.cancel_schedule(self.id)
    }

    /// Cancel in order to schedule again right away. Never stops the
    /// scheduler. Returns false if the entity was not active.
    pub(crate) fn cancel_for_reschedule(&self) -> bool {
        match self.scheduler.upgrade() {
            Some(scheduler) => {
                let entry = scheduler.inner.active.borrow_mut().remove(self.id);
                match entry {
                    Some(entry) => {
                        entry.handle.cancel();
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Cadence {
    Periodic(Duration),
    Recurring,
}

impl Scheduler {
    /// Scheduler with default settings
    pub fn new() -> Result<Self> {
        Self::with_settings(SchedulerSettings::default())
    }

    pub fn with_settings(settings: SchedulerSettings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (remote, remote_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            inner: Rc::new(Inner {
                settings,
                active: RefCell::new(ActiveSchedules::default()),
                pending: RefCell::new(PendingFutures::default()),
                fatal: RefCell::new(None),
                halted: Cell::new(false),
                halt: Notify::new(),
                workers: RefCell::new(Vec::new()),
                remote,
                local: LocalSet::new(),
                runtime,
            }),
        };
        scheduler.spawn_remote_drain(remote_rx);
        Ok(scheduler)
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// `Send` handle for enqueueing work onto this loop from other threads
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.inner.remote.clone())
    }

    pub(crate) fn spawn<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.local.spawn_local(future).abort_handle()
    }

    /// Run `f` on the loop as soon as possible. An error returned by `f` is
    /// recorded as fatal.
    pub fn call_soon<F>(&self, f: F) -> AbortHandle
    where
        F: FnOnce(&Scheduler) -> Result<()> + 'static,
    {
        let weak = self.downgrade();
        self.spawn(async move {
            if let Some(scheduler) = weak.upgrade() {
                if let Err(e) = f(&scheduler) {
                    scheduler.record_fatal(e);
                }
            }
        })
    }

    /// Run `f` on the loop after `delay`.
    pub fn call_later<F>(&self, delay: Duration, f: F) -> AbortHandle
    where
        F: FnOnce(&Scheduler) -> Result<()> + 'static,
    {
        let weak = self.downgrade();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = weak.upgrade() {
                if let Err(e) = f(&scheduler) {
                    scheduler.record_fatal(e);
                }
            }
        })
    }

    /// Call `observe` every `interval` for as long as the thing has
    /// downstream connections.
    pub fn schedule_periodic<D>(&self, thing: Rc<D>, interval: Duration) -> Result<Cancel>
    where
        D: DirectOutputThing,
    {
        self.schedule_repeating(thing, Cadence::Periodic(interval))
    }

    /// Call `observe` back-to-back, yielding to the loop between calls.
    /// Meant for sources that never block, such as iterators.
    pub fn schedule_recurring<D>(&self, thing: Rc<D>) -> Result<Cancel>
    where
        D: DirectOutputThing,
    {
        self.schedule_repeating(thing, Cadence::Recurring)
    }

    fn schedule_repeating<D>(&self, thing: Rc<D>, cadence: Cadence) -> Result<Cancel>
    where
        D: DirectOutputThing,
    {
        let id = thing.thing_id();
        let name = thing.name();
        let generation = self.inner.active.borrow_mut().reserve(id, &name)?;
        let weak = self.downgrade();
        let task = self.spawn(async move {
            loop {
                match cadence {
                    Cadence::Periodic(interval) => tokio::time::sleep(interval).await,
                    Cadence::Recurring => tokio::task::yield_now().await,
                }
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                if !scheduler.is_current(id, generation) {
                    return;
                }
                if let Err(e) = thing.observe() {
                    scheduler.record_fatal(e);
                    return;
                }
                if !scheduler.is_current(id, generation) {
                    return;
                }
                if !thing.has_connections() {
                    scheduler.finished(id, generation);
                    return;
                }
            }
        });
        self.inner.active.borrow_mut().insert(
            id,
            name.clone(),
            generation,
            CancelHandle::Task(task),
        );
        tracing::debug!("Scheduled {} ({})", name, id);
        Ok(Cancel::new(self.downgrade(), id, name))
    }

    /// Call `observe` exactly once, after `delay`.
    ///
    /// The entity leaves the active table right before `observe` runs, so
    /// `observe` may schedule the same entity again. If the table is empty
    /// once `observe` returns, the scheduler stops.
    pub fn schedule_later_one_time<D>(&self, thing: Rc<D>, delay: Duration) -> Result<Cancel>
    where
        D: DirectOutputThing,
    {
        let id = thing.thing_id();
        let name = thing.name();
        let generation = self.inner.active.borrow_mut().reserve(id, &name)?;
        let weak = self.downgrade();
        let task = self.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            let entry = scheduler
                .inner
                .active
                .borrow_mut()
                .remove_current(id, generation);
            if entry.is_none() {
                return;
            }
            if let Err(e) = thing.observe() {
                scheduler.record_fatal(e);
                return;
            }
            scheduler.stop_if_no_active();
        });
        self.inner.active.borrow_mut().insert(
            id,
            name.clone(),
            generation,
            CancelHandle::Task(task),
        );
        Ok(Cancel::new(self.downgrade(), id, name))
    }

    /// Let a thing with event-driven I/O run on this loop. Its
    /// `observe_event_loop` is called soon; canceling calls `stop_loop`.
    pub fn schedule_on_main_event_loop<M>(&self, thing: Rc<M>) -> Result<Cancel>
    where
        M: MainLoopOutputThing,
    {
        let id = thing.thing_id();
        let name = thing.name();
        let generation = self.inner.active.borrow_mut().reserve(id, &name)?;
        let stopper = Rc::clone(&thing);
        self.inner.active.borrow_mut().insert(
            id,
            name.clone(),
            generation,
            CancelHandle::Hook(Rc::new(move || stopper.stop_loop())),
        );
        self.call_soon(move |scheduler| {
            if !scheduler.is_current(id, generation) {
                return Ok(());
            }
            thing.observe_event_loop(scheduler)
        });
        Ok(Cancel::new(self.downgrade(), id, name))
    }

    /// Sample `sensor` periodically. `compose` connects the downstream graph
    /// to the sensor's output before scheduling starts.
    pub fn schedule_sensor<S, F>(&self, sensor: S, interval: Duration, compose: F) -> Result<Cancel>
    where
        S: Sensor + 'static,
        F: FnOnce(&OutputThing<SensorEvent>) -> Result<()>,
    {
        let thing = sensor_source(sensor);
        compose(crate::graph::Upstream::output(&thing))?;
        self.schedule_periodic(thing, interval)
    }

    /// Like [`schedule_sensor`](Self::schedule_sensor), but the sensor is
    /// sampled on a worker thread.
    pub fn schedule_sensor_on_separate_thread<S, F>(
        &self,
        sensor: S,
        interval: Duration,
        compose: F,
    ) -> Result<Cancel>
    where
        S: Sensor + Send + 'static,
        F: FnOnce(&OutputThing<SensorEvent>) -> Result<()>,
    {
        let thing = sensor_source(sensor);
        compose(crate::graph::Upstream::output(&thing))?;
        self.schedule_periodic_on_separate_thread(&thing, interval)
    }

    pub fn is_active(&self, id: ThingId) -> bool {
        self.inner.active.borrow().contains(id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.borrow().len()
    }

    /// Names of the currently scheduled entities
    pub fn active_names(&self) -> Vec<String> {
        self.inner.active.borrow().names()
    }

    pub fn pending_coroutines(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    fn is_current(&self, id: ThingId, generation: u64) -> bool {
        self.inner.active.borrow().is_current(id, generation)
    }

    /// Deschedule `id`: fail if inactive, cancel, remove, stop if the table
    /// became empty.
    pub(crate) fn cancel_schedule(&self, id: ThingId) -> Result<()> {
        let entry = self.inner.active.borrow_mut().remove(id).ok_or_else(|| {
            FlowError::schedule(format!(
                "Attempt to de-schedule {}, which does not have an active schedule",
                id
            ))
        })?;
        tracing::info!("Canceling schedule of {}", entry.name);
        entry.handle.cancel();
        self.stop_if_no_active();
        Ok(())
    }

    /// Remove `id` from the active table without canceling it. Things
    /// scheduled on the main event loop call this when they are done.
    /// Returns false if `id` was not active.
    pub fn remove_from_active_schedules(&self, id: ThingId) -> bool {
        let entry = self.inner.active.borrow_mut().remove(id);
        match entry {
            Some(entry) => {
                tracing::debug!("Removed {} from active schedules", entry.name);
                self.stop_if_no_active();
                true
            }
            None => false,
        }
    }

    /// A task or worker for `(id, generation)` ended on its own.
    pub(crate) fn finished(&self, id: ThingId, generation: u64) {
        let entry = self
            .inner
            .active
            .borrow_mut()
            .remove_current(id, generation);
        if let Some(entry) = entry {
            tracing::debug!("{} has no more work, descheduled", entry.name);
            self.stop_if_no_active();
        }
    }

    /// Drop `(id, generation)` from the table without canceling or
    /// stopping. Used when its worker failed.
    pub(crate) fn abandon(&self, id: ThingId, generation: u64) {
        self.inner
            .active
            .borrow_mut()
            .remove_current(id, generation);
    }

    fn stop_if_no_active(&self) {
        if self.inner.active.borrow().is_empty() {
            tracing::info!("No more active schedules, will exit event loop");
            self.stop();
        }
    }

    /// Record a fatal error and stop. Only the first error is kept; it is
    /// returned from [`run_forever`](Self::run_forever).
    pub fn record_fatal(&self, err: FlowError) {
        self.set_fatal(err);
        self.stop();
    }

    fn set_fatal(&self, err: FlowError) {
        let mut slot = self.inner.fatal.borrow_mut();
        match slot.as_ref() {
            None => {
                tracing::error!("Fatal error, stopping scheduler: {}", err);
                *slot = Some(err);
            }
            Some(first) => {
                tracing::warn!("Additional fatal error after {}: {}", first, err);
            }
        }
    }

    /// Cancel every active schedule, then halt the loop once no bridged
    /// coroutine is pending.
    ///
    /// If a coroutine is still running, `stop` arranges to run again when it
    /// settles; a failed coroutine is escalated to a fatal error.
    pub fn stop(&self) {
        let drained = self.inner.active.borrow_mut().drain();
        for (_, entry) in &drained {
            tracing::debug!("Stopping {}", entry.name);
            entry.handle.cancel();
        }
        drop(drained);

        let first_pending = self.inner.pending.borrow().first_id();
        if let Some(id) = first_pending {
            tracing::info!("Waiting for {} before stopping the event loop", id);
            self.inner.pending.borrow_mut().add_waiter(
                id,
                Box::new(move |scheduler: &Scheduler, outcome: &Outcome| match outcome {
                    Outcome::Failed(err) => scheduler.record_fatal(FlowError::Coroutine {
                        id: id.to_string(),
                        source: err.clone(),
                    }),
                    _ => scheduler.stop(),
                }),
            );
            return;
        }
        self.inner.halted.set(true);
        self.inner.halt.notify_waiters();
    }

    /// Run the loop until it is stopped.
    ///
    /// Returns immediately if nothing is scheduled. After the loop exits the
    /// worker threads are joined (unless disabled in the settings) and the
    /// first recorded fatal error, if any, is returned wrapped in
    /// [`FlowError::Aborted`].
    ///
    /// Must not be called from inside a task running on this scheduler.
    pub fn run_forever(&self) -> Result<()> {
        let idle = self.inner.active.borrow().is_empty() && self.inner.pending.borrow().is_empty();
        if idle {
            tracing::warn!("run_forever called with nothing scheduled");
        } else {
            tracing::info!(
                "Starting event loop with {} active schedule(s)",
                self.active_count()
            );
            self.inner.halted.set(false);
            let inner = &self.inner;
            inner.runtime.block_on(inner.local.run_until(async {
                while !inner.halted.get() {
                    inner.halt.notified().await;
                }
            }));
            tracing::info!("Event loop exited");
        }

        if self.inner.settings.join_workers_on_exit {
            self.join_workers();
        }
        match self.inner.fatal.borrow_mut().take() {
            Some(err) => Err(FlowError::Aborted(Box::new(err))),
            None => Ok(()),
        }
    }

    fn thread_name(&self, thing: &str) -> String {
        format!("{}-{}", self.inner.settings.worker_thread_prefix, thing)
    }

    fn register_worker(&self, name: String, handle: JoinHandle<()>) {
        self.inner.workers.borrow_mut().push((name, handle));
    }

    fn join_workers(&self) {
        let workers = std::mem::take(&mut *self.inner.workers.borrow_mut());
        for (name, handle) in workers {
            tracing::debug!("Joining worker thread {}", name);
            if handle.join().is_err() {
                tracing::error!("Worker thread {} panicked", name);
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("active", &self.active_names())
            .field("pending_coroutines", &self.pending_coroutines())
            .finish()
    }
}
