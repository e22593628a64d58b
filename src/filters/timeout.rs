//! Timeouts
//!
//! A [`Timeout`] is an output thing scheduled one-shot on the event loop.
//! When it fires it asks its producer for an event and dispatches it.
//! Consumers restart it after every real event, and after every firing if
//! repeated silence should produce repeated events.

use crate::error::{FlowError, HandlerResult, Result, StreamError};
use crate::graph::downstream::Downstream;
use crate::graph::filter::attach;
use crate::graph::{Event, InputThing, OutputThing, PortHandlers, PortMapping, ThingId, Upstream, UpstreamLink};
use crate::scheduler::{Cancel, DirectOutputThing, Scheduler, WeakScheduler};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Input port on which timeout events arrive
pub const TIMEOUT_PORT: &str = "timeout";

type Producer<T> = RefCell<Box<dyn FnMut() -> T>>;

/// One-shot, restartable timer that emits an event when it fires.
pub struct Timeout<T: Event> {
    me: Weak<Timeout<T>>,
    scheduler: WeakScheduler,
    output: OutputThing<T>,
    producer: Producer<T>,
    cancel: RefCell<Option<Cancel>>,
}

impl<T: Event> Timeout<T> {
    pub fn new<F>(scheduler: &Scheduler, name: impl Into<String>, producer: F) -> Rc<Self>
    where
        F: FnMut() -> T + 'static,
    {
        let name = name.into();
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            scheduler: scheduler.downgrade(),
            output: OutputThing::new(name),
            producer: RefCell::new(Box::new(producer)),
            cancel: RefCell::new(None),
        })
    }

    /// (Re)start the countdown. A pending countdown is dropped first.
    pub fn start(&self, interval: Duration) -> Result<()> {
        let pending = self.cancel.borrow_mut().take();
        if let Some(cancel) = pending {
            cancel.cancel_for_reschedule();
        }
        let scheduler = self.scheduler.upgrade().ok_or_else(|| {
            FlowError::schedule(format!("Scheduler for {} no longer exists", self.output.name()))
        })?;
        let me = self.me.upgrade().ok_or_else(|| {
            FlowError::schedule(format!("{} is being dropped", self.output.name()))
        })?;
        let cancel = scheduler.schedule_later_one_time(me, interval)?;
        *self.cancel.borrow_mut() = Some(cancel);
        Ok(())
    }

    /// Drop a pending countdown, if any.
    pub fn clear(&self) {
        let pending = self.cancel.borrow_mut().take();
        let Some(cancel) = pending else {
            return;
        };
        let active = self
            .scheduler
            .upgrade()
            .is_some_and(|s| s.is_active(cancel.id()));
        if active {
            if let Err(e) = cancel.cancel() {
                tracing::warn!("Failed to clear {}: {}", self.output.name(), e);
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.cancel.borrow().is_some()
    }
}

impl<T: Event> Upstream<T> for Timeout<T> {
    fn output(&self) -> &OutputThing<T> {
        &self.output
    }
}

impl<T: Event> DirectOutputThing for Timeout<T> {
    fn thing_id(&self) -> ThingId {
        self.output.id()
    }

    fn name(&self) -> String {
        self.output.name().to_string()
    }

    // only runs when the timeout fires
    fn observe(&self) -> Result<()> {
        self.cancel.borrow_mut().take();
        let event = (self.producer.borrow_mut())();
        self.output.dispatch_next(event)
    }

    fn has_connections(&self) -> bool {
        self.output.has_connections()
    }
}

/// Watches a stream and supplies the event to emit when it goes quiet.
pub trait EventWatcher<T>: 'static {
    type Output: Event;

    fn on_next(&mut self, x: &T);

    fn produce_event_for_timeout(&mut self) -> Self::Output;

    /// The watched stream completed or failed
    fn close(&mut self) {}
}

/// Passes events through, and emits the watcher's event whenever no event
/// arrived for `interval`.
pub struct SupplyEventWhenTimeout<T: Event, W: EventWatcher<T, Output = T>> {
    output: OutputThing<T>,
    watcher: Rc<RefCell<W>>,
    timeout: Rc<Timeout<T>>,
    interval: Duration,
    upstream: UpstreamLink,
    timeout_link: UpstreamLink,
}

impl<T: Event, W: EventWatcher<T, Output = T>> SupplyEventWhenTimeout<T, W> {
    /// Connect to `upstream` and start the first countdown. The countdown
    /// only runs once the scheduler does.
    pub fn new<U>(upstream: &U, watcher: W, scheduler: &Scheduler, interval: Duration) -> Result<Rc<Self>>
    where
        U: Upstream<T> + ?Sized,
    {
        let watcher = Rc::new(RefCell::new(watcher));
        let timeout = Timeout::new(scheduler, "supply_event_when_timeout.timeout", {
            let watcher = Rc::clone(&watcher);
            move || watcher.borrow_mut().produce_event_for_timeout()
        });
        let filter = Rc::new(Self {
            output: OutputThing::new("supply_event_when_timeout"),
            watcher,
            timeout,
            interval,
            upstream: UpstreamLink::default(),
            timeout_link: UpstreamLink::default(),
        });
        attach(&filter, upstream, &filter.upstream)?;
        let token = filter.timeout.output().connect_port(
            TimeoutPort::new(&filter, filter.output.name()),
            PortMapping::to_input(TIMEOUT_PORT),
        )?;
        filter.timeout_link.set(token);
        filter.timeout.start(interval)?;
        Ok(filter)
    }

    fn finish(&self) {
        self.watcher.borrow_mut().close();
        self.timeout.clear();
        self.timeout_link.disconnect();
    }

}

impl<T: Event, W: EventWatcher<T, Output = T>> TimeoutTarget<T> for SupplyEventWhenTimeout<T, W> {
    fn on_timeout_next(&self, x: T) -> HandlerResult {
        self.timeout.start(self.interval)?;
        Ok(self.output.dispatch_next(x)?)
    }
}

/// Completion or error arriving on the timeout port
pub(crate) fn unexpected_timeout_event(thing: &str, event: &str) -> anyhow::Error {
    FlowError::InvalidPort {
        thing: thing.to_string(),
        port: TIMEOUT_PORT.to_string(),
        reason: format!("{} should never arrive on this port", event),
    }
    .into()
}

/// A filter that owns a [`Timeout`] and consumes its events.
pub(crate) trait TimeoutTarget<E>: 'static {
    fn on_timeout_next(&self, x: E) -> HandlerResult;
}

/// Input side of a filter's timeout port.
///
/// Holds the filter weakly: the filter owns the timeout, so a strong link
/// back would keep both alive after the rest of the graph is gone.
pub(crate) struct TimeoutPort<F> {
    target: Weak<F>,
    name: String,
}

impl<F> TimeoutPort<F> {
    pub(crate) fn new(target: &Rc<F>, owner: &str) -> Rc<Self> {
        Rc::new(Self {
            target: Rc::downgrade(target),
            name: format!("{}.{}", owner, TIMEOUT_PORT),
        })
    }
}

impl<E: Event, F: TimeoutTarget<E>> InputThing<E> for TimeoutPort<F> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn on_next(&self, x: E) -> HandlerResult {
        match self.target.upgrade() {
            Some(target) => target.on_timeout_next(x),
            None => {
                tracing::debug!("{} fired after its filter was dropped", self.name);
                Ok(())
            }
        }
    }

    fn on_completed(&self) -> HandlerResult {
        Err(unexpected_timeout_event(&self.name, "on_completed"))
    }

    fn on_error(&self, _err: StreamError) -> HandlerResult {
        Err(unexpected_timeout_event(&self.name, "on_error"))
    }

    fn port_handlers(self: Rc<Self>, port: &str) -> Option<PortHandlers<E>> {
        if port != TIMEOUT_PORT {
            return None;
        }
        let (next, completed, error) = (Rc::clone(&self), Rc::clone(&self), self);
        Some(PortHandlers::new(
            move |x| next.on_next(x),
            move || completed.on_completed(),
            move |e| error.on_error(e),
        ))
    }
}

impl<T: Event, W: EventWatcher<T, Output = T>> Upstream<T> for SupplyEventWhenTimeout<T, W> {
    fn output(&self) -> &OutputThing<T> {
        &self.output
    }
}

impl<T: Event, W: EventWatcher<T, Output = T>> InputThing<T> for SupplyEventWhenTimeout<T, W> {
    fn name(&self) -> String {
        self.output.name().to_string()
    }

    fn on_next(&self, x: T) -> HandlerResult {
        self.watcher.borrow_mut().on_next(&x);
        self.timeout.start(self.interval)?;
        Ok(self.output.dispatch_next(x)?)
    }

    fn on_completed(&self) -> HandlerResult {
        self.finish();
        Ok(self.output.dispatch_completed()?)
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        self.finish();
        Ok(self.output.dispatch_error(err)?)
    }

    fn downstream(&self) -> Option<Rc<dyn Downstream>> {
        Some(self.output.as_downstream())
    }
}

/// Watcher that repeats the last event seen, for sensors that go quiet.
pub struct RepeatLast<T> {
    last: Option<T>,
    fallback: T,
}

impl<T: Event> RepeatLast<T> {
    /// `fallback` is emitted if the timeout fires before any event
    pub fn new(fallback: T) -> Self {
        Self {
            last: None,
            fallback,
        }
    }
}

impl<T: Event> EventWatcher<T> for RepeatLast<T> {
    type Output = T;

    fn on_next(&mut self, x: &T) {
        self.last = Some(x.clone());
    }

    fn produce_event_for_timeout(&mut self) -> T {
        self.last.clone().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Insert the watcher's event whenever `upstream` is quiet for `interval`
pub fn supply_event_when_timeout<T, W, U>(
    upstream: &U,
    watcher: W,
    scheduler: &Scheduler,
    interval: Duration,
) -> Result<Rc<SupplyEventWhenTimeout<T, W>>>
where
    T: Event,
    W: EventWatcher<T, Output = T>,
    U: Upstream<T> + ?Sized,
{
    SupplyEventWhenTimeout::new(upstream, watcher, scheduler, interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_timeout_fires_once() {
        let scheduler = Scheduler::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let timeout = Timeout::new(&scheduler, "t", || 42);
        let count = Rc::clone(&fired);
        timeout
            .output()
            .connect_fn(move |x: i32| {
                assert_eq!(x, 42);
                count.set(count.get() + 1);
                Ok(())
            })
            .unwrap();
        timeout.start(Duration::from_millis(1)).unwrap();
        assert!(timeout.is_pending());
        scheduler.run_forever().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!timeout.is_pending());
    }

    #[test]
    fn test_restart_replaces_pending_countdown() {
        let scheduler = Scheduler::new().unwrap();
        let timeout = Timeout::new(&scheduler, "t", || 1);
        timeout.output().connect_fn(|_x: i32| Ok(())).unwrap();
        timeout.start(Duration::from_secs(60)).unwrap();
        timeout.start(Duration::from_secs(60)).unwrap();
        assert_eq!(scheduler.active_count(), 1);
        timeout.clear();
        assert_eq!(scheduler.active_count(), 0);
        // clearing twice is harmless
        timeout.clear();
    }

    #[test]
    fn test_timeout_port_rejects_completion() {
        let scheduler = Scheduler::new().unwrap();
        let src = OutputThing::new("src");
        let filter = SupplyEventWhenTimeout::new(
            &src,
            RepeatLast::new(0),
            &scheduler,
            Duration::from_secs(60),
        )
        .unwrap();
        let err = filter.timeout.output().dispatch_completed().unwrap_err();
        assert!(matches!(err, FlowError::InvalidPort { .. }));
    }

    #[test]
    fn test_filter_freed_without_completion() {
        let scheduler = Scheduler::new().unwrap();
        let src = OutputThing::new("src");
        let filter = SupplyEventWhenTimeout::new(
            &src,
            RepeatLast::new(0),
            &scheduler,
            Duration::from_secs(60),
        )
        .unwrap();
        let weak = Rc::downgrade(&filter);
        // the pending countdown keeps the timeout alive, not the filter
        let timeout = Rc::clone(&filter.timeout);
        drop(filter);
        drop(src);
        assert!(weak.upgrade().is_none());
        assert!(timeout.is_pending());
    }

    #[test]
    fn test_completion_detaches_timeout() {
        let scheduler = Scheduler::new().unwrap();
        let src = OutputThing::new("src");
        let filter = SupplyEventWhenTimeout::new(
            &src,
            RepeatLast::new(0),
            &scheduler,
            Duration::from_secs(60),
        )
        .unwrap();
        filter.output().connect_fn(|_x: i32| Ok(())).unwrap();
        src.dispatch_next(5).unwrap();
        src.dispatch_completed().unwrap();
        assert!(!filter.timeout.has_connections());
        assert!(!filter.timeout.is_pending());
        assert_eq!(scheduler.active_count(), 0);
    }
}
