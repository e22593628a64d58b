//! Buffering filters
//!
//! Events are collected into `Vec`s and emitted on a count, on a restarting
//! timeout, or both. Whatever is buffered when the stream ends is flushed
//! before the completion or error, even if that batch is empty.

use super::timeout::{EventWatcher, Timeout, TimeoutPort, TimeoutTarget, TIMEOUT_PORT};
use crate::error::{FlowError, HandlerResult, Result, StreamError};
use crate::graph::downstream::Downstream;
use crate::graph::filter::attach;
use crate::graph::{Event, FunctionFilter, InputThing, OutputThing, PortMapping, Upstream, UpstreamLink};
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::Duration;

/// Emit a batch every `count` events
pub fn buffer_with_count<T, U>(upstream: &U, count: usize) -> Result<Rc<FunctionFilter<T, Vec<T>>>>
where
    T: Event,
    U: Upstream<T> + ?Sized,
{
    if count == 0 {
        return Err(FlowError::invalid_argument("buffer count must be positive"));
    }
    let queue: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::with_capacity(count)));
    let (on_next_q, on_completed_q, on_error_q) = (Rc::clone(&queue), Rc::clone(&queue), queue);
    FunctionFilter::builder("buffer_with_count", move |out: &OutputThing<Vec<T>>, x: T| {
        let full = {
            let mut q = on_next_q.borrow_mut();
            q.push(x);
            q.len() == count
        };
        if full {
            let batch = std::mem::take(&mut *on_next_q.borrow_mut());
            out.dispatch_next(batch)?;
        }
        Ok(())
    })
    .on_completed(move |out| {
        let batch = std::mem::take(&mut *on_completed_q.borrow_mut());
        out.dispatch_next(batch)?;
        Ok(out.dispatch_completed()?)
    })
    .on_error(move |out, err| {
        let batch = std::mem::take(&mut *on_error_q.borrow_mut());
        out.dispatch_next(batch)?;
        Ok(out.dispatch_error(err)?)
    })
    .connect(upstream)
}

/// Collects every event; a timeout takes the whole batch.
pub struct BufferEventWatcher<T> {
    queue: Vec<T>,
}

impl<T> Default for BufferEventWatcher<T> {
    fn default() -> Self {
        Self { queue: Vec::new() }
    }
}

impl<T: Event> EventWatcher<T> for BufferEventWatcher<T> {
    type Output = Vec<T>;

    fn on_next(&mut self, x: &T) {
        self.queue.push(x.clone());
    }

    fn produce_event_for_timeout(&mut self) -> Vec<T> {
        std::mem::take(&mut self.queue)
    }
}

/// Emits what the watcher produces after `interval` without a flush, or
/// after `count` events when a count is given.
pub struct BufferUntilTimeoutOrCount<T: Event, W: EventWatcher<T>> {
    output: OutputThing<W::Output>,
    watcher: Rc<RefCell<W>>,
    timeout: Rc<Timeout<W::Output>>,
    interval: Duration,
    count: Option<usize>,
    seen: Cell<usize>,
    upstream: UpstreamLink,
    timeout_link: UpstreamLink,
    _input: PhantomData<fn(T)>,
}

impl<T: Event, W: EventWatcher<T>> BufferUntilTimeoutOrCount<T, W> {
    pub fn new<U>(
        upstream: &U,
        watcher: W,
        scheduler: &Scheduler,
        interval: Duration,
        count: Option<usize>,
    ) -> Result<Rc<Self>>
    where
        U: Upstream<T> + ?Sized,
    {
        if interval.is_zero() {
            return Err(FlowError::invalid_argument("buffer interval must be positive"));
        }
        if count == Some(0) {
            return Err(FlowError::invalid_argument("buffer count must be positive"));
        }
        let watcher = Rc::new(RefCell::new(watcher));
        let timeout = Timeout::new(scheduler, "buffer_until_timeout.timeout", {
            let watcher = Rc::clone(&watcher);
            move || watcher.borrow_mut().produce_event_for_timeout()
        });
        let filter = Rc::new(Self {
            output: OutputThing::new("buffer_until_timeout"),
            watcher,
            timeout,
            interval,
            count,
            seen: Cell::new(0),
            upstream: UpstreamLink::default(),
            timeout_link: UpstreamLink::default(),
            _input: PhantomData,
        });
        attach(&filter, upstream, &filter.upstream)?;
        let token = filter
            .timeout
            .output()
            .connect_port(
                TimeoutPort::new(&filter, filter.output.name()),
                PortMapping::to_input(TIMEOUT_PORT),
            )?;
        filter.timeout_link.set(token);
        filter.timeout.start(interval)?;
        Ok(filter)
    }

    fn flush(&self) -> Result<()> {
        let batch = self.watcher.borrow_mut().produce_event_for_timeout();
        self.output.dispatch_next(batch)
    }

    fn finish(&self) -> Result<()> {
        self.flush()?;
        self.watcher.borrow_mut().close();
        self.timeout.clear();
        self.timeout_link.disconnect();
        Ok(())
    }
}

impl<T: Event, W: EventWatcher<T>> TimeoutTarget<W::Output> for BufferUntilTimeoutOrCount<T, W> {
    fn on_timeout_next(&self, batch: W::Output) -> HandlerResult {
        self.seen.set(0);
        self.timeout.start(self.interval)?;
        Ok(self.output.dispatch_next(batch)?)
    }
}

impl<T: Event, W: EventWatcher<T>> Upstream<W::Output> for BufferUntilTimeoutOrCount<T, W> {
    fn output(&self) -> &OutputThing<W::Output> {
        &self.output
    }
}

impl<T: Event, W: EventWatcher<T>> BufferUntilTimeoutOrCount<T, W> {
    fn on_event(&self, x: T) -> HandlerResult {
        self.watcher.borrow_mut().on_next(&x);
        let seen = self.seen.get() + 1;
        if self.count == Some(seen) {
            self.seen.set(0);
            self.flush()?;
            self.timeout.start(self.interval)?;
        } else {
            self.seen.set(seen);
        }
        Ok(())
    }
}

impl<T: Event, W: EventWatcher<T>> InputThing<T> for BufferUntilTimeoutOrCount<T, W> {
    fn name(&self) -> String {
        self.output.name().to_string()
    }

    fn on_next(&self, x: T) -> HandlerResult {
        self.on_event(x)
    }

    fn on_completed(&self) -> HandlerResult {
        self.finish()?;
        Ok(self.output.dispatch_completed()?)
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        self.finish()?;
        Ok(self.output.dispatch_error(err)?)
    }

    fn downstream(&self) -> Option<Rc<dyn Downstream>> {
        Some(self.output.as_downstream())
    }
}

/// Emit a batch every `interval`
pub fn buffer_with_time<T, U>(
    upstream: &U,
    interval: Duration,
    scheduler: &Scheduler,
) -> Result<Rc<BufferUntilTimeoutOrCount<T, BufferEventWatcher<T>>>>
where
    T: Event,
    U: Upstream<T> + ?Sized,
{
    BufferUntilTimeoutOrCount::new(upstream, BufferEventWatcher::default(), scheduler, interval, None)
}

/// Emit a batch every `count` events, or after `interval` without one
pub fn buffer_with_time_or_count<T, U>(
    upstream: &U,
    interval: Duration,
    count: usize,
    scheduler: &Scheduler,
) -> Result<Rc<BufferUntilTimeoutOrCount<T, BufferEventWatcher<T>>>>
where
    T: Event,
    U: Upstream<T> + ?Sized,
{
    if count == 0 {
        return Err(FlowError::invalid_argument("buffer count must be positive"));
    }
    BufferUntilTimeoutOrCount::new(
        upstream,
        BufferEventWatcher::default(),
        scheduler,
        interval,
        Some(count),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::from_list;

    fn collect<T: Event>(out: &OutputThing<T>) -> Rc<RefCell<Vec<T>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        out.connect_fn(move |x: T| {
            sink.borrow_mut().push(x);
            Ok(())
        })
        .unwrap();
        seen
    }

    #[test]
    fn test_buffer_with_count() {
        let src = OutputThing::new("src");
        let filter = buffer_with_count(&src, 2).unwrap();
        let seen = collect(filter.output());
        for x in 1..=4 {
            src.dispatch_next(x).unwrap();
        }
        assert_eq!(*seen.borrow(), vec![vec![1, 2], vec![3, 4]]);
        // nothing left over, the final batch is still emitted
        src.dispatch_completed().unwrap();
        assert_eq!(seen.borrow().last(), Some(&Vec::new()));
    }

    #[test]
    fn test_buffer_with_count_flushes_on_error() {
        let src = OutputThing::new("src");
        let filter = buffer_with_count(&src, 3).unwrap();
        let seen = collect(filter.output());
        src.dispatch_next(7).unwrap();
        src.dispatch_error(StreamError::msg("sensor gone")).unwrap();
        assert_eq!(*seen.borrow(), vec![vec![7]]);
        assert!(filter.output().is_closed(crate::graph::DEFAULT_PORT));
    }

    #[test]
    fn test_invalid_arguments() {
        let scheduler = Scheduler::new().unwrap();
        let src = OutputThing::<i32>::new("src");
        assert!(matches!(
            buffer_with_count(&src, 0),
            Err(FlowError::InvalidArgument(_))
        ));
        assert!(matches!(
            buffer_with_time(&src, Duration::ZERO, &scheduler),
            Err(FlowError::InvalidArgument(_))
        ));
        assert!(matches!(
            buffer_with_time_or_count(&src, Duration::from_secs(1), 0, &scheduler),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_time_or_count_under_scheduler() {
        let scheduler = Scheduler::new().unwrap();
        let src = from_list(vec![1, 2, 3, 4, 5]);
        let filter = buffer_with_time_or_count(&src, Duration::from_secs(60), 2, &scheduler).unwrap();
        let seen = collect(filter.output());
        scheduler.schedule_recurring(Rc::clone(&src)).unwrap();
        scheduler.run_forever().unwrap();
        assert_eq!(*seen.borrow(), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_timeout_emits_batch() {
        let scheduler = Scheduler::new().unwrap();
        let src = OutputThing::new("src");
        let filter = buffer_with_time(&src, Duration::from_millis(1), &scheduler).unwrap();
        src.dispatch_next(1).unwrap();
        src.dispatch_next(2).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let stopper = scheduler.clone();
        filter
            .output()
            .connect_fn(move |batch: Vec<i32>| {
                sink.borrow_mut().push(batch);
                stopper.stop();
                Ok(())
            })
            .unwrap();
        scheduler.run_forever().unwrap();
        assert_eq!(*seen.borrow(), vec![vec![1, 2]]);
    }

    #[test]
    fn test_dropped_graph_releases_buffer() {
        let scheduler = Scheduler::new().unwrap();
        let src = OutputThing::<i32>::new("src");
        let filter = buffer_with_time(&src, Duration::from_secs(60), &scheduler).unwrap();
        let weak = Rc::downgrade(&filter);
        drop(filter);
        drop(src);
        assert!(weak.upgrade().is_none());
        assert_eq!(scheduler.active_count(), 1);
    }
}
