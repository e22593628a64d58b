//! Filters built on the dispatch graph
//!
//! Every operator is a free function taking its upstream first. The same
//! operators are available as methods through [`FlowExt`], which is
//! implemented for everything that has an output:
//!
//! ```ignore
//! let mean = sensor.transduce(sliding_mean(4)?)?;
//! let batches = mean.buffer_with_time_or_count(Duration::from_secs(5), 10, &scheduler)?;
//! ```

pub mod buffer;
pub mod timeout;
pub mod transducer;

pub use buffer::{
    buffer_with_count, buffer_with_time, buffer_with_time_or_count, BufferEventWatcher,
    BufferUntilTimeoutOrCount,
};
pub use timeout::{supply_event_when_timeout, EventWatcher, RepeatLast, SupplyEventWhenTimeout, Timeout, TIMEOUT_PORT};
pub use transducer::{
    sliding_mean, transduce, MeanPolicy, PeriodicMedian, Reading, SlidingMean, SlidingWindow, Transduce,
    Transducer, WindowPolicy,
};

use crate::error::{HandlerResult, Result};
use crate::graph::{Disconnect, Event, Filter, FunctionFilter, InputThing, OutputThing, Upstream, Xform, XformOrDropFilter};
use crate::scheduler::Scheduler;
use std::rc::Rc;
use std::time::Duration;

/// Method-chaining form of the operators
pub trait FlowExt<T: Event>: Upstream<T> {
    fn connect_to<I: InputThing<T>>(&self, input: Rc<I>) -> Result<Disconnect> {
        self.output().connect(input)
    }

    fn passthrough(&self, name: &str) -> Result<Rc<Filter<T>>> {
        Filter::new(self, name)
    }

    /// Apply `f` to every event
    fn map<V, F>(&self, f: F) -> Result<Rc<FunctionFilter<T, V>>>
    where
        V: Event,
        F: Fn(T) -> V + 'static,
    {
        FunctionFilter::builder("map", move |out: &OutputThing<V>, x: T| {
            Ok(out.dispatch_next(f(x))?)
        })
        .connect(self)
    }

    fn function_filter<V, F>(&self, name: &str, on_next: F) -> Result<Rc<FunctionFilter<T, V>>>
    where
        V: Event,
        F: Fn(&OutputThing<V>, T) -> HandlerResult + 'static,
    {
        FunctionFilter::builder(name, on_next).connect(self)
    }

    fn xform<X: Xform<Input = T>>(&self, xform: X) -> Result<Rc<XformOrDropFilter<X>>> {
        XformOrDropFilter::new(self, xform)
    }

    fn transduce<D: Transducer<Input = T>>(&self, transducer: D) -> Result<Rc<XformOrDropFilter<Transduce<D>>>> {
        transduce(self, transducer)
    }

    fn buffer_with_count(&self, count: usize) -> Result<Rc<FunctionFilter<T, Vec<T>>>> {
        buffer_with_count(self, count)
    }

    fn buffer_with_time(
        &self,
        interval: Duration,
        scheduler: &Scheduler,
    ) -> Result<Rc<BufferUntilTimeoutOrCount<T, BufferEventWatcher<T>>>> {
        buffer_with_time(self, interval, scheduler)
    }

    fn buffer_with_time_or_count(
        &self,
        interval: Duration,
        count: usize,
        scheduler: &Scheduler,
    ) -> Result<Rc<BufferUntilTimeoutOrCount<T, BufferEventWatcher<T>>>> {
        buffer_with_time_or_count(self, interval, count, scheduler)
    }

    fn supply_event_when_timeout<W>(
        &self,
        watcher: W,
        scheduler: &Scheduler,
        interval: Duration,
    ) -> Result<Rc<SupplyEventWhenTimeout<T, W>>>
    where
        W: EventWatcher<T, Output = T>,
    {
        supply_event_when_timeout(self, watcher, scheduler, interval)
    }
}

impl<T: Event, U: Upstream<T> + ?Sized> FlowExt<T> for U {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_chained_operators() {
        let src = OutputThing::new("src");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let tail = src
            .map(|x: i32| x as f64 * 2.0)
            .unwrap()
            .transduce(sliding_mean::<f64>(2).unwrap())
            .unwrap()
            .buffer_with_count(2)
            .unwrap();
        tail.output()
            .connect_fn(move |batch: Vec<f64>| {
                sink.borrow_mut().push(batch);
                Ok(())
            })
            .unwrap();
        for x in [1, 3, 5, 7] {
            src.dispatch_next(x).unwrap();
        }
        assert_eq!(*seen.borrow(), vec![vec![2.0, 4.0], vec![8.0, 12.0]]);
    }

    #[test]
    fn test_passthrough_names_its_output() {
        let src = OutputThing::<i32>::new("src");
        let filter = src.passthrough("relay").unwrap();
        assert_eq!(filter.output().name(), "relay");
        assert!(src.has_connections());
    }
}
