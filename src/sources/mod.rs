//! Pull-based sources
//!
//! A [`Source`] produces one value per call to [`Source::pull`]. Wrapped in
//! a [`SourceThing`] it becomes an output thing the scheduler can drive:
//! periodically or back-to-back on the event loop, or on a worker thread
//! when pulling may block.
//!
//! # Provided sources
//!
//! - [`from_iter`] / [`from_list`]: any iterator
//! - [`from_results`]: an iterator of `anyhow::Result`, where an `Err` item
//!   becomes an `on_error` event and ends the stream
//! - [`from_func`]: a state-driven generator
//! - [`sensor::sensor_source`]: samples a [`sensor::Sensor`]

pub mod sensor;

pub use sensor::{sensor_source, Sensor, SensorEvent, SensorSource};

use crate::error::{Result, StreamError};
use crate::graph::filter::Upstream;
use crate::graph::input::short_type_name;
use crate::graph::{Event, OutputThing, ThingId};
use crate::scheduler::DirectOutputThing;
use std::cell::RefCell;
use std::rc::Rc;

/// Outcome of one pull.
#[derive(Debug)]
pub enum Pull<T> {
    Next(T),
    Exhausted,
    Failed(StreamError),
}

/// Something that yields values on demand.
pub trait Source: 'static {
    type Item: Event;

    fn pull(&mut self) -> Pull<Self::Item>;

    /// Release resources once the stream has ended, either by exhaustion or
    /// by an error. Called before the final event is dispatched.
    fn close(&mut self) {}

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// Output thing driven by a [`Source`].
pub struct SourceThing<S: Source> {
    output: OutputThing<S::Item>,
    source: RefCell<Option<S>>,
}

impl<S: Source> SourceThing<S> {
    pub fn new(source: S) -> Rc<Self> {
        let name = source.name();
        Self::named(name, source)
    }

    pub fn named(name: impl Into<String>, source: S) -> Rc<Self> {
        Rc::new(Self {
            output: OutputThing::new(name),
            source: RefCell::new(Some(source)),
        })
    }

    /// True once the source ended or was moved to a worker thread
    pub fn is_detached(&self) -> bool {
        self.source.borrow().is_none()
    }

    /// Move the source out, for scheduling on a worker thread
    pub(crate) fn detach_source(&self) -> Option<S> {
        self.source.borrow_mut().take()
    }

    fn close_source(&self) {
        let source = self.source.borrow_mut().take();
        if let Some(mut source) = source {
            source.close();
        }
    }
}

impl<S: Source> Upstream<S::Item> for SourceThing<S> {
    fn output(&self) -> &OutputThing<S::Item> {
        &self.output
    }
}

impl<S: Source> DirectOutputThing for SourceThing<S> {
    fn thing_id(&self) -> ThingId {
        self.output.id()
    }

    fn name(&self) -> String {
        self.output.name().to_string()
    }

    fn observe(&self) -> Result<()> {
        let pulled = match self.source.borrow_mut().as_mut() {
            Some(source) => source.pull(),
            None => return Ok(()),
        };
        match pulled {
            Pull::Next(x) => self.output.dispatch_next(x),
            Pull::Exhausted => {
                self.close_source();
                self.output.dispatch_completed()
            }
            Pull::Failed(err) => {
                tracing::warn!("Source {} failed: {}", self.output.name(), err);
                self.close_source();
                self.output.dispatch_error(err)
            }
        }
    }

    fn has_connections(&self) -> bool {
        self.output.has_connections()
    }
}

/// Source over any iterator.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator + 'static,
    I::Item: Event,
{
    type Item = I::Item;

    fn pull(&mut self) -> Pull<I::Item> {
        match self.iter.next() {
            Some(x) => Pull::Next(x),
            None => Pull::Exhausted,
        }
    }

    fn name(&self) -> String {
        "IterSource".to_string()
    }
}

pub fn from_iter<I>(items: I) -> Rc<SourceThing<IterSource<I::IntoIter>>>
where
    I: IntoIterator,
    I::IntoIter: 'static,
    I::Item: Event,
{
    SourceThing::new(IterSource::new(items.into_iter()))
}

pub fn from_list<T: Event>(items: Vec<T>) -> Rc<SourceThing<IterSource<std::vec::IntoIter<T>>>> {
    SourceThing::named("from_list", IterSource::new(items.into_iter()))
}

/// Source over an iterator of results. The first `Err` ends the stream
/// with an `on_error` event.
pub struct ResultSource<I> {
    iter: I,
}

impl<I, T> Source for ResultSource<I>
where
    I: Iterator<Item = anyhow::Result<T>> + 'static,
    T: Event,
{
    type Item = T;

    fn pull(&mut self) -> Pull<T> {
        match self.iter.next() {
            Some(Ok(x)) => Pull::Next(x),
            Some(Err(e)) => Pull::Failed(StreamError::from(e)),
            None => Pull::Exhausted,
        }
    }

    fn name(&self) -> String {
        "ResultSource".to_string()
    }
}

pub fn from_results<I, T>(items: I) -> Rc<SourceThing<ResultSource<I::IntoIter>>>
where
    I: IntoIterator<Item = anyhow::Result<T>>,
    I::IntoIter: 'static,
    T: Event,
{
    SourceThing::new(ResultSource {
        iter: items.into_iter(),
    })
}

/// State-driven generator.
///
/// Emits `select(state)` for the initial state and after each `iterate`
/// step, for as long as `condition(state)` holds.
pub struct FuncSource<St, T> {
    state: St,
    started: bool,
    condition: Box<dyn Fn(&St) -> bool>,
    iterate: Box<dyn Fn(&St) -> St>,
    select: Box<dyn Fn(&St) -> T>,
}

impl<St: 'static, T: Event> Source for FuncSource<St, T> {
    type Item = T;

    fn pull(&mut self) -> Pull<T> {
        if self.started {
            self.state = (self.iterate)(&self.state);
        }
        self.started = true;
        if (self.condition)(&self.state) {
            Pull::Next((self.select)(&self.state))
        } else {
            Pull::Exhausted
        }
    }

    fn name(&self) -> String {
        "from_func".to_string()
    }
}

pub fn from_func<St, T, C, It, Sel>(
    initial: St,
    condition: C,
    iterate: It,
    select: Sel,
) -> Rc<SourceThing<FuncSource<St, T>>>
where
    St: 'static,
    T: Event,
    C: Fn(&St) -> bool + 'static,
    It: Fn(&St) -> St + 'static,
    Sel: Fn(&St) -> T + 'static,
{
    SourceThing::new(FuncSource {
        state: initial,
        started: false,
        condition: Box::new(condition),
        iterate: Box::new(iterate),
        select: Box::new(select),
    })
}
