//! Things that are both inputs and outputs.
//!
//! - [`Filter`]: transparent pass-through, the base shape of every filter
//! - [`FunctionFilter`]: filter assembled from closures
//! - [`XformOrDropFilter`]: runs an [`Xform`] that may transform or drop
//!   each event and may hold back a final value until the stream ends
//!
//! Every filter connects itself to its upstream on construction and keeps
//! the [`Disconnect`] token, so it can detach after an ordinary error.

use crate::error::{is_fatal, HandlerResult, Result, StreamError};
use crate::graph::downstream::Downstream;
use crate::graph::input::{short_type_name, InputThing};
use crate::graph::output::{Disconnect, OutputThing};
use crate::graph::Event;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

/// Anything that exposes an output thing events can be taken from.
pub trait Upstream<T: Event> {
    fn output(&self) -> &OutputThing<T>;
}

impl<T: Event> Upstream<T> for OutputThing<T> {
    fn output(&self) -> &OutputThing<T> {
        self
    }
}

impl<T: Event, U: Upstream<T> + ?Sized> Upstream<T> for Rc<U> {
    fn output(&self) -> &OutputThing<T> {
        (**self).output()
    }
}

/// The disconnect token a filter holds for its upstream connection.
#[derive(Default)]
pub struct UpstreamLink(RefCell<Option<Disconnect>>);

impl UpstreamLink {
    pub fn set(&self, disconnect: Disconnect) {
        *self.0.borrow_mut() = Some(disconnect);
    }

    /// Detach from the upstream. Returns false if already detached.
    pub fn disconnect(&self) -> bool {
        let token = self.0.borrow_mut().take();
        match token {
            Some(token) => token.disconnect(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Connect `filter` to `upstream` and remember the token in its link.
pub(crate) fn attach<T, F, U>(filter: &Rc<F>, upstream: &U, link: &UpstreamLink) -> Result<()>
where
    T: Event,
    F: InputThing<T>,
    U: Upstream<T> + ?Sized,
{
    let token = upstream.output().connect(Rc::clone(filter))?;
    link.set(token);
    Ok(())
}

/// Pass-through filter: forwards next, completed and error unchanged.
pub struct Filter<T: Event> {
    output: OutputThing<T>,
    upstream: UpstreamLink,
}

impl<T: Event> Filter<T> {
    pub fn new<U>(upstream: &U, name: impl Into<String>) -> Result<Rc<Self>>
    where
        U: Upstream<T> + ?Sized,
    {
        let filter = Rc::new(Self {
            output: OutputThing::new(name),
            upstream: UpstreamLink::default(),
        });
        attach(&filter, upstream, &filter.upstream)?;
        Ok(filter)
    }

    pub fn disconnect_from_upstream(&self) -> bool {
        self.upstream.disconnect()
    }
}

impl<T: Event> Upstream<T> for Filter<T> {
    fn output(&self) -> &OutputThing<T> {
        &self.output
    }
}

impl<T: Event> InputThing<T> for Filter<T> {
    fn name(&self) -> String {
        self.output.name().to_string()
    }

    fn on_next(&self, x: T) -> HandlerResult {
        Ok(self.output.dispatch_next(x)?)
    }

    fn on_completed(&self) -> HandlerResult {
        Ok(self.output.dispatch_completed()?)
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        Ok(self.output.dispatch_error(err)?)
    }

    fn downstream(&self) -> Option<Rc<dyn Downstream>> {
        Some(self.output.as_downstream())
    }
}

type NextHandler<T, U> = Box<dyn Fn(&OutputThing<U>, T) -> HandlerResult>;
type CompletedHandler<U> = Box<dyn Fn(&OutputThing<U>) -> HandlerResult>;
type ErrorHandler<U> = Box<dyn Fn(&OutputThing<U>, StreamError) -> HandlerResult>;

/// A filter whose behavior is given by closures.
///
/// Each closure receives the filter's output so it can dispatch. Without a
/// completed or error closure the notification is forwarded downstream.
///
/// An ordinary error from the next closure is logged, delivered through the
/// filter's own error path, and the filter detaches from its upstream.
pub struct FunctionFilter<T: Event, U: Event> {
    output: OutputThing<U>,
    on_next: NextHandler<T, U>,
    on_completed: Option<CompletedHandler<U>>,
    on_error: Option<ErrorHandler<U>>,
    upstream: UpstreamLink,
}

pub struct FunctionFilterBuilder<T: Event, U: Event> {
    name: String,
    on_next: NextHandler<T, U>,
    on_completed: Option<CompletedHandler<U>>,
    on_error: Option<ErrorHandler<U>>,
    _marker: PhantomData<fn(T) -> U>,
}

impl<T: Event, U: Event> FunctionFilter<T, U> {
    pub fn builder<F>(name: impl Into<String>, on_next: F) -> FunctionFilterBuilder<T, U>
    where
        F: Fn(&OutputThing<U>, T) -> HandlerResult + 'static,
    {
        FunctionFilterBuilder {
            name: name.into(),
            on_next: Box::new(on_next),
            on_completed: None,
            on_error: None,
            _marker: PhantomData,
        }
    }

    pub fn disconnect_from_upstream(&self) -> bool {
        self.upstream.disconnect()
    }
}

impl<T: Event, U: Event> FunctionFilterBuilder<T, U> {
    pub fn on_completed<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputThing<U>) -> HandlerResult + 'static,
    {
        self.on_completed = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&OutputThing<U>, StreamError) -> HandlerResult + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Build the filter and connect it to `upstream`
    pub fn connect<S>(self, upstream: &S) -> Result<Rc<FunctionFilter<T, U>>>
    where
        S: Upstream<T> + ?Sized,
    {
        let filter = Rc::new(FunctionFilter {
            output: OutputThing::new(self.name),
            on_next: self.on_next,
            on_completed: self.on_completed,
            on_error: self.on_error,
            upstream: UpstreamLink::default(),
        });
        attach(&filter, upstream, &filter.upstream)?;
        Ok(filter)
    }
}

impl<T: Event, U: Event> Upstream<U> for FunctionFilter<T, U> {
    fn output(&self) -> &OutputThing<U> {
        &self.output
    }
}

impl<T: Event, U: Event> InputThing<T> for FunctionFilter<T, U> {
    fn name(&self) -> String {
        self.output.name().to_string()
    }

    fn on_next(&self, x: T) -> HandlerResult {
        match (self.on_next)(&self.output, x) {
            Err(e) if !is_fatal(&e) => {
                tracing::error!("Got an error in {}.on_next: {:#}", self.output.name(), e);
                self.on_error(StreamError::from(e))?;
                self.upstream.disconnect();
                Ok(())
            }
            other => other,
        }
    }

    fn on_completed(&self) -> HandlerResult {
        match &self.on_completed {
            Some(f) => f(&self.output),
            None => Ok(self.output.dispatch_completed()?),
        }
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        match &self.on_error {
            Some(f) => f(&self.output, err),
            None => Ok(self.output.dispatch_error(err)?),
        }
    }

    fn downstream(&self) -> Option<Rc<dyn Downstream>> {
        Some(self.output.as_downstream())
    }
}

/// Per-event transform that may drop events and may emit a final value.
pub trait Xform: 'static {
    type Input: Event;
    type Output: Event;

    /// `Ok(None)` drops the event
    fn filter(&mut self, x: Self::Input) -> anyhow::Result<Option<Self::Output>>;

    /// Called once before completion or error is forwarded
    fn complete(&mut self) -> anyhow::Result<Option<Self::Output>> {
        Ok(None)
    }

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// Filter running an [`Xform`].
///
/// On completion or error any held-back value from [`Xform::complete`] is
/// dispatched first, so partial state is never silently lost.
pub struct XformOrDropFilter<X: Xform> {
    output: OutputThing<X::Output>,
    xform: RefCell<X>,
    upstream: UpstreamLink,
}

impl<X: Xform> XformOrDropFilter<X> {
    pub fn new<U>(upstream: &U, xform: X) -> Result<Rc<Self>>
    where
        U: Upstream<X::Input> + ?Sized,
    {
        let filter = Rc::new(Self {
            output: OutputThing::new(xform.name()),
            xform: RefCell::new(xform),
            upstream: UpstreamLink::default(),
        });
        attach(&filter, upstream, &filter.upstream)?;
        Ok(filter)
    }

    pub fn disconnect_from_upstream(&self) -> bool {
        self.upstream.disconnect()
    }

    fn flush(&self) -> HandlerResult {
        let last = self.xform.borrow_mut().complete()?;
        if let Some(x) = last {
            self.output.dispatch_next(x)?;
        }
        Ok(())
    }
}

impl<X: Xform> Upstream<X::Output> for XformOrDropFilter<X> {
    fn output(&self) -> &OutputThing<X::Output> {
        &self.output
    }
}

impl<X: Xform> InputThing<X::Input> for XformOrDropFilter<X> {
    fn name(&self) -> String {
        self.output.name().to_string()
    }

    fn on_next(&self, x: X::Input) -> HandlerResult {
        let result = self.xform.borrow_mut().filter(x);
        match result {
            Ok(Some(y)) => Ok(self.output.dispatch_next(y)?),
            Ok(None) => Ok(()),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                tracing::error!("Got an error in {}.filter: {:#}", self.output.name(), e);
                self.on_error(StreamError::from(e))?;
                self.upstream.disconnect();
                Ok(())
            }
        }
    }

    fn on_completed(&self) -> HandlerResult {
        self.flush()?;
        Ok(self.output.dispatch_completed()?)
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        self.flush()?;
        Ok(self.output.dispatch_error(err)?)
    }

    fn downstream(&self) -> Option<Rc<dyn Downstream>> {
        Some(self.output.as_downstream())
    }
}
