//! The input side of the dispatch graph.
//!
//! An [`InputThing`] consumes events on one or more named ports. Handler
//! lookup happens once, when a connection is made, through
//! [`InputThing::port_handlers`]. Things with several input ports override
//! that method and return a different [`PortHandlers`] per port.

use crate::error::{HandlerResult, StreamError};
use crate::graph::connection::PortHandlers;
use crate::graph::downstream::Downstream;
use crate::graph::port::DEFAULT_PORT;
use crate::graph::Event;
use std::rc::Rc;

/// Anything that can receive events.
///
/// Handlers take `&self`; implementations keep their state behind `Cell` or
/// `RefCell`. The graph is owned by a single thread, so no locking is needed.
///
/// `on_next` must not fail with an ordinary error. If it does, dispatch turns
/// the failure into a fatal [`FlowError::Dispatch`](crate::FlowError::Dispatch).
/// Consumers that can recover should handle the problem themselves and call
/// their own `on_error`.
pub trait InputThing<T: Event>: 'static {
    /// Name used in logs and graph dumps
    fn name(&self) -> String {
        short_type_name::<Self>()
    }

    fn on_next(&self, x: T) -> HandlerResult;

    fn on_completed(&self) -> HandlerResult {
        Ok(())
    }

    /// Default behavior logs ordinary errors and ignores them.
    fn on_error(&self, err: StreamError) -> HandlerResult {
        tracing::error!("{}: Received on_error({})", self.name(), err);
        Ok(())
    }

    /// Resolve the handlers for `port`. Returns `None` if the port is not
    /// accepted. Only the default port is accepted unless overridden.
    fn port_handlers(self: Rc<Self>, port: &str) -> Option<PortHandlers<T>> {
        if port != DEFAULT_PORT {
            return None;
        }
        let next = Rc::clone(&self);
        let completed = Rc::clone(&self);
        let error = self;
        Some(PortHandlers::new(
            move |x| next.on_next(x),
            move || completed.on_completed(),
            move |e| error.on_error(e),
        ))
    }

    /// The output side of this thing, if it forwards events. Used to walk
    /// the graph for debugging.
    fn downstream(&self) -> Option<Rc<dyn Downstream>> {
        None
    }
}

/// Type name without the module path.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    if base.len() == full.len() {
        short.to_string()
    } else {
        format!("{}{}", short, &full[base.len()..])
    }
}

type CompletedHandler = Box<dyn Fn() -> HandlerResult>;
type ErrorHandler = Box<dyn Fn(StreamError) -> HandlerResult>;

/// Adapter turning a closure into an [`InputThing`].
///
/// Completion is ignored and errors are logged unless handlers are given.
/// The adapter answers on exactly one input port, `default` unless changed
/// with [`FnInput::with_port`].
pub struct FnInput<T> {
    on_next: Box<dyn Fn(T) -> HandlerResult>,
    on_completed: Option<CompletedHandler>,
    on_error: Option<ErrorHandler>,
    name: String,
    port: String,
}

impl<T: Event> FnInput<T> {
    pub fn new<F>(on_next: F) -> Self
    where
        F: Fn(T) -> HandlerResult + 'static,
    {
        Self {
            on_next: Box::new(on_next),
            on_completed: None,
            on_error: None,
            name: "FnInput".to_string(),
            port: DEFAULT_PORT.to_string(),
        }
    }

    pub fn with_completed<F>(mut self, on_completed: F) -> Self
    where
        F: Fn() -> HandlerResult + 'static,
    {
        self.on_completed = Some(Box::new(on_completed));
        self
    }

    pub fn with_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(StreamError) -> HandlerResult + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Answer on `port` instead of the default port
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }
}

impl<T: Event> InputThing<T> for FnInput<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn on_next(&self, x: T) -> HandlerResult {
        (self.on_next)(x)
    }

    fn on_completed(&self) -> HandlerResult {
        match &self.on_completed {
            Some(f) => f(),
            None => Ok(()),
        }
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        match &self.on_error {
            Some(f) => f(err),
            None => {
                tracing::error!("{}: Received on_error({})", self.name, err);
                Ok(())
            }
        }
    }

    fn port_handlers(self: Rc<Self>, port: &str) -> Option<PortHandlers<T>> {
        if port != self.port {
            return None;
        }
        let next = Rc::clone(&self);
        let completed = Rc::clone(&self);
        let error = self;
        Some(PortHandlers::new(
            move |x| next.on_next(x),
            move || completed.on_completed(),
            move |e| error.on_error(e),
        ))
    }
}
