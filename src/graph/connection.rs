//! Resolved links between an output port and an input port.
//!
//! A [`PortHandlers`] bundle is resolved once, at connect time, from the
//! input thing's per-port handler table. Dispatch then only calls through
//! the stored function pointers.

use crate::error::{HandlerResult, StreamError};
use crate::graph::downstream::Downstream;
use crate::graph::id::InputKey;
use std::fmt;
use std::rc::Rc;

pub type NextFn<T> = Rc<dyn Fn(T) -> HandlerResult>;
pub type CompletedFn = Rc<dyn Fn() -> HandlerResult>;
pub type ErrorFn = Rc<dyn Fn(StreamError) -> HandlerResult>;

/// The three callbacks an input port offers.
pub struct PortHandlers<T> {
    pub on_next: NextFn<T>,
    pub on_completed: CompletedFn,
    pub on_error: ErrorFn,
}

impl<T> PortHandlers<T> {
    pub fn new<N, C, E>(on_next: N, on_completed: C, on_error: E) -> Self
    where
        N: Fn(T) -> HandlerResult + 'static,
        C: Fn() -> HandlerResult + 'static,
        E: Fn(StreamError) -> HandlerResult + 'static,
    {
        Self {
            on_next: Rc::new(on_next),
            on_completed: Rc::new(on_completed),
            on_error: Rc::new(on_error),
        }
    }
}

impl<T> Clone for PortHandlers<T> {
    fn clone(&self) -> Self {
        Self {
            on_next: Rc::clone(&self.on_next),
            on_completed: Rc::clone(&self.on_completed),
            on_error: Rc::clone(&self.on_error),
        }
    }
}

/// One link from an output port to an input port.
pub struct Connection<T> {
    pub(crate) handlers: PortHandlers<T>,
    pub(crate) input_key: InputKey,
    pub(crate) input_name: String,
    pub(crate) input_port: String,
    /// Output side of the input thing, if it forwards events further
    pub(crate) downstream: Option<Rc<dyn Downstream>>,
}

impl<T> Connection<T> {
    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn input_port(&self) -> &str {
        &self.input_port
    }

    pub(crate) fn matches(&self, key: InputKey, port: &str) -> bool {
        self.input_key == key && self.input_port == port
    }

    /// Same link, different callbacks. Identity fields are kept.
    pub(crate) fn with_handlers(&self, handlers: PortHandlers<T>) -> Self {
        Self {
            handlers,
            input_key: self.input_key,
            input_name: self.input_name.clone(),
            input_port: self.input_port.clone(),
            downstream: self.downstream.clone(),
        }
    }
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        self.with_handlers(self.handlers.clone())
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("input", &self.input_name)
            .field("input_port", &self.input_port)
            .finish()
    }
}
