//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use thingflow::{Event, HandlerResult, InputThing, StreamError};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// What a [`Recorder`] saw
#[derive(Debug, Clone, PartialEq)]
pub enum Record<T> {
    Next(T),
    Completed,
    Error(String),
}

/// Sink that remembers every event it receives
pub struct Recorder<T> {
    name: String,
    records: RefCell<Vec<Record<T>>>,
}

impl<T: Event> Recorder<T> {
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_string(),
            records: RefCell::new(Vec::new()),
        })
    }

    pub fn records(&self) -> Vec<Record<T>> {
        self.records.borrow().clone()
    }

    /// Only the `on_next` values
    pub fn values(&self) -> Vec<T> {
        self.records
            .borrow()
            .iter()
            .filter_map(|r| match r {
                Record::Next(x) => Some(x.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> bool {
        self.records
            .borrow()
            .iter()
            .any(|r| matches!(r, Record::Completed))
    }

    pub fn errors(&self) -> Vec<String> {
        self.records
            .borrow()
            .iter()
            .filter_map(|r| match r {
                Record::Error(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<T: Event> InputThing<T> for Recorder<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn on_next(&self, x: T) -> HandlerResult {
        self.records.borrow_mut().push(Record::Next(x));
        Ok(())
    }

    fn on_completed(&self) -> HandlerResult {
        self.records.borrow_mut().push(Record::Completed);
        Ok(())
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        self.records.borrow_mut().push(Record::Error(err.to_string()));
        Ok(())
    }
}
