//! Sensors as sources
//!
//! A [`Sensor`] is anything with an id that can be sampled. Each sample is
//! wrapped in a timestamped [`SensorEvent`].

use crate::error::StreamError;
use crate::sources::{Pull, Source, SourceThing};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// A device or stub that produces numeric samples.
#[cfg_attr(test, mockall::automock)]
pub trait Sensor {
    fn sensor_id(&self) -> String;

    /// `Ok(None)` ends the stream. An `Err` is delivered downstream as an
    /// ordinary stream error.
    fn sample(&mut self) -> anyhow::Result<Option<f64>>;
}

/// One sample from one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent<V = f64> {
    pub sensor_id: String,
    pub ts: DateTime<Utc>,
    pub val: V,
}

impl<V> SensorEvent<V> {
    /// Event stamped with the current time
    pub fn new(sensor_id: impl Into<String>, val: V) -> Self {
        Self::at(sensor_id, Utc::now(), val)
    }

    pub fn at(sensor_id: impl Into<String>, ts: DateTime<Utc>, val: V) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            ts,
            val,
        }
    }
}

/// Source adapter sampling a [`Sensor`].
pub struct SensorSource<S> {
    sensor: S,
}

impl<S: Sensor> SensorSource<S> {
    pub fn new(sensor: S) -> Self {
        Self { sensor }
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }
}

impl<S: Sensor + 'static> Source for SensorSource<S> {
    type Item = SensorEvent;

    fn pull(&mut self) -> Pull<SensorEvent> {
        match self.sensor.sample() {
            Ok(Some(val)) => Pull::Next(SensorEvent::new(self.sensor.sensor_id(), val)),
            Ok(None) => Pull::Exhausted,
            Err(e) => Pull::Failed(StreamError::from(e)),
        }
    }

    fn name(&self) -> String {
        format!("Sensor({})", self.sensor.sensor_id())
    }
}

pub fn sensor_source<S: Sensor + 'static>(sensor: S) -> Rc<SourceThing<SensorSource<S>>> {
    SourceThing::new(SensorSource::new(sensor))
}
