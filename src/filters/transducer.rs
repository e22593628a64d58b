//! Transducers: stateful per-event transforms (Mealy machines).
//!
//! A [`Transducer`] is adapted into the transform-or-drop filter protocol by
//! [`transduce`]: `step` becomes the per-event filter and `complete` the
//! final flush.

use crate::error::{FlowError, Result};
use crate::graph::input::short_type_name;
use crate::graph::{Event, Upstream, Xform, XformOrDropFilter};
use crate::sources::SensorEvent;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;

pub trait Transducer: 'static {
    type Input: Event;
    type Output: Event;

    /// `None` means no output for this input
    fn step(&mut self, x: Self::Input) -> Option<Self::Output>;

    /// Optional final value once the stream ends
    fn complete(&mut self) -> Option<Self::Output> {
        None
    }

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// [`Xform`] adapter over a [`Transducer`]
pub struct Transduce<D>(D);

impl<D: Transducer> Xform for Transduce<D> {
    type Input = D::Input;
    type Output = D::Output;

    fn filter(&mut self, x: D::Input) -> anyhow::Result<Option<D::Output>> {
        Ok(self.0.step(x))
    }

    fn complete(&mut self) -> anyhow::Result<Option<D::Output>> {
        Ok(self.0.complete())
    }

    fn name(&self) -> String {
        format!("transduce({})", self.0.name())
    }
}

/// Run `transducer` over the events of `upstream`.
pub fn transduce<D, U>(upstream: &U, transducer: D) -> Result<Rc<XformOrDropFilter<Transduce<D>>>>
where
    D: Transducer,
    U: Upstream<D::Input> + ?Sized,
{
    XformOrDropFilter::new(upstream, Transduce(transducer))
}

/// An event carrying a numeric reading.
pub trait Reading: Event {
    fn reading(&self) -> f64;

    /// Same event with the reading replaced
    fn with_reading(&self, val: f64) -> Self;
}

impl Reading for f64 {
    fn reading(&self) -> f64 {
        *self
    }

    fn with_reading(&self, val: f64) -> Self {
        val
    }
}

impl Reading for SensorEvent<f64> {
    fn reading(&self) -> f64 {
        self.val
    }

    fn with_reading(&self, val: f64) -> Self {
        SensorEvent::at(self.sensor_id.clone(), self.ts, val)
    }
}

/// What a [`SlidingWindow`] computes.
///
/// Each case gets the accumulated state and returns the output event along
/// with the new state. `total` is the window size after the new event.
pub trait WindowPolicy: 'static {
    type Event: Event;
    type State;

    fn first_event(&self, new: &Self::Event) -> (Self::Event, Self::State);

    fn add_event(&self, state: Self::State, new: &Self::Event, total: usize) -> (Self::Event, Self::State);

    fn replace_event(
        &self,
        state: Self::State,
        new: &Self::Event,
        old: &Self::Event,
        total: usize,
    ) -> (Self::Event, Self::State);

    fn name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// Transducer over the last `capacity` events.
pub struct SlidingWindow<P: WindowPolicy> {
    capacity: usize,
    history: VecDeque<P::Event>,
    state: Option<P::State>,
    policy: P,
}

impl<P: WindowPolicy> SlidingWindow<P> {
    pub fn new(capacity: usize, policy: P) -> Result<Self> {
        if capacity == 0 {
            return Err(FlowError::invalid_argument(
                "sliding window needs room for at least one event",
            ));
        }
        Ok(Self {
            capacity,
            history: VecDeque::with_capacity(capacity),
            state: None,
            policy,
        })
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

impl<P: WindowPolicy> Transducer for SlidingWindow<P> {
    type Input = P::Event;
    type Output = P::Event;

    fn step(&mut self, x: P::Event) -> Option<P::Event> {
        let (out, state) = match self.state.take() {
            None => self.policy.first_event(&x),
            Some(state) if self.history.len() < self.capacity => {
                self.policy.add_event(state, &x, self.history.len() + 1)
            }
            Some(state) => match self.history.pop_front() {
                Some(old) => self.policy.replace_event(state, &x, &old, self.capacity),
                None => self.policy.first_event(&x),
            },
        };
        self.history.push_back(x);
        self.state = Some(state);
        Some(out)
    }

    fn name(&self) -> String {
        format!("{}({})", self.policy.name(), self.capacity)
    }
}

/// Running sum, emitted as the mean of the window
pub struct MeanPolicy<E>(PhantomData<fn() -> E>);

impl<E> Default for MeanPolicy<E> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<E: Reading> WindowPolicy for MeanPolicy<E> {
    type Event = E;
    type State = f64;

    fn first_event(&self, new: &E) -> (E, f64) {
        (new.clone(), new.reading())
    }

    fn add_event(&self, sum: f64, new: &E, total: usize) -> (E, f64) {
        let sum = sum + new.reading();
        (new.with_reading(sum / total as f64), sum)
    }

    fn replace_event(&self, sum: f64, new: &E, old: &E, total: usize) -> (E, f64) {
        let sum = sum + new.reading() - old.reading();
        (new.with_reading(sum / total as f64), sum)
    }

    fn name(&self) -> String {
        "SlidingMean".to_string()
    }
}

pub type SlidingMean<E> = SlidingWindow<MeanPolicy<E>>;

/// Mean of the last `capacity` readings
pub fn sliding_mean<E: Reading>(capacity: usize) -> Result<SlidingMean<E>> {
    SlidingWindow::new(capacity, MeanPolicy::default())
}

/// Median of a non-empty slice; the mean of the middle pair for even sizes.
pub(crate) fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Emits the median of every `period` readings. A partial batch left when
/// the stream ends produces one final event.
pub struct PeriodicMedian<E> {
    period: usize,
    samples: Vec<f64>,
    last_event: Option<E>,
}

impl<E: Reading> PeriodicMedian<E> {
    pub fn new(period: usize) -> Result<Self> {
        if period == 0 {
            return Err(FlowError::invalid_argument("median period must be positive"));
        }
        Ok(Self {
            period,
            samples: Vec::with_capacity(period),
            last_event: None,
        })
    }
}

impl<E: Reading> Transducer for PeriodicMedian<E> {
    type Input = E;
    type Output = E;

    fn step(&mut self, x: E) -> Option<E> {
        self.samples.push(x.reading());
        if self.samples.len() == self.period {
            let val = median(&self.samples);
            self.samples.clear();
            self.last_event = None;
            Some(x.with_reading(val))
        } else {
            self.last_event = Some(x);
            None
        }
    }

    fn complete(&mut self) -> Option<E> {
        if self.samples.is_empty() {
            return None;
        }
        let val = median(&self.samples);
        self.samples.clear();
        self.last_event.take().map(|e| e.with_reading(val))
    }

    fn name(&self) -> String {
        format!("PeriodicMedian({})", self.period)
    }
}
