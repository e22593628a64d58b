//! Run loop for the tick scheduler.
//!
//! Single-threaded and blocking: sample whatever is due, account for the
//! time the sampling took, sleep until the next interval, repeat. Exits once
//! every thing has lost its downstream connections.

use super::tick::TickScheduler;
use super::DirectOutputThing;
use crate::config::TickSettings;
use crate::error::{FlowError, Result};
use crate::graph::{OutputThing, ThingId, Upstream};
use crate::sources::{sensor_source, Sensor, SensorEvent};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Millisecond clock used by [`TickRunner`].
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

impl<C: Clock + ?Sized> Clock for Rc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms)
    }
}

/// Wall-clock time since construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Deterministic clock: sleeping advances it instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
    sleeps: RefCell<Vec<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate time spent working
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    /// Every sleep requested so far, in milliseconds
    pub fn sleeps(&self) -> Vec<u64> {
        self.sleeps.borrow().clone()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.sleeps.borrow_mut().push(ms);
        self.advance(ms);
    }
}

pub struct TickRunner<C: Clock = SystemClock> {
    ticks: TickScheduler<ThingId>,
    things: BTreeMap<ThingId, Rc<dyn DirectOutputThing>>,
    tick_ms: u64,
    clock: C,
}

impl TickRunner<SystemClock> {
    pub fn from_settings(settings: &TickSettings) -> Result<Self> {
        Self::with_clock(settings, SystemClock::default())
    }
}

impl<C: Clock> TickRunner<C> {
    pub fn with_clock(settings: &TickSettings, clock: C) -> Result<Self> {
        if settings.tick_ms == 0 {
            return Err(FlowError::invalid_argument("tick_ms must be positive"));
        }
        Ok(Self {
            ticks: TickScheduler::new(settings.clock_wrap)?,
            things: BTreeMap::new(),
            tick_ms: u64::from(settings.tick_ms),
            clock,
        })
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn scheduled(&self) -> usize {
        self.things.len()
    }

    fn to_ticks(&self, interval: Duration) -> Result<u32> {
        let ticks = (interval.as_millis() as f64 / self.tick_ms as f64).round();
        if ticks < 1.0 || ticks > f64::from(u32::MAX) {
            return Err(FlowError::invalid_argument(format!(
                "interval {:?} is not a positive number of {}ms ticks",
                interval, self.tick_ms
            )));
        }
        Ok(ticks as u32)
    }

    /// Sample `thing` every `interval`, rounded to whole ticks.
    pub fn schedule_periodic<D>(&mut self, thing: Rc<D>, interval: Duration) -> Result<ThingId>
    where
        D: DirectOutputThing,
    {
        let id = thing.thing_id();
        if self.things.contains_key(&id) {
            return Err(FlowError::schedule(format!(
                "{} ({}) already has an active schedule",
                thing.name(),
                id
            )));
        }
        let ticks = self.to_ticks(interval)?;
        self.ticks.add_task(id, ticks)?;
        self.things.insert(id, thing);
        Ok(id)
    }

    pub fn schedule_sensor<S, F>(&mut self, sensor: S, interval: Duration, compose: F) -> Result<ThingId>
    where
        S: Sensor + 'static,
        F: FnOnce(&OutputThing<SensorEvent>) -> Result<()>,
    {
        let thing = sensor_source(sensor);
        compose(Upstream::output(&thing))?;
        self.schedule_periodic(thing, interval)
    }

    pub fn cancel(&mut self, id: ThingId) -> Result<()> {
        if self.things.remove(&id).is_none() {
            return Err(FlowError::schedule(format!(
                "Attempt to de-schedule {}, which does not have an active schedule",
                id
            )));
        }
        self.ticks.remove_task(&id);
        Ok(())
    }

    fn advance_ms(&mut self, ms: u64) -> Result<()> {
        let ticks = (ms + self.tick_ms / 2) / self.tick_ms;
        self.advance_ticks(ticks)
    }

    // in steps the tick scheduler accepts
    fn advance_ticks(&mut self, mut ticks: u64) -> Result<()> {
        let max_step = u64::from(self.ticks.clock_wrap() - 1);
        while ticks > 0 {
            let step = ticks.min(max_step);
            self.ticks.advance_time(step as u32)?;
            ticks -= step;
        }
        Ok(())
    }

    /// Run until nothing is scheduled. A fatal error from `observe` ends the
    /// run and is returned wrapped in [`FlowError::Aborted`].
    pub fn run_forever(&mut self) -> Result<()> {
        if self.ticks.is_empty() {
            tracing::warn!("run_forever called with nothing scheduled");
            return Ok(());
        }
        loop {
            let due = self.ticks.get_due_tasks();
            let start = self.clock.now_ms();
            for id in due {
                let Some(thing) = self.things.get(&id).cloned() else {
                    continue;
                };
                thing
                    .observe()
                    .map_err(|e| FlowError::Aborted(Box::new(e)))?;
                if !thing.has_connections() {
                    tracing::debug!("{} has no more connections, descheduled", thing.name());
                    self.things.remove(&id);
                    self.ticks.remove_task(&id);
                }
            }
            if self.ticks.is_empty() {
                tracing::info!("No more active schedules, exiting tick loop");
                return Ok(());
            }
            let end = self.clock.now_ms();
            if end > start {
                self.advance_ms(end - start)?;
            }
            let sleep = self.ticks.next_sleep_interval();
            self.clock.sleep_ms(u64::from(sleep) * self.tick_ms);
            let now = self.clock.now_ms();
            if now >= end {
                self.advance_ms(now - end)?;
            } else {
                // clock went backwards, trust the requested sleep
                self.advance_ticks(u64::from(sleep))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::from_list;

    fn settings() -> TickSettings {
        TickSettings {
            clock_wrap: 65535,
            tick_ms: 10,
        }
    }

    fn record<T: crate::graph::Event>(output: &OutputThing<T>, log: &Rc<RefCell<Vec<String>>>, tag: &'static str) {
        let log = Rc::clone(log);
        output
            .connect_fn(move |x: T| {
                log.borrow_mut().push(format!("{}{:?}", tag, x));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sleeps_between_samples() {
        let clock = Rc::new(ManualClock::new());
        let mut runner = TickRunner::with_clock(&settings(), Rc::clone(&clock)).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let src = from_list(vec![1, 2, 3]);
        record(src.output(), &log, "");
        runner
            .schedule_periodic(Rc::clone(&src), Duration::from_millis(100))
            .unwrap();
        runner.run_forever().unwrap();
        assert_eq!(*log.borrow(), vec!["1", "2", "3"]);
        assert_eq!(clock.sleeps(), vec![100, 100, 100]);
        assert_eq!(runner.scheduled(), 0);
    }

    #[test]
    fn test_interleaves_periods() {
        let clock = Rc::new(ManualClock::new());
        let mut runner = TickRunner::with_clock(&settings(), Rc::clone(&clock)).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let fast = from_list(vec![1, 2, 3]);
        let slow = from_list(vec![10, 20]);
        record(fast.output(), &log, "f");
        record(slow.output(), &log, "s");
        runner
            .schedule_periodic(Rc::clone(&slow), Duration::from_millis(200))
            .unwrap();
        runner
            .schedule_periodic(Rc::clone(&fast), Duration::from_millis(100))
            .unwrap();
        runner.run_forever().unwrap();
        assert_eq!(*log.borrow(), vec!["f1", "s10", "f2", "f3", "s20"]);
    }

    #[test]
    fn test_work_time_is_subtracted_from_sleep() {
        struct Slow {
            output: OutputThing<u32>,
            clock: Rc<ManualClock>,
            left: Cell<u32>,
        }

        impl DirectOutputThing for Slow {
            fn thing_id(&self) -> ThingId {
                self.output.id()
            }

            fn name(&self) -> String {
                "slow".to_string()
            }

            fn observe(&self) -> Result<()> {
                self.clock.advance(30);
                match self.left.get() {
                    0 => self.output.dispatch_completed(),
                    n => {
                        self.left.set(n - 1);
                        self.output.dispatch_next(n)
                    }
                }
            }

            fn has_connections(&self) -> bool {
                self.output.has_connections()
            }
        }

        let clock = Rc::new(ManualClock::new());
        let mut runner = TickRunner::with_clock(&settings(), Rc::clone(&clock)).unwrap();
        let slow = Rc::new(Slow {
            output: OutputThing::new("slow"),
            clock: Rc::clone(&clock),
            left: Cell::new(2),
        });
        slow.output.connect_fn(|_x: u32| Ok(())).unwrap();
        runner
            .schedule_periodic(slow, Duration::from_millis(100))
            .unwrap();
        runner.run_forever().unwrap();
        assert_eq!(clock.sleeps(), vec![70, 70]);
    }

    #[test]
    fn test_invalid_intervals() {
        let mut runner = TickRunner::with_clock(&settings(), ManualClock::new()).unwrap();
        let src = from_list(vec![1]);
        let err = runner
            .schedule_periodic(Rc::clone(&src), Duration::from_millis(2))
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidArgument(_)));
        runner
            .schedule_periodic(Rc::clone(&src), Duration::from_millis(20))
            .unwrap();
        assert!(matches!(
            runner.schedule_periodic(src, Duration::from_millis(20)),
            Err(FlowError::Schedule(_))
        ));
    }

    #[test]
    fn test_cancel() {
        let mut runner = TickRunner::with_clock(&settings(), ManualClock::new()).unwrap();
        let id = runner
            .schedule_periodic(from_list(vec![1]), Duration::from_millis(20))
            .unwrap();
        runner.cancel(id).unwrap();
        assert!(runner.cancel(id).is_err());
        runner.run_forever().unwrap();
    }

    #[test]
    fn test_fatal_observe_aborts() {
        let mut runner = TickRunner::with_clock(&settings(), ManualClock::new()).unwrap();
        let src = from_list(vec![1]);
        src.output()
            .connect_fn(|_x: i32| Err(anyhow::anyhow!("sink failed")))
            .unwrap();
        runner
            .schedule_periodic(src, Duration::from_millis(20))
            .unwrap();
        let err = runner.run_forever().unwrap_err();
        assert!(matches!(err.root(), FlowError::Dispatch { .. }));
    }
}
