//! Tick-based scheduler for constrained targets.
//!
//! Time is an integer tick count that wraps at `clock_wrap`. Tasks sharing a
//! period share an interval; a new interval is phase-aligned with an
//! existing one whose period divides (or is divided by) its own, so their
//! wakeups coincide.
//!
//! Due tasks come out in ascending period order, then in the order they
//! were added to their interval.

use crate::error::{FlowError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct Interval<K> {
    period: u32,
    tasks: Vec<K>,
    next_due: i64,
}

#[derive(Debug, Clone)]
pub struct TickScheduler<K> {
    clock_wrap: u32,
    now: i64,
    intervals: BTreeMap<u32, Interval<K>>,
}

impl<K: PartialEq + Clone> TickScheduler<K> {
    pub fn new(clock_wrap: u32) -> Result<Self> {
        if clock_wrap < 2 {
            return Err(FlowError::invalid_argument(format!(
                "clock wrap must be at least 2 ticks, got {}",
                clock_wrap
            )));
        }
        Ok(Self {
            clock_wrap,
            now: 0,
            intervals: BTreeMap::new(),
        })
    }

    pub fn clock_wrap(&self) -> u32 {
        self.clock_wrap
    }

    /// Current time in ticks, always below `clock_wrap`
    pub fn now(&self) -> i64 {
        self.now
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.intervals.values().map(|i| i.tasks.len()).sum()
    }

    /// Add `task` to run every `period` ticks.
    pub fn add_task(&mut self, task: K, period: u32) -> Result<()> {
        if period == 0 || period >= self.clock_wrap {
            return Err(FlowError::invalid_argument(format!(
                "period must be between 1 and {} ticks, got {}",
                self.clock_wrap - 1,
                period
            )));
        }
        if let Some(interval) = self.intervals.get_mut(&period) {
            interval.tasks.push(task);
            return Ok(());
        }
        let next_due = self
            .intervals
            .values()
            .find(|i| i.period % period == 0 || period % i.period == 0)
            .map(|i| i.next_due)
            .unwrap_or(self.now);
        self.intervals.insert(
            period,
            Interval {
                period,
                tasks: vec![task],
                next_due,
            },
        );
        Ok(())
    }

    /// Remove the first occurrence of `task`. An interval left without tasks
    /// is dropped. Returns false if the task was not scheduled.
    pub fn remove_task(&mut self, task: &K) -> bool {
        let found = self.intervals.iter_mut().find_map(|(period, interval)| {
            let pos = interval.tasks.iter().position(|t| t == task)?;
            interval.tasks.remove(pos);
            Some((*period, interval.tasks.is_empty()))
        });
        match found {
            Some((period, true)) => {
                self.intervals.remove(&period);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Tasks whose interval is due. Each due interval moves to its next
    /// due tick.
    pub fn get_due_tasks(&mut self) -> Vec<K> {
        let now = self.now;
        let mut due = Vec::new();
        for interval in self.intervals.values_mut() {
            if interval.next_due <= now {
                due.extend(interval.tasks.iter().cloned());
                interval.next_due += i64::from(interval.period);
            }
        }
        due
    }

    /// Move the clock forward, re-basing due ticks when it wraps.
    pub fn advance_time(&mut self, ticks: u32) -> Result<()> {
        if ticks >= self.clock_wrap {
            return Err(FlowError::invalid_argument(format!(
                "cannot advance {} ticks at once with a clock wrap of {}",
                ticks, self.clock_wrap
            )));
        }
        let wrap = i64::from(self.clock_wrap);
        self.now += i64::from(ticks);
        if self.now >= wrap {
            let unwrapped = self.now;
            self.now %= wrap;
            for interval in self.intervals.values_mut() {
                if interval.next_due >= wrap {
                    interval.next_due %= wrap;
                } else {
                    // overdue intervals stay overdue by the same amount
                    interval.next_due = self.now - (unwrapped - interval.next_due);
                }
            }
        }
        Ok(())
    }

    /// Ticks until the earliest interval is due, at most `clock_wrap`.
    pub fn next_sleep_interval(&self) -> u32 {
        self.intervals
            .values()
            .map(|i| (i.next_due - self.now).max(0))
            .fold(i64::from(self.clock_wrap), i64::min) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheduler(wrap: u32) -> TickScheduler<u32> {
        TickScheduler::new(wrap).unwrap()
    }

    #[test]
    fn test_phase_alignment() {
        let mut sched = scheduler(1_048_576);
        sched.add_task(1, 30).unwrap();
        sched.add_task(2, 60).unwrap();
        sched.add_task(3, 24).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![3, 1, 2]);
        assert_eq!(sched.next_sleep_interval(), 24);
        sched.advance_time(24).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![3]);
        assert_eq!(sched.next_sleep_interval(), 6);
        sched.advance_time(6).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![1]);
        assert_eq!(sched.next_sleep_interval(), 18);
        sched.advance_time(18).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![3]);
        assert_eq!(sched.next_sleep_interval(), 12);
        sched.advance_time(12).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![1, 2]);
    }

    #[test]
    fn test_nonzero_sample_time() {
        let mut sched = scheduler(1_048_576);
        sched.add_task(1, 30).unwrap();
        sched.add_task(2, 60).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![1, 2]);
        sched.advance_time(4).unwrap();
        assert_eq!(sched.next_sleep_interval(), 26);
        sched.advance_time(28).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![1]);
        sched.advance_time(1).unwrap();
        assert_eq!(sched.next_sleep_interval(), 27);
        sched.advance_time(27).unwrap();
        assert_eq!(sched.get_due_tasks(), vec![1, 2]);
    }

    #[test]
    fn test_clock_wrap() {
        let mut sched = scheduler(64);
        sched.add_task(1, 8).unwrap();
        sched.add_task(2, 16).unwrap();
        for i in 0..20 {
            let expected = if i % 2 == 0 { vec![1, 2] } else { vec![1] };
            assert_eq!(sched.get_due_tasks(), expected, "iteration {}", i);
            assert_eq!(sched.next_sleep_interval(), 8, "iteration {}", i);
            sched.advance_time(8).unwrap();
        }
    }

    #[test]
    fn test_overdue_across_wrap() {
        let mut sched = scheduler(32);
        sched.add_task(1, 8).unwrap();
        for i in 0..10 {
            assert_eq!(sched.get_due_tasks(), vec![1]);
            let sleep = sched.next_sleep_interval();
            assert_eq!(sleep, if i == 0 { 8 } else { 6 }, "iteration {}", i);
            // two ticks late every time
            sched.advance_time(sleep + 2).unwrap();
        }
    }

    #[test]
    fn test_add_task_after_start() {
        let mut sched = scheduler(1_048_576);
        sched.add_task(1, 4).unwrap();
        sched.add_task(2, 8).unwrap();
        for i in 0..4 {
            let expected = if i % 2 == 0 { vec![1, 2] } else { vec![1] };
            assert_eq!(sched.get_due_tasks(), expected);
            let sleep = sched.next_sleep_interval();
            sched.advance_time(sleep).unwrap();
        }
        sched.add_task(3, 4).unwrap();
        for i in 0..4 {
            let expected = if i % 2 == 0 { vec![1, 3, 2] } else { vec![1, 3] };
            assert_eq!(sched.get_due_tasks(), expected);
            let sleep = sched.next_sleep_interval();
            sched.advance_time(sleep).unwrap();
        }
    }

    #[test]
    fn test_remove_task() {
        let mut sched = scheduler(1_048_576);
        sched.add_task(1, 4).unwrap();
        sched.add_task(2, 8).unwrap();
        for _ in 0..4 {
            sched.get_due_tasks();
            let sleep = sched.next_sleep_interval();
            sched.advance_time(sleep).unwrap();
        }
        assert!(sched.remove_task(&1));
        assert!(!sched.remove_task(&1));
        for _ in 0..4 {
            assert_eq!(sched.get_due_tasks(), vec![2]);
            let sleep = sched.next_sleep_interval();
            sched.advance_time(sleep).unwrap();
        }
        assert!(sched.remove_task(&2));
        assert!(sched.is_empty());
        assert_eq!(sched.next_sleep_interval(), 1_048_576);
    }

    #[test]
    fn test_non_integer_tasks() {
        let mut sched: TickScheduler<String> = TickScheduler::new(1000).unwrap();
        sched.add_task("lux".to_string(), 4).unwrap();
        sched.add_task("temp".to_string(), 8).unwrap();
        assert_eq!(sched.get_due_tasks(), vec!["lux", "temp"]);
        assert_eq!(sched.task_count(), 2);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let mut sched = scheduler(64);
        assert!(matches!(sched.add_task(1, 0), Err(FlowError::InvalidArgument(_))));
        assert!(matches!(sched.add_task(1, 64), Err(FlowError::InvalidArgument(_))));
        assert!(matches!(sched.advance_time(64), Err(FlowError::InvalidArgument(_))));
        assert!(TickScheduler::<u32>::new(1).is_err());
    }

    proptest! {
        #[test]
        fn prop_now_stays_below_wrap(wrap in 2u32..500, steps in prop::collection::vec(0u32..1000, 1..50)) {
            let mut sched = scheduler(wrap);
            sched.add_task(1, 1).unwrap();
            for step in steps {
                sched.advance_time(step % wrap).unwrap();
                prop_assert!(sched.now() >= 0 && sched.now() < i64::from(wrap));
                prop_assert!(sched.next_sleep_interval() <= wrap);
            }
        }

        #[test]
        fn prop_every_task_runs_on_its_period(period in 1u32..50) {
            let mut sched = scheduler(10_000);
            sched.add_task(7, period).unwrap();
            let mut runs = 0;
            for _ in 0..(period * 5) {
                if !sched.get_due_tasks().is_empty() {
                    runs += 1;
                }
                sched.advance_time(1).unwrap();
            }
            prop_assert_eq!(runs, 5);
        }
    }
}
