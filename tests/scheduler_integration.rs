//! Integration tests for the event-loop and tick schedulers
//!
//! These tests validate complete runs:
//! - Sensors sampled on the loop and composed with filters
//! - Shutdown once every source is done
//! - Fatal errors aborting the run
//! - Bridged coroutines holding up the stop
//! - The tick runner on a manual clock

mod common;

use common::builders::SensorBuilder;
use common::{assert_float_eq, Recorder};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use thingflow::config::TickSettings;
use thingflow::filters::sliding_mean;
use thingflow::graph::Disconnect;
use thingflow::scheduler::{Completion, ManualClock};
use thingflow::sources::{from_func, from_iter, from_list};
use thingflow::{FlowError, FlowExt, RuntimeConfig, Scheduler, SensorEvent, TickRunner, Upstream};

#[test]
fn test_sensor_with_sliding_mean() {
    let scheduler = Scheduler::new().unwrap();
    let sink = Recorder::new("sink");
    let sensor = SensorBuilder::new("temp-1")
        .samples(&[20.0, 22.0, 24.0, 26.0])
        .build();
    let sampled = sensor.counter();
    let composed = Rc::clone(&sink);
    scheduler
        .schedule_sensor(sensor, Duration::from_millis(1), move |out| {
            out.transduce(sliding_mean::<SensorEvent>(2)?)?
                .connect_to(composed)?;
            Ok(())
        })
        .unwrap();
    scheduler.run_forever().unwrap();

    let means: Vec<f64> = sink.values().iter().map(|e| e.val).collect();
    assert_eq!(means, vec![20.0, 21.0, 23.0, 25.0]);
    assert!(sink.values().iter().all(|e| e.sensor_id == "temp-1"));
    assert!(sink.completed());
    // four samples plus the one that ended the stream
    assert_eq!(sampled.load(std::sync::atomic::Ordering::SeqCst), 5);
}

#[test]
fn test_sensor_failure_is_a_stream_error() {
    let scheduler = Scheduler::new().unwrap();
    let sink = Recorder::new("sink");
    let sensor = SensorBuilder::new("lux-1")
        .samples(&[1.0])
        .fail_with("i2c timeout")
        .build();
    let composed = Rc::clone(&sink);
    scheduler
        .schedule_sensor(sensor, Duration::from_millis(1), move |out| {
            out.connect(composed)?;
            Ok(())
        })
        .unwrap();
    scheduler.run_forever().unwrap();
    assert_eq!(sink.values().len(), 1);
    assert_eq!(sink.errors(), vec!["i2c timeout".to_string()]);
}

#[test]
fn test_stops_after_last_source() {
    let scheduler = Scheduler::new().unwrap();
    let short = from_list(vec![1, 2]);
    let long = from_iter(0..50);
    let short_sink = Recorder::new("short");
    let long_sink = Recorder::new("long");
    short.connect_to(Rc::clone(&short_sink)).unwrap();
    long.connect_to(Rc::clone(&long_sink)).unwrap();
    scheduler.schedule_recurring(Rc::clone(&short)).unwrap();
    scheduler.schedule_recurring(Rc::clone(&long)).unwrap();
    assert_eq!(scheduler.active_count(), 2);

    scheduler.run_forever().unwrap();

    assert_eq!(short_sink.values(), vec![1, 2]);
    assert_eq!(long_sink.values().len(), 50);
    assert!(short_sink.completed() && long_sink.completed());
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn test_source_descheduled_when_sink_leaves() {
    let scheduler = Scheduler::new().unwrap();
    let pulls = Rc::new(Cell::new(0));
    let counted = Rc::clone(&pulls);
    let src = from_func(0u32, |_| true, |x| x + 1, move |x| {
        counted.set(counted.get() + 1);
        *x
    });
    let token: Rc<RefCell<Option<Disconnect>>> = Rc::new(RefCell::new(None));
    let own_token = Rc::clone(&token);
    let disconnect = src
        .output()
        .connect_fn(move |x: u32| {
            if x == 2 {
                if let Some(token) = own_token.borrow().as_ref() {
                    token.disconnect();
                }
            }
            Ok(())
        })
        .unwrap();
    *token.borrow_mut() = Some(disconnect);
    scheduler
        .schedule_periodic(Rc::clone(&src), Duration::from_millis(1))
        .unwrap();

    scheduler.run_forever().unwrap();

    // no observe after the only sink left
    assert_eq!(pulls.get(), 3);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn test_cancel_then_stop() {
    let scheduler = Scheduler::new().unwrap();
    let forever = from_iter(0u64..);
    let sink = Recorder::new("sink");
    forever.connect_to(Rc::clone(&sink)).unwrap();
    let cancel = scheduler
        .schedule_periodic(Rc::clone(&forever), Duration::from_millis(1))
        .unwrap();
    scheduler.call_later(Duration::from_millis(20), move |_| cancel.cancel());
    scheduler.run_forever().unwrap();
    assert!(!sink.values().is_empty());
    assert!(!sink.completed());
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn test_failing_sink_aborts_run() {
    let scheduler = Scheduler::new().unwrap();
    let src = from_iter(0..10);
    src.output()
        .connect_fn(|x: i32| {
            if x == 3 {
                anyhow::bail!("sink rejected {}", x);
            }
            Ok(())
        })
        .unwrap();
    scheduler.schedule_recurring(Rc::clone(&src)).unwrap();
    let err = scheduler.run_forever().unwrap_err();
    assert!(matches!(err, FlowError::Aborted(_)));
    assert!(matches!(err.root(), FlowError::Dispatch { .. }));
    assert!(err.to_string().contains("sink rejected 3"));
}

#[test]
fn test_coroutine_result_is_delivered() {
    let scheduler = Scheduler::new().unwrap();
    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    scheduler.schedule_coroutine(
        "calibrate",
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(0.25)
        },
        move |_, completion| *slot.borrow_mut() = Some(completion),
    );
    assert_eq!(scheduler.pending_coroutines(), 1);
    scheduler.run_forever().unwrap();
    match result.borrow_mut().take() {
        Some(Completion::Succeeded(offset)) => assert_float_eq(offset, 0.25, 1e-9),
        _ => panic!("coroutine did not succeed"),
    }
    assert_eq!(scheduler.pending_coroutines(), 0);
}

#[test]
fn test_stop_waits_for_failing_coroutine() {
    let scheduler = Scheduler::new().unwrap();
    let src = from_list(vec![1, 2, 3]);
    let sink = Recorder::new("sink");
    src.connect_to(Rc::clone(&sink)).unwrap();
    scheduler.schedule_recurring(Rc::clone(&src)).unwrap();
    scheduler.schedule_coroutine(
        "upload",
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<(), _>(anyhow::anyhow!("upload failed"))
        },
        |_, _| {},
    );

    let err = scheduler.run_forever().unwrap_err();
    // the source finished first, the stop then waited on the upload
    assert!(sink.completed());
    assert!(matches!(err.root(), FlowError::Coroutine { .. }));
}

#[test]
fn test_scheduler_from_config() {
    let config = RuntimeConfig::from_toml_str(
        r#"
        [scheduler]
        worker_thread_prefix = "field-unit"
        "#,
    )
    .unwrap();
    let scheduler = Scheduler::with_settings(config.scheduler).unwrap();
    assert_eq!(scheduler.settings().worker_thread_prefix, "field-unit");
    // nothing scheduled: returns right away
    scheduler.run_forever().unwrap();
}

#[test]
fn test_tick_runner_interleaves_sources() {
    let clock = Rc::new(ManualClock::new());
    let settings = TickSettings {
        clock_wrap: 1000,
        tick_ms: 10,
    };
    let mut runner = TickRunner::with_clock(&settings, Rc::clone(&clock)).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));

    let fast = from_list(vec!["f1", "f2", "f3"]);
    let fast_log = Rc::clone(&log);
    fast.output()
        .connect_fn(move |x: &'static str| {
            fast_log.borrow_mut().push(x.to_string());
            Ok(())
        })
        .unwrap();
    runner
        .schedule_periodic(fast, Duration::from_millis(100))
        .unwrap();

    let sensor = SensorBuilder::new("s").samples(&[10.0, 20.0]).build();
    let sensor_log = Rc::clone(&log);
    runner
        .schedule_sensor(sensor, Duration::from_millis(200), move |out| {
            out.connect_fn(move |e: SensorEvent| {
                sensor_log.borrow_mut().push(format!("s{}", e.val));
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
    assert_eq!(runner.scheduled(), 2);

    runner.run_forever().unwrap();

    assert_eq!(*log.borrow(), vec!["f1", "s10", "f2", "f3", "s20"]);
    assert_eq!(runner.scheduled(), 0);
    assert!(clock.sleeps().iter().all(|ms| ms % 10 == 0));
}

#[test]
fn test_tick_runner_rejects_sub_tick_interval() {
    let mut runner = TickRunner::with_clock(&TickSettings::default(), ManualClock::new()).unwrap();
    let src = from_list(vec![1]);
    let err = runner
        .schedule_periodic(src, Duration::from_millis(1))
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidArgument(_)));
}
