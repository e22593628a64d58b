//! Benchmarks for event dispatch
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::cell::Cell;
use std::rc::Rc;
use thingflow::filters::{sliding_mean, PeriodicMedian};
use thingflow::scheduler::TickScheduler;
use thingflow::{FlowExt, OutputThing, Upstream};

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for consumers in [1, 8, 64].iter() {
        group.throughput(Throughput::Elements(*consumers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(consumers), consumers, |b, &consumers| {
            let src = OutputThing::new("src");
            let total = Rc::new(Cell::new(0.0));
            for _ in 0..consumers {
                let total = Rc::clone(&total);
                src.connect_fn(move |x: f64| {
                    total.set(total.get() + x);
                    Ok(())
                })
                .unwrap();
            }
            b.iter(|| src.dispatch_next(black_box(1.5)).unwrap());
        });
    }

    group.finish();
}

fn bench_transducer_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("transducer_chain");
    group.throughput(Throughput::Elements(1));

    group.bench_function("sliding_mean_then_median", |b| {
        let src = OutputThing::new("src");
        let tail = src
            .transduce(sliding_mean::<f64>(16).unwrap())
            .unwrap()
            .transduce(PeriodicMedian::<f64>::new(5).unwrap())
            .unwrap();
        tail.output().connect_fn(|x: f64| {
            black_box(x);
            Ok(())
        })
        .unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            src.dispatch_next((i % 97) as f64).unwrap();
        });
    });

    group.finish();
}

fn bench_tick_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_scheduler");

    for tasks in [4u32, 32].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(tasks), tasks, |b, &tasks| {
            let mut ticks = TickScheduler::new(65535).unwrap();
            for k in 0..tasks {
                ticks.add_task(k, (k % 8 + 1) * 10).unwrap();
            }
            b.iter(|| {
                let due = ticks.get_due_tasks();
                black_box(due);
                let sleep = ticks.next_sleep_interval();
                ticks.advance_time(sleep).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fan_out, bench_transducer_chain, bench_tick_scheduler);
criterion_main!(benches);
