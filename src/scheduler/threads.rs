//! Worker-thread strategies: blocking sources and private event loops.

use super::active::CancelHandle;
use super::bridge::RemoteOutput;
use super::{Cancel, EventLoopSource, Scheduler};
use crate::error::{FlowError, Result};
use crate::graph::{OutputThing, Upstream};
use crate::sources::{Pull, Source, SourceThing};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

impl Scheduler {
    /// Pull `thing`'s source on a dedicated worker thread every `interval`.
    ///
    /// The source moves to the worker; events are relayed back and
    /// dispatched on the loop. Canceling, or the output losing its last
    /// connection, asks the worker to stop at its next wait.
    pub fn schedule_periodic_on_separate_thread<S>(
        &self,
        thing: &Rc<SourceThing<S>>,
        interval: Duration,
    ) -> Result<Cancel>
    where
        S: Source + Send,
        S::Item: Send,
    {
        let output: &OutputThing<S::Item> = Upstream::output(thing);
        let id = output.id();
        let name = output.name().to_string();
        let generation = self.inner.active.borrow_mut().reserve(id, &name)?;
        let source = thing.detach_source().ok_or_else(|| {
            FlowError::schedule(format!("{} has no source left to run on a worker thread", name))
        })?;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let request_stop: Rc<dyn Fn()> = Rc::new(move || {
            // a full channel already carries a stop request
            let _ = stop_tx.try_send(());
        });
        let (remote, relay_rx) = RemoteOutput::channel(name.clone());
        self.spawn_relay(output.clone(), relay_rx, id, generation, Rc::clone(&request_stop));
        self.inner.active.borrow_mut().insert(
            id,
            name.clone(),
            generation,
            CancelHandle::Hook(request_stop),
        );

        let thread_name = self.thread_name(&name);
        self.call_soon(move |scheduler| {
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_blocking_source(source, interval, stop_rx, remote))?;
            scheduler.register_worker(thread_name, handle);
            Ok(())
        });
        tracing::info!("Scheduled {} on a worker thread every {:?}", name, interval);
        Ok(Cancel::new(self.downgrade(), id, name))
    }

    /// Run `source`'s private event loop on a dedicated worker thread,
    /// relaying its events to `output` on this loop.
    pub fn schedule_on_private_event_loop<E>(
        &self,
        output: &OutputThing<E::Event>,
        mut source: E,
    ) -> Result<Cancel>
    where
        E: EventLoopSource,
    {
        let id = output.id();
        let name = output.name().to_string();
        let generation = self.inner.active.borrow_mut().reserve(id, &name)?;

        let stop_hook = source.stop_hook();
        let request_stop: Rc<dyn Fn()> = {
            let stop_hook = Arc::clone(&stop_hook);
            Rc::new(move || stop_hook())
        };
        let (remote, relay_rx) = RemoteOutput::channel(name.clone());
        self.spawn_relay(output.clone(), relay_rx, id, generation, Rc::clone(&request_stop));
        self.inner.active.borrow_mut().insert(
            id,
            name.clone(),
            generation,
            CancelHandle::Hook(request_stop),
        );

        let thread_name = self.thread_name(&name);
        self.call_soon(move |scheduler| {
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    tracing::info!("Private event loop for {} started", source.name());
                    let result = source.observe_event_loop(&remote);
                    if let Err(err) = &result {
                        tracing::error!("Private event loop for {} failed: {:#}", source.name(), err);
                    }
                    remote.finish(result);
                })?;
            scheduler.register_worker(thread_name, handle);
            Ok(())
        });
        Ok(Cancel::new(self.downgrade(), id, name))
    }
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    match stop.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}

/// Worker body: pull, relay, wait out the rest of the interval.
fn run_blocking_source<S>(
    mut source: S,
    interval: Duration,
    stop: Receiver<()>,
    output: RemoteOutput<S::Item>,
) where
    S: Source,
    S::Item: Send,
{
    tracing::debug!("Worker for {} started", output.name());
    while !stop_requested(&stop) {
        let started = Instant::now();
        match source.pull() {
            Pull::Next(x) => {
                if output.dispatch_next(x).is_err() {
                    break;
                }
            }
            Pull::Exhausted => {
                source.close();
                let _ = output.dispatch_completed();
                break;
            }
            Pull::Failed(err) => {
                tracing::warn!("Source {} failed: {}", output.name(), err);
                source.close();
                let _ = output.dispatch_error(err);
                break;
            }
        }
        let remaining = interval.saturating_sub(started.elapsed());
        match stop.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    tracing::debug!("Worker for {} exiting", output.name());
    output.finish(Ok(()));
}
