//! Sinks whose work blocks, run on a dedicated worker thread.
//!
//! The loop side is a [`BlockingInputThing`]: its handlers only enqueue.
//! The worker drains the queue in order and exits once every input port
//! saw `on_completed` or `on_error`, or when its schedule is canceled.

use super::active::CancelHandle;
use super::{Cancel, LoopHandle, Scheduler};
use crate::error::{FlowError, HandlerResult, Result, StreamError};
use crate::graph::input::short_type_name;
use crate::graph::{Event, InputThing, PortHandlers, ThingId, DEFAULT_PORT};
use crossbeam_channel::{Receiver, Sender};
use std::rc::Rc;

/// Consumer that may block, for example writing to a database.
pub trait BlockingSink: Send + 'static {
    type Item: Event + Send;

    fn name(&self) -> String {
        short_type_name::<Self>()
    }

    fn on_next(&mut self, port: &str, x: Self::Item) -> anyhow::Result<()>;

    fn on_completed(&mut self, _port: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&mut self, port: &str, err: StreamError) -> anyhow::Result<()> {
        tracing::error!("{} received error on port {}: {}", self.name(), port, err);
        Ok(())
    }

    /// Called on the worker thread after the last event
    fn close(&mut self) {}
}

enum SinkRequest<T> {
    Next { port: String, value: T },
    Completed { port: String },
    Error { port: String, error: StreamError },
    Stop,
}

/// Loop-side half of a scheduled [`BlockingSink`].
#[derive(Debug)]
pub struct BlockingInputThing<T: Event + Send> {
    id: ThingId,
    name: String,
    ports: Vec<String>,
    queue: Sender<SinkRequest<T>>,
    schedule: Cancel,
}

impl<T: Event + Send> BlockingInputThing<T> {
    pub fn thing_id(&self) -> ThingId {
        self.id
    }

    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    /// Disposer for the worker's schedule
    pub fn schedule(&self) -> &Cancel {
        &self.schedule
    }

    /// Deschedule the sink. The worker exits after the requests already
    /// queued; one waiting on an empty queue wakes up at once.
    ///
    /// Fails with [`FlowError::Schedule`] once the sink is no longer active.
    pub fn cancel(&self) -> Result<()> {
        self.schedule.cancel()
    }

    fn enqueue(&self, request: SinkRequest<T>) -> HandlerResult {
        if self.queue.send(request).is_err() {
            tracing::debug!("{} is no longer accepting events", self.name);
        }
        Ok(())
    }
}

impl<T: Event + Send> InputThing<T> for BlockingInputThing<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn on_next(&self, x: T) -> HandlerResult {
        self.enqueue(SinkRequest::Next {
            port: DEFAULT_PORT.to_string(),
            value: x,
        })
    }

    fn on_completed(&self) -> HandlerResult {
        self.enqueue(SinkRequest::Completed {
            port: DEFAULT_PORT.to_string(),
        })
    }

    fn on_error(&self, err: StreamError) -> HandlerResult {
        self.enqueue(SinkRequest::Error {
            port: DEFAULT_PORT.to_string(),
            error: err,
        })
    }

    fn port_handlers(self: Rc<Self>, port: &str) -> Option<PortHandlers<T>> {
        if !self.ports.iter().any(|p| p == port) {
            return None;
        }
        let (next, completed, error) = (Rc::clone(&self), Rc::clone(&self), self);
        let (next_port, completed_port, error_port) =
            (port.to_string(), port.to_string(), port.to_string());
        Some(PortHandlers::new(
            move |x| {
                next.enqueue(SinkRequest::Next {
                    port: next_port.clone(),
                    value: x,
                })
            },
            move || {
                completed.enqueue(SinkRequest::Completed {
                    port: completed_port.clone(),
                })
            },
            move |e| {
                error.enqueue(SinkRequest::Error {
                    port: error_port.clone(),
                    error: e,
                })
            },
        ))
    }
}

impl Scheduler {
    /// Start `sink` on a worker thread and return the input thing to
    /// connect upstream things to. `ports` lists its input ports.
    pub fn schedule_blocking_sink<K>(&self, sink: K, ports: &[&str]) -> Result<Rc<BlockingInputThing<K::Item>>>
    where
        K: BlockingSink,
    {
        if ports.is_empty() {
            return Err(FlowError::invalid_argument(format!(
                "{} needs at least one input port",
                sink.name()
            )));
        }
        let id = ThingId::next();
        let name = sink.name();
        let generation = self.inner.active.borrow_mut().reserve(id, &name)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let thing = Rc::new(BlockingInputThing {
            id,
            name: name.clone(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
            queue: tx.clone(),
            schedule: Cancel::new(self.downgrade(), id, name.clone()),
        });
        self.inner.active.borrow_mut().insert(
            id,
            name.clone(),
            generation,
            CancelHandle::Hook(Rc::new(move || {
                if tx.send(SinkRequest::Stop).is_err() {
                    tracing::debug!("Blocking sink worker already exited");
                }
            })),
        );

        let handle = self.handle();
        let port_count = ports.len();
        let thread_name = self.thread_name(&name);
        self.call_soon(move |scheduler| {
            let worker = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_blocking_sink(sink, rx, port_count, handle, id, generation))?;
            scheduler.register_worker(thread_name, worker);
            Ok(())
        });
        Ok(thing)
    }
}

fn drain_queue<K: BlockingSink>(
    sink: &mut K,
    queue: &Receiver<SinkRequest<K::Item>>,
    port_count: usize,
) -> anyhow::Result<()> {
    let mut closed = 0;
    while closed < port_count {
        match queue.recv() {
            Ok(SinkRequest::Next { port, value }) => sink.on_next(&port, value)?,
            Ok(SinkRequest::Completed { port }) => {
                sink.on_completed(&port)?;
                closed += 1;
            }
            Ok(SinkRequest::Error { port, error }) => {
                sink.on_error(&port, error)?;
                closed += 1;
            }
            Ok(SinkRequest::Stop) | Err(_) => return Ok(()),
        }
    }
    tracing::info!("All ports of {} closed", sink.name());
    Ok(())
}

fn run_blocking_sink<K: BlockingSink>(
    mut sink: K,
    queue: Receiver<SinkRequest<K::Item>>,
    port_count: usize,
    handle: LoopHandle,
    id: ThingId,
    generation: u64,
) {
    let name = sink.name();
    let result = drain_queue(&mut sink, &queue, port_count);
    sink.close();
    let posted = match result {
        Ok(()) => handle.call_soon_threadsafe(move |scheduler| {
            scheduler.finished(id, generation);
            Ok(())
        }),
        Err(err) => {
            tracing::error!("Blocking sink {} failed: {:#}", name, err);
            let thing = name.clone();
            handle.call_soon_threadsafe(move |scheduler| {
                scheduler.abandon(id, generation);
                Err(FlowError::Worker { thing, source: err })
            })
        }
    };
    if posted.is_err() {
        tracing::debug!("Event loop exited before blocking sink {} finished", name);
    }
}
