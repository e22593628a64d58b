//! Crossing from worker threads onto the loop thread.
//!
//! [`LoopHandle`] enqueues closures; [`RemoteOutput`] relays events. Both
//! are `Send`, and both deliver on the loop thread in the order they were
//! sent.

use super::Scheduler;
use crate::error::{FlowError, Result, StreamError};
use crate::graph::{Event, OutputThing, ThingId, DEFAULT_PORT};
use std::rc::Rc;
use tokio::sync::mpsc;

pub(crate) type RemoteCall = Box<dyn FnOnce(&Scheduler) -> Result<()> + Send>;

/// Thread-safe handle for running work on a scheduler's loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<RemoteCall>,
}

impl LoopHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RemoteCall>) -> Self {
        Self { tx }
    }

    /// Queue `f` for the loop thread. An error returned by `f` is fatal.
    pub fn call_soon_threadsafe<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Scheduler) -> Result<()> + Send + 'static,
    {
        self.tx
            .send(Box::new(f))
            .map_err(|_| FlowError::schedule("Event loop is no longer running"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) enum Relay<T> {
    Next { port: String, value: T },
    Completed { port: String },
    Error { port: String, error: StreamError },
    Finished,
    Failed(anyhow::Error),
}

/// Worker-side view of an output thing.
///
/// Calls are forwarded to the loop thread and dispatched there. A send
/// fails once the loop has stopped listening, for example after the thing
/// lost all its connections.
pub struct RemoteOutput<T> {
    name: String,
    tx: mpsc::UnboundedSender<Relay<T>>,
}

impl<T> Clone for RemoteOutput<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> RemoteOutput<T> {
    pub(crate) fn channel(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Relay<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatch_next(&self, x: T) -> Result<()> {
        self.dispatch_next_on(DEFAULT_PORT, x)
    }

    pub fn dispatch_next_on(&self, port: &str, x: T) -> Result<()> {
        self.send(Relay::Next {
            port: port.to_string(),
            value: x,
        })
    }

    pub fn dispatch_completed(&self) -> Result<()> {
        self.dispatch_completed_on(DEFAULT_PORT)
    }

    pub fn dispatch_completed_on(&self, port: &str) -> Result<()> {
        self.send(Relay::Completed {
            port: port.to_string(),
        })
    }

    pub fn dispatch_error(&self, err: StreamError) -> Result<()> {
        self.dispatch_error_on(DEFAULT_PORT, err)
    }

    pub fn dispatch_error_on(&self, port: &str, err: StreamError) -> Result<()> {
        self.send(Relay::Error {
            port: port.to_string(),
            error: err,
        })
    }

    /// True once the loop side stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Last message from the worker: how it ended.
    pub(crate) fn finish(&self, result: anyhow::Result<()>) {
        let msg = match result {
            Ok(()) => Relay::Finished,
            Err(err) => Relay::Failed(err),
        };
        if self.tx.send(msg).is_err() {
            tracing::debug!("Loop stopped listening before {} finished", self.name);
        }
    }

    fn send(&self, msg: Relay<T>) -> Result<()> {
        self.tx.send(msg).map_err(|_| {
            FlowError::schedule(format!("{} is no longer relayed to the event loop", self.name))
        })
    }
}

impl Scheduler {
    pub(super) fn spawn_remote_drain(&self, mut rx: mpsc::UnboundedReceiver<RemoteCall>) {
        let weak = self.downgrade();
        self.spawn(async move {
            while let Some(call) = rx.recv().await {
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = call(&scheduler) {
                    scheduler.record_fatal(e);
                }
            }
        });
    }

    /// Dispatch what a worker relays for `(id, generation)` onto `output`.
    ///
    /// `request_stop` is invoked once the output has no connections left.
    /// A worker that disappears without saying how it ended is fatal.
    pub(super) fn spawn_relay<T>(
        &self,
        output: OutputThing<T>,
        mut rx: mpsc::UnboundedReceiver<Relay<T>>,
        id: ThingId,
        generation: u64,
        request_stop: Rc<dyn Fn()>,
    ) where
        T: Event,
    {
        let weak = self.downgrade();
        self.spawn(async move {
            let mut stop_requested = false;
            while let Some(msg) = rx.recv().await {
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                let dispatched = match msg {
                    Relay::Next { port, value } => output.dispatch_next_on(&port, value),
                    Relay::Completed { port } => output.dispatch_completed_on(&port),
                    Relay::Error { port, error } => output.dispatch_error_on(&port, error),
                    Relay::Finished => {
                        scheduler.finished(id, generation);
                        return;
                    }
                    Relay::Failed(err) => {
                        scheduler.abandon(id, generation);
                        scheduler.record_fatal(FlowError::Worker {
                            thing: output.name().to_string(),
                            source: err,
                        });
                        return;
                    }
                };
                if let Err(e) = dispatched {
                    scheduler.record_fatal(e);
                    return;
                }
                if !stop_requested && !output.has_connections() {
                    tracing::debug!("{} has no more connections, stopping its worker", output.name());
                    stop_requested = true;
                    request_stop();
                }
            }
            if let Some(scheduler) = weak.upgrade() {
                if scheduler.is_current(id, generation) {
                    scheduler.abandon(id, generation);
                    scheduler.record_fatal(FlowError::Worker {
                        thing: output.name().to_string(),
                        source: anyhow::anyhow!("worker exited without reporting how it ended"),
                    });
                }
            }
        });
    }
}
