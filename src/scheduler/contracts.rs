//! What the scheduler needs from the things it drives.

use crate::error::Result;
use crate::graph::{Event, ThingId};
use crate::scheduler::bridge::RemoteOutput;
use crate::scheduler::Scheduler;
use std::rc::Rc;
use std::sync::Arc;

/// An output thing the scheduler samples by calling [`observe`].
///
/// Used by periodic, recurring and one-time scheduling. `observe` runs on
/// the loop thread and must not block.
///
/// [`observe`]: DirectOutputThing::observe
pub trait DirectOutputThing: 'static {
    fn thing_id(&self) -> ThingId;

    fn name(&self) -> String;

    /// Produce (at most) one event and dispatch it.
    fn observe(&self) -> Result<()>;

    /// Once this turns false the scheduler stops sampling the thing.
    fn has_connections(&self) -> bool;
}

/// An output thing with its own event-driven I/O that runs on the
/// scheduler's loop.
///
/// [`observe_event_loop`](MainLoopOutputThing::observe_event_loop) sets up
/// whatever tasks the thing needs (for example through
/// [`Scheduler::schedule_coroutine`]). When the thing is done it must call
/// [`Scheduler::remove_from_active_schedules`] with its id.
pub trait MainLoopOutputThing: 'static {
    fn thing_id(&self) -> ThingId;

    fn name(&self) -> String;

    fn observe_event_loop(self: Rc<Self>, scheduler: &Scheduler) -> Result<()>;

    /// Request a graceful shutdown as soon as possible
    fn stop_loop(&self);
}

/// Callable that asks a private event loop to stop. Safe to call from any
/// thread, any number of times.
pub type StopHook = Arc<dyn Fn() + Send + Sync>;

/// A source wrapping an inherently event-driven external protocol, run on
/// a dedicated thread with its own loop.
///
/// Events are handed to the [`RemoteOutput`], which relays them to the
/// scheduler's loop; the graph itself is never touched from the worker.
pub trait EventLoopSource: Send + 'static {
    type Event: Event + Send;

    fn name(&self) -> String {
        crate::graph::input::short_type_name::<Self>()
    }

    /// Run the private loop until it ends or a stop is requested.
    fn observe_event_loop(&mut self, output: &RemoteOutput<Self::Event>) -> anyhow::Result<()>;

    fn stop_hook(&self) -> StopHook;
}
