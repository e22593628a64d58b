//! The publish/subscribe dispatch graph
//!
//! Sources and filters own an [`OutputThing`]; sinks and filters implement
//! [`InputThing`]. Connecting the two produces a [`Connection`] whose three
//! callbacks are resolved once, at connect time.
//!
//! # Threading
//!
//! The graph is single-threaded by construction (`Rc`, `RefCell`). Work done
//! on other threads reaches it only through the scheduler's relay, see
//! [`crate::scheduler::RemoteOutput`].

pub mod connection;
pub mod downstream;
pub mod filter;
pub mod id;
pub mod input;
pub mod output;
pub mod port;

pub use connection::{Connection, PortHandlers};
pub use downstream::Downstream;
pub use filter::{Filter, FunctionFilter, FunctionFilterBuilder, Upstream, UpstreamLink, Xform, XformOrDropFilter};
pub use id::{InputKey, ThingId};
pub use input::{FnInput, InputThing};
pub use output::{Disconnect, OutputThing};
pub use port::{PortMapping, DEFAULT_PORT};

use std::fmt::Debug;

/// Anything that can travel through the graph.
pub trait Event: Clone + Debug + 'static {}

impl<T: Clone + Debug + 'static> Event for T {}
