//! # thingflow: event-driven dataflow for sensors
//!
//! Sources ("output things") emit events, sinks and filters ("input things")
//! consume and forward them, and a scheduler decides when each source is
//! sampled and how events cross thread boundaries.
//!
//! ## Architecture
//!
//! - **Graph**: publish/subscribe dispatch with named ports, see [`graph`]
//! - **Sources**: pull-based producers and sensors, see [`sources`]
//! - **Filters**: transducers, timeouts and buffers, see [`filters`]
//! - **Scheduler**: a single-threaded tokio event loop that also drives
//!   worker threads, private loops and bridged futures, see [`scheduler`]
//! - **Tick scheduler**: allocation-light periodic scheduling on an integer
//!   clock for constrained targets, see [`scheduler::tick`]
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use thingflow::{filters::sliding_mean, sources::from_list, FlowExt, Scheduler};
//!
//! fn main() -> thingflow::Result<()> {
//!     let config = thingflow::RuntimeConfig::load_default()?;
//!     let _guard = thingflow::init_logging(&config.logging)?;
//!
//!     let scheduler = Scheduler::with_settings(config.scheduler)?;
//!     let readings = from_list(vec![10.0, 11.0, 9.0, 12.0]);
//!     readings
//!         .transduce(sliding_mean::<f64>(2)?)?
//!         .output()
//!         .connect_fn(|mean: f64| {
//!             tracing::info!("mean: {}", mean);
//!             Ok(())
//!         })?;
//!     scheduler.schedule_periodic(readings, Duration::from_millis(100))?;
//!     scheduler.run_forever()
//! }
//! ```

pub mod config;
pub mod error;
pub mod filters;
pub mod graph;
pub mod logging;
pub mod scheduler;
pub mod sources;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use error::{FlowError, HandlerResult, Result, StreamError};
pub use filters::FlowExt;
pub use graph::{Event, InputThing, OutputThing, PortMapping, ThingId, Upstream, DEFAULT_PORT};
pub use logging::init_logging;
pub use scheduler::{Cancel, Scheduler, TickRunner, TickScheduler};
pub use sources::{Sensor, SensorEvent, SourceThing};
