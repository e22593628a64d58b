//! Settings sections of the runtime configuration
//!
//! # Main Types
//!
//! - [`SchedulerSettings`] - Event-loop scheduler and its worker threads
//! - [`TickSettings`] - Tick scheduler clock for constrained targets
//! - [`LogSettings`] - Log filter and optional file output

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default name prefix for worker threads
pub const DEFAULT_WORKER_THREAD_PREFIX: &str = "thingflow-worker";

/// Default tick clock modulus (16-bit counter)
pub const DEFAULT_CLOCK_WRAP: u32 = 65535;

/// Default tick length in milliseconds
pub const DEFAULT_TICK_MS: u32 = 10;

/// Default log filter directive
pub const DEFAULT_LOG_FILTER: &str = "info,thingflow=debug";

/// Settings for the event-loop scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Worker threads are named `<prefix>-<thing name>`
    #[serde(default = "default_worker_thread_prefix")]
    pub worker_thread_prefix: String,

    /// Join worker threads once the loop exits
    #[serde(default = "default_true")]
    pub join_workers_on_exit: bool,
}

fn default_worker_thread_prefix() -> String {
    DEFAULT_WORKER_THREAD_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_thread_prefix: default_worker_thread_prefix(),
            join_workers_on_exit: true,
        }
    }
}

/// Settings for the tick scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSettings {
    /// Tick counter wraps around at this value
    #[serde(default = "default_clock_wrap")]
    pub clock_wrap: u32,

    /// Length of one tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u32,
}

fn default_clock_wrap() -> u32 {
    DEFAULT_CLOCK_WRAP
}

fn default_tick_ms() -> u32 {
    DEFAULT_TICK_MS
}

impl Default for TickSettings {
    fn default() -> Self {
        Self {
            clock_wrap: DEFAULT_CLOCK_WRAP,
            tick_ms: DEFAULT_TICK_MS,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// `EnvFilter` directive, used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Include thread names in log lines
    #[serde(default = "default_true")]
    pub thread_names: bool,

    /// Also write daily-rolling log files into this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            thread_names: true,
            directory: None,
        }
    }
}
