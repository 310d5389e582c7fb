//! Enhanced failure monitoring
//!
//! Per-node liveness probing for connections in active use. A connection
//! registers a [`HostMonitorConnectionContext`] while it executes work; the
//! shared [`HostMonitor`] for its node probes over a separate lightweight
//! connection and, once enough consecutive probes fail, flags every active
//! context and aborts their connections so callers blocked on a dead node
//! return quickly. The verdict is a polled boolean, never an unsolicited
//! callback.

mod context;
mod monitor;
mod service;

pub use context::HostMonitorConnectionContext;
pub use monitor::{HostMonitor, MonitorKey};
pub use service::HostMonitorService;
