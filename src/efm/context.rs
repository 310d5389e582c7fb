use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::driver::DriverConnection;

/// Monitoring handle for one connection while it executes work.
///
/// Holds the monitored connection weakly so an abandoned connection never
/// keeps its context alive; a context whose connection is gone or that was
/// explicitly deactivated reads as inactive and is swept by the monitor.
pub struct HostMonitorConnectionContext {
    connection: Mutex<Option<Weak<dyn DriverConnection>>>,
    node_unhealthy: AtomicBool,
}

impl HostMonitorConnectionContext {
    pub(crate) fn new(connection: &Arc<dyn DriverConnection>) -> Self {
        Self {
            connection: Mutex::new(Some(Arc::downgrade(connection))),
            node_unhealthy: AtomicBool::new(false),
        }
    }

    /// Polled by the connection between operations to learn the monitor's
    /// verdict.
    pub fn is_node_unhealthy(&self) -> bool {
        self.node_unhealthy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_node_unhealthy(&self) {
        self.node_unhealthy.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Detach from monitoring. The unhealthy flag survives deactivation so a
    /// late poll still sees the verdict.
    pub fn set_inactive(&self) {
        *self.connection.lock() = None;
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn DriverConnection>> {
        self.connection.lock().as_ref().and_then(Weak::upgrade)
    }
}
