//! Per-listener connection registry driving forced and graceful teardown.
//!
//! Every accepted socket registers on accept and unregisters when its task
//! drops the guard. A connection is busy exactly while a request/response
//! cycle or tunnel is attached; graceful shutdown closes only idle sockets
//! and lets busy ones self-terminate at their completion hook.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

pub(crate) struct ConnectionTracker {
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    connections: HashMap<u64, TrackedConnection>,
    next_id: u64,
    shutting_down: bool,
}

struct TrackedConnection {
    idle: bool,
    close_tx: watch::Sender<bool>,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TrackerInner {
                connections: HashMap::new(),
                next_id: 0,
                shutting_down: false,
            }),
        })
    }

    /// Registers a freshly accepted socket, idle until a cycle attaches.
    /// The receiver fires when the tracker wants the connection closed.
    pub fn register(self: &Arc<Self>) -> (ConnectionGuard, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.connections.insert(
            id,
            TrackedConnection {
                idle: true,
                close_tx,
            },
        );
        (
            ConnectionGuard {
                tracker: Arc::clone(self),
                id,
            },
            close_rx,
        )
    }

    /// Stops nothing by itself; the accept loop is signalled separately.
    /// Force closes every tracked socket, graceful only the idle ones.
    pub fn shutdown(&self, force: bool) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        inner.shutting_down = true;
        for connection in inner.connections.values() {
            if force || connection.idle {
                let _ = connection.close_tx.send(true);
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .expect("tracker lock poisoned")
            .connections
            .len()
    }

    fn mark_busy(&self, id: u64) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        if let Some(connection) = inner.connections.get_mut(&id) {
            connection.idle = false;
        }
    }

    fn mark_idle(&self, id: u64) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let shutting_down = inner.shutting_down;
        if let Some(connection) = inner.connections.get_mut(&id) {
            connection.idle = true;
            if shutting_down {
                let _ = connection.close_tx.send(true);
            }
        }
    }

    fn unregister(&self, id: u64) {
        self.inner
            .lock()
            .expect("tracker lock poisoned")
            .connections
            .remove(&id);
    }
}

/// Handle held by a connection task; dropping it unregisters the socket.
pub(crate) struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    id: u64,
}

impl ConnectionGuard {
    pub fn mark_busy(&self) {
        self.tracker.mark_busy(self.id);
    }

    pub fn mark_idle(&self) {
        self.tracker.mark_idle(self.id);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.unregister(self.id);
    }
}
