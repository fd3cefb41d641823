//! Network reachability tracking.
//!
//! The host platform feeds raw reachability events into [`ConnectivityMonitor::set_online`];
//! transitions are edge-triggered so listeners only fire on actual state
//! change, not on every network event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    callback: ConnectivityCallback,
}

struct MonitorInner {
    status: watch::Sender<bool>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (status, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(MonitorInner {
                status,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn get_current_status(&self) -> bool {
        *self.inner.status.borrow()
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<ListenerEntry>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed a reachability observation. Listeners and watch subscribers are
    /// notified only when the online state actually flips.
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }

        log::info!(
            "connectivity: state changed to {}",
            if online { "online" } else { "offline" }
        );

        // Release the registry lock before invoking, so callbacks can add or
        // remove listeners.
        let callbacks: Vec<ConnectivityCallback> = self
            .listeners()
            .iter()
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in callbacks {
            callback(online);
        }
    }

    /// Register a callback fired on every online/offline transition. The
    /// returned handle removes it; removal is idempotent.
    pub fn add_listener(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> ConnectivityListener {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push(ListenerEntry {
            id,
            callback: Arc::new(callback),
        });
        ConnectivityListener {
            id,
            inner: Arc::downgrade(&self.inner),
            removed: AtomicBool::new(false),
        }
    }

    /// Async view of the online state, for tasks that drain deferred writes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.status.subscribe()
    }
}

pub struct ConnectivityListener {
    id: u64,
    inner: Weak<MonitorInner>,
    removed: AtomicBool,
}

impl ConnectivityListener {
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|entry| entry.id != self.id);
    }
}
