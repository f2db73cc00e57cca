//! Per-endpoint tracking of open sessions.
//!
//! The dispatcher inserts a session right before the open callback runs and
//! removes it on the terminal transition, so the set always mirrors the
//! sessions whose state is OPEN (or about to be observed as such).
//! Snapshots are point-in-time copies and must be obtainable from
//! synchronous callback context, hence the std lock.

use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

use crate::session::Session;

pub(crate) struct SessionTracker {
    sessions: RwLock<Vec<Arc<Session>>>,
    drained: Notify,
}

impl SessionTracker {
    pub(crate) fn new() -> Self {
        SessionTracker {
            sessions: RwLock::new(Vec::new()),
            drained: Notify::new(),
        }
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.push(session);
        }
    }

    pub(crate) fn remove(&self, session_id: &str) {
        let empty = match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.retain(|s| s.id() != session_id);
                sessions.is_empty()
            }
            Err(_) => false,
        };
        if empty {
            self.drained.notify_waiters();
        }
    }

    /// Point-in-time copy of the tracked sessions.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once the tracker has drained to empty.
    pub(crate) async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
