//! Per-store change notification bus
//!
//! Continuous change feeds register here and are woken after every
//! committed write. Wake-ups carry no payload; listeners re-scan the
//! change feed from their own checkpoint.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
pub struct ChangeBus {
    name: String,
    listeners: RwLock<HashMap<String, Arc<Notify>>>,
}

impl ChangeBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a listener; returns its id (`<store>:<uuid>`) and waker.
    pub fn add(&self) -> (String, Arc<Notify>) {
        let id = format!("{}:{}", self.name, uuid::Uuid::new_v4());
        let notify = Arc::new(Notify::new());
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(id.clone(), notify.clone());
        }
        debug!("Added change listener {}", id);
        (id, notify)
    }

    /// Remove a listener. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .listeners
            .write()
            .map(|mut l| l.remove(id))
            .ok()
            .flatten();
        if let Some(notify) = &removed {
            // Wake the feed so it observes its cancellation.
            notify.notify_one();
            debug!("Removed change listener {}", id);
        }
        removed.is_some()
    }

    /// Remove every listener, waking each one.
    pub fn remove_all(&self) -> usize {
        let drained: Vec<(String, Arc<Notify>)> = match self.listeners.write() {
            Ok(mut l) => l.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (_, notify) in &drained {
            notify.notify_one();
        }
        if !drained.is_empty() {
            debug!("Removed {} change listeners from {}", drained.len(), self.name);
        }
        drained.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.listeners.read().map(|l| l.contains_key(id)).unwrap_or(false)
    }

    /// Wake every registered listener.
    pub fn notify(&self) {
        if let Ok(listeners) = self.listeners.read() {
            for notify in listeners.values() {
                notify.notify_one();
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_wakes_listener() {
        let bus = ChangeBus::new("db");
        let (id, notify) = bus.add();
        assert!(id.starts_with("db:"));
        bus.notify();
        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_remove_is_idempotent() {
        let bus = ChangeBus::new("db");
        let (id, _) = bus.add();
        let (other, _) = bus.add();
        assert!(bus.remove(&id));
        assert!(!bus.remove(&id));
        assert!(bus.contains(&other));
        assert_eq!(bus.remove_all(), 1);
        assert_eq!(bus.listener_count(), 0);
    }
}
