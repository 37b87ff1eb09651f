//! In-process fan-out of "content ready" events to an owner's live subscribers.
//!
//! Delivery is best-effort: only callbacks registered at publish time receive
//! the event, nothing is stored for later. Polling the job status is the
//! durable path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::db::ContentPayload;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentReadyEvent {
    pub job_id: String,
    pub content: ContentPayload,
}

pub type Callback = Arc<dyn Fn(&ContentReadyEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(u64, Callback)>>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Callback)>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, owner_id: &str, id: u64) {
        let mut subs = self.lock();
        if let Some(list) = subs.get_mut(owner_id) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subs.remove(owner_id);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct NotificationHub {
    inner: Arc<Inner>,
}

/// Live registration on a hub. Dropping it unsubscribes.
pub struct Subscription {
    hub: Weak<Inner>,
    owner_id: String,
    id: u64,
}

impl Subscription {
    pub fn channel(&self) -> String {
        NotificationHub::channel_name(&self.owner_id)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.remove(&self.owner_id, self.id);
        }
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel name clients listen on for an owner.
    pub fn channel_name(owner_id: &str) -> String {
        format!("content:ready:{owner_id}")
    }

    pub fn subscribe<F>(&self, owner_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ContentReadyEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(owner_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(channel = %Self::channel_name(owner_id), "subscriber added");
        Subscription {
            hub: Arc::downgrade(&self.inner),
            owner_id: owner_id.to_string(),
            id,
        }
    }

    /// Subscribe with a channel receiver instead of a callback, for transports
    /// that forward events to a connection.
    pub fn subscribe_channel(
        &self,
        owner_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<ContentReadyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(owner_id, move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    /// Deliver to the owner's current subscribers. Returns how many were reached.
    pub fn publish(&self, owner_id: &str, event: &ContentReadyEvent) -> usize {
        let callbacks: Vec<Callback> = self
            .inner
            .lock()
            .get(owner_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for cb in &callbacks {
            cb(event);
        }
        debug!(
            channel = %Self::channel_name(owner_id),
            job_id = %event.job_id,
            delivered = callbacks.len(),
            "content ready published"
        );
        callbacks.len()
    }

    pub fn subscriber_count(&self, owner_id: &str) -> usize {
        self.inner.lock().get(owner_id).map_or(0, Vec::len)
    }
}
