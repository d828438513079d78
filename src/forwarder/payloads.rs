use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::platform::NativePayload;

struct Inner {
    entries: HashMap<String, (NativePayload, Instant)>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// Bounded msg id → native payload index for sources that deliver the raw
/// protocol payload separately from the parsed message.
///
/// Entries expire on the same retention horizon as the dedup cache and the
/// oldest entry is evicted once `capacity` is reached.
pub struct PayloadIndex {
    inner: Mutex<Inner>,
    retention: Duration,
    capacity: usize,
}

impl PayloadIndex {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            retention,
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, msg_id: &str, payload: NativePayload) {
        self.insert_at(msg_id, payload, Instant::now());
    }

    /// Remove and return the payload recorded for `msg_id`
    pub fn take(&self, msg_id: &str) -> Option<NativePayload> {
        self.take_at(msg_id, Instant::now())
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_at(&self, msg_id: &str, payload: NativePayload, now: Instant) {
        let mut inner = self.lock();
        self.purge(&mut inner, now);

        if inner.entries.remove(msg_id).is_some() {
            inner.order.retain(|id| id != msg_id);
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    debug!("Payload index full, evicting {}", oldest);
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(msg_id.to_string());
        inner.entries.insert(msg_id.to_string(), (payload, now));
    }

    fn take_at(&self, msg_id: &str, now: Instant) -> Option<NativePayload> {
        let mut inner = self.lock();
        self.purge(&mut inner, now);
        let (payload, _) = inner.entries.remove(msg_id)?;
        inner.order.retain(|id| id != msg_id);
        Some(payload)
    }

    fn purge(&self, inner: &mut Inner, now: Instant) {
        let retention = self.retention;
        inner
            .entries
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < retention);
        let Inner { entries, order } = inner;
        order.retain(|id| entries.contains_key(id));
    }
}
