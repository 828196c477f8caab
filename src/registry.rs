use std::{collections::VecDeque, time::Duration};

use ahash::{HashMap, HashMapExt};
use codec::Message;
use parking_lot::Mutex;

use crate::{
    completion::ResponseCompletion,
    error::Error,
};

/// A reverse-connection original parked until the remote peer dials
/// back.
pub(crate) struct CachedRequest {
    pub message: Message,
    pub completion: ResponseCompletion,
    pub idle: Duration,
}

/// Bounded store of reverse-connection originals, oldest out first.
///
/// An evicted original cancels its waiting completion so the caller
/// never hangs on a request that can no longer be delivered.
struct RconCache {
    entries: HashMap<u32, CachedRequest>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl RconCache {
    fn insert(&mut self, cached: CachedRequest) -> Option<CachedRequest> {
        let id = cached.message.id;
        self.order.retain(|it| *it != id);
        self.order.push_back(id);
        self.entries.insert(id, cached);

        if self.entries.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            return self.entries.remove(&oldest);
        }

        None
    }

    fn take(&mut self, id: u32) -> Option<CachedRequest> {
        self.order.retain(|it| *it != id);
        self.entries.remove(&id)
    }
}

/// Correlation table matching inbound replies to outstanding requests
/// by message id, plus the reverse-connection cache.
///
/// An entry is inserted before the request's bytes leave the encoder
/// and removed before its completion signals listeners, so nobody can
/// observe a resolved completion that is still registered.
pub struct PendingRegistry {
    pending: Mutex<HashMap<u32, ResponseCompletion>>,
    cached: Mutex<RconCache>,
}

impl PendingRegistry {
    pub(crate) fn new(rcon_capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            cached: Mutex::new(RconCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: rcon_capacity,
            }),
        }
    }

    /// Register an outstanding request. Ids must be unique among
    /// in-flight requests.
    pub(crate) fn insert(&self, completion: ResponseCompletion) -> Result<(), Error> {
        let id = completion.request_id();
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        pending.insert(id, completion);
        Ok(())
    }

    pub(crate) fn remove(&self, id: u32) -> Option<ResponseCompletion> {
        self.pending.lock().remove(&id)
    }

    /// Correlate an inbound reply. The entry is removed atomically
    /// before the completion resolves; returns false for unmatched
    /// replies.
    pub(crate) fn resolve(&self, reply: Message) -> bool {
        let Some(completion) = self.remove(reply.id) else {
            return false;
        };

        completion.succeed(Some(reply));
        true
    }

    pub(crate) fn cache_request(&self, cached: CachedRequest) {
        let evicted = self.cached.lock().insert(cached);
        if let Some(evicted) = evicted {
            log::warn!(
                "reverse connection cache full, evicting: id={}",
                evicted.message.id
            );
            evicted.completion.cancel();
        }
    }

    pub(crate) fn take_cached(&self, id: u32) -> Option<CachedRequest> {
        self.cached.lock().take(id)
    }

    pub(crate) fn discard_cached(&self, id: u32) {
        self.cached.lock().take(id);
    }

    /// Ids of the reverse-connection originals currently parked.
    pub fn cached_request_ids(&self) -> Vec<u32> {
        self.cached.lock().order.iter().copied().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drain everything with the given terminal error. Used on
    /// shutdown so no caller is left waiting.
    pub(crate) fn fail_all(&self, error: Error) {
        let pending = {
            let mut map = self.pending.lock();
            map.drain().collect::<Vec<_>>()
        };

        for (_, completion) in pending {
            completion.fail(error.clone());
        }

        let cached = {
            let mut cache = self.cached.lock();
            cache.order.clear();
            cache.entries.drain().collect::<Vec<_>>()
        };

        for (_, cached) in cached {
            cached.completion.fail(error.clone());
        }
    }
}
