pub(crate) mod tcp;
pub(crate) mod udp;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use ahash::HashMap;
use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    time::{Duration, Instant},
};

use crate::{
    error::Error,
    registry::PendingRegistry,
    watchdog::IdleTimer,
};

/// Bounded slots for outbound channels, TCP and UDP counted apart.
///
/// A send borrows one slot and attaches its return to the completion's
/// release hook, so the slot is back before anyone observes the
/// outcome.
pub(crate) struct ChannelPool {
    tcp: Arc<Semaphore>,
    udp: Arc<Semaphore>,
}

impl ChannelPool {
    pub fn new(tcp: usize, udp: usize) -> Self {
        Self {
            tcp: Arc::new(Semaphore::new(tcp)),
            udp: Arc::new(Semaphore::new(udp)),
        }
    }

    pub fn acquire_tcp(&self) -> Result<OwnedSemaphorePermit, Error> {
        self.tcp
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::ChannelCreation("tcp channel pool exhausted".to_string()))
    }

    pub fn acquire_udp(&self) -> Result<OwnedSemaphorePermit, Error> {
        self.udp
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::ChannelCreation("udp channel pool exhausted".to_string()))
    }
}

/// State one channel task and its handle share: liveness, the close
/// signal, the idle watchdog and the completions armed on this
/// channel.
pub(crate) struct ChannelShared {
    pub id: u64,
    active: AtomicBool,
    closed: watch::Sender<bool>,
    armed: Mutex<Vec<crate::completion::ResponseCompletion>>,
    idle: Mutex<IdleTimer>,
    pending: Arc<PendingRegistry>,
}

impl ChannelShared {
    fn new(id: u64, pending: Arc<PendingRegistry>, idle: Option<Duration>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            active: AtomicBool::new(true),
            closed,
            armed: Mutex::new(Vec::new()),
            idle: Mutex::new(IdleTimer::new(idle)),
            pending,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.closed.send(true);
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Register a completion awaiting its reply over this channel.
    pub fn arm(&self, completion: crate::completion::ResponseCompletion) {
        self.armed.lock().push(completion);
    }

    pub fn set_idle(&self, budget: Option<Duration>) {
        self.idle.lock().set_budget(budget);
    }

    pub fn touch(&self) {
        self.idle.lock().touch();
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle.lock().deadline()
    }

    pub fn idle_expired(&self) -> bool {
        self.idle.lock().expired()
    }

    /// Terminal path of the watchdog and of read errors: every armed
    /// completion is unregistered first, then failed.
    pub fn fail_armed(&self, error: &Error) {
        let armed = std::mem::take(&mut *self.armed.lock());
        for completion in armed {
            self.pending.remove(completion.request_id());
            completion.fail(error.clone());
        }
    }
}

/// Every open channel, for cleanup and shutdown.
#[derive(Default)]
pub(crate) struct ChannelSet {
    channels: Mutex<HashMap<u64, Arc<ChannelShared>>>,
    next_id: AtomicU64,
}

impl ChannelSet {
    pub fn register(
        &self,
        pending: Arc<PendingRegistry>,
        idle: Option<Duration>,
    ) -> Arc<ChannelShared> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ChannelShared::new(id, pending, idle));
        self.channels.lock().insert(id, shared.clone());
        shared
    }

    pub fn deregister(&self, id: u64) {
        self.channels.lock().remove(&id);
    }

    pub fn close_all(&self) {
        let channels = {
            let mut map = self.channels.lock();
            map.drain().collect::<Vec<_>>()
        };

        for (_, shared) in channels {
            shared.close();
        }
    }
}

/// Sleep until the watchdog deadline, or forever when no watchdog is
/// armed.
pub(crate) async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{Outcome, ResponseCompletion};

    #[test]
    fn pool_slots_are_bounded() {
        let pool = ChannelPool::new(1, 1);

        let held = pool.acquire_tcp().unwrap();
        assert!(matches!(
            pool.acquire_tcp(),
            Err(Error::ChannelCreation(_))
        ));

        drop(held);
        assert!(pool.acquire_tcp().is_ok());
    }

    #[test]
    fn fail_armed_unregisters_before_failing() {
        let pending = Arc::new(PendingRegistry::new(8));
        let set = ChannelSet::default();
        let shared = set.register(pending.clone(), None);

        let completion = ResponseCompletion::new(5);
        pending.insert(completion.clone()).unwrap();
        shared.arm(completion.clone());

        let registry = pending.clone();
        completion.on_done(move |_| assert_eq!(registry.pending_len(), 0));

        shared.fail_armed(&Error::IdleTimeout);
        assert!(matches!(
            completion.outcome(),
            Some(Outcome::Failed(Error::IdleTimeout))
        ));
    }

    #[test]
    fn close_all_drains_the_set() {
        let pending = Arc::new(PendingRegistry::new(8));
        let set = ChannelSet::default();
        let shared = set.register(pending, None);

        assert_eq!(set.channels.lock().len(), 1);
        set.close_all();
        assert_eq!(set.channels.lock().len(), 0);
        assert!(!shared.is_active());
    }
}
