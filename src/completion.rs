use std::{
    sync::Arc,
    task::{Poll, Waker},
};

use codec::Message;
use parking_lot::Mutex;

use crate::error::Error;

/// Terminal state of a send.
///
/// `Ok(None)` is the fire-and-forget success: the write went out and no
/// reply was expected.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok(Option<Message>),
    Failed(Error),
    Cancelled,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn reply(&self) -> Option<&Message> {
        match self {
            Outcome::Ok(reply) => reply.as_ref(),
            _ => None,
        }
    }
}

type Hook = Box<dyn FnOnce() + Send>;
type Listener = Box<dyn FnOnce(&Outcome) + Send>;

#[derive(Default)]
struct State {
    outcome: Option<Outcome>,
    /// Release hooks run before ordinary listeners so borrowed
    /// resources (pool slots) are returned before anyone observes the
    /// outcome.
    release: Vec<Hook>,
    listeners: Vec<Listener>,
    cancel_hooks: Vec<Hook>,
    wakers: Vec<Waker>,
}

/// Single-assignment result slot for one request.
///
/// The slot transitions pending -> terminal exactly once; later writes
/// are no-ops and report `false`. Handles are cheap clones over shared
/// state.
///
/// ```
/// use dht_transport::{Outcome, ResponseCompletion};
///
/// let completion = ResponseCompletion::new(7);
///
/// assert!(completion.succeed(None));
/// assert!(!completion.cancel());
/// assert!(matches!(completion.outcome(), Some(Outcome::Ok(None))));
/// ```
#[derive(Clone)]
pub struct ResponseCompletion {
    id: u32,
    state: Arc<Mutex<State>>,
}

impl ResponseCompletion {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Id of the request this completion belongs to.
    pub fn request_id(&self) -> u32 {
        self.id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.clone()
    }

    pub fn succeed(&self, reply: Option<Message>) -> bool {
        self.finish(Outcome::Ok(reply), false)
    }

    pub fn fail(&self, error: Error) -> bool {
        self.finish(Outcome::Failed(error), false)
    }

    /// Cancel the send. Propagates to the cancel hooks (channel close,
    /// registry removal, watchdog) exactly once; cancelling a terminal
    /// completion is a no-op.
    pub fn cancel(&self) -> bool {
        self.finish(Outcome::Cancelled, true)
    }

    fn finish(&self, outcome: Outcome, run_cancel_hooks: bool) -> bool {
        let (cancel_hooks, release, listeners, wakers, snapshot) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }

            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.cancel_hooks),
                std::mem::take(&mut state.release),
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
                outcome,
            )
        };

        if run_cancel_hooks {
            for hook in cancel_hooks {
                hook();
            }
        }

        for hook in release {
            hook();
        }

        for listener in listeners {
            listener(&snapshot);
        }

        for waker in wakers {
            waker.wake();
        }

        true
    }

    /// Attach a listener. Runs immediately when the slot is already
    /// terminal.
    pub fn on_done<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let outcome = {
            let mut state = self.state.lock();
            match state.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };

        listener(&outcome);
    }

    /// Attach a release hook. Release hooks run before listeners on
    /// the terminal transition.
    pub fn add_release<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.outcome.is_none() {
                state.release.push(Box::new(hook));
                return;
            }
        }

        hook();
    }

    /// Attach a cancel hook. Runs only on cancellation, immediately if
    /// the slot is already cancelled.
    pub fn add_cancel_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            match &state.outcome {
                None => {
                    state.cancel_hooks.push(Box::new(hook));
                    return;
                }
                Some(Outcome::Cancelled) => {}
                Some(_) => return,
            }
        }

        hook();
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> Outcome {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(outcome) = &state.outcome {
                return Poll::Ready(outcome.clone());
            }

            if !state.wakers.iter().any(|it| it.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }

            Poll::Pending
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn single_assignment() {
        let completion = ResponseCompletion::new(1);

        assert!(completion.succeed(None));
        assert!(!completion.fail(Error::IdleTimeout));
        assert!(!completion.cancel());
        assert!(matches!(completion.outcome(), Some(Outcome::Ok(None))));
    }

    #[test]
    fn release_runs_before_listeners() {
        let completion = ResponseCompletion::new(1);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen = order.clone();
        completion.on_done(move |_| seen.lock().push("listener"));
        let seen = order.clone();
        completion.add_release(move || seen.lock().push("release"));

        completion.fail(Error::IdleTimeout);
        assert_eq!(&*order.lock(), &["release", "listener"]);
    }

    #[test]
    fn listener_after_terminal_runs_immediately() {
        let completion = ResponseCompletion::new(1);
        completion.succeed(None);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        completion.on_done(move |outcome| {
            assert!(outcome.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_hooks_fire_only_on_cancel() {
        let hits = Arc::new(AtomicUsize::new(0));

        let completion = ResponseCompletion::new(1);
        let counter = hits.clone();
        completion.add_cancel_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        completion.succeed(None);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let completion = ResponseCompletion::new(2);
        let counter = hits.clone();
        completion.add_cancel_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        completion.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // idempotent: a second cancel changes nothing.
        completion.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_resolves_on_completion() {
        let completion = ResponseCompletion::new(1);

        let waiter = completion.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        completion.fail(Error::Denied);
        assert!(matches!(
            task.await.unwrap(),
            Outcome::Failed(Error::Denied)
        ));
    }
}
