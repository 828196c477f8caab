use tokio::time::{Duration, Instant};

/// Idle bookkeeping for one channel.
///
/// The timer does not schedule anything itself; the channel task asks
/// for the current deadline on every loop turn and sleeps on it, so a
/// `touch` from any read or write pushes the expiry out. A channel
/// with no budget (fire-and-forget sends) never produces a deadline.
pub(crate) struct IdleTimer {
    budget: Option<Duration>,
    last_activity: Instant,
}

impl IdleTimer {
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            budget,
            last_activity: Instant::now(),
        }
    }

    pub fn set_budget(&mut self, budget: Option<Duration>) {
        self.budget = budget;
        self.last_activity = Instant::now();
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.budget.map(|it| self.last_activity + it)
    }

    /// True only when the budget really ran out; a deadline that moved
    /// while the task slept is not an expiry.
    pub fn expired(&self) -> bool {
        match self.deadline() {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn touch_moves_the_deadline() {
        let mut timer = IdleTimer::new(Some(Duration::from_secs(2)));
        let first = timer.deadline().unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        timer.touch();

        assert!(timer.deadline().unwrap() > first);
        assert!(!timer.expired());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(timer.expired());
    }

    #[test]
    fn no_budget_never_expires() {
        let timer = IdleTimer::new(None);
        assert!(timer.deadline().is_none());
        assert!(!timer.expired());
    }
}
