//! Timer ownership for coordinators.
//!
//! A coordinator never sleeps on its own timers. It asks a [`Scheduler`] to
//! deliver a [`TimerEvent`] later and keeps the returned token so it can
//! cancel. Every delivery carries the token of the timer that sent it, so an
//! event already queued when its timer was replaced can be told apart. The tokio implementation backs each timer with a task whose abort
//! handle is tracked, so `pending()` is an exact count of live timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// What a timer delivers when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Slow regular poll of the full job status.
    RegularPoll,
    /// The next scheduled run time has been reached.
    ScheduledRun,
    /// Fast poll while a backup is running.
    ActiveCheck,
    /// Re-check for a run that should have started.
    DetectionRetry { attempt: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// A delivered timer event and the timer it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub token: TimerToken,
    pub event: TimerEvent,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Deliver `event` once after `delay`.
    fn schedule_once(&self, delay: Duration, event: TimerEvent) -> TimerToken;

    /// Deliver `event` every `period`, first after one full period.
    fn schedule_interval(&self, period: Duration, event: TimerEvent) -> TimerToken;

    /// Cancel a timer. Unknown or already fired tokens are ignored.
    fn cancel(&self, token: TimerToken);

    /// Number of timers that can still fire.
    fn pending(&self) -> usize;

    /// Suspend the caller.
    async fn sleep(&self, duration: Duration);
}

type TaskMap = Arc<Mutex<HashMap<TimerToken, AbortHandle>>>;

fn lock(tasks: &TaskMap) -> MutexGuard<'_, HashMap<TimerToken, AbortHandle>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler backed by tokio tasks, delivering events on an mpsc channel.
pub struct TokioScheduler {
    events: mpsc::UnboundedSender<TimerFired>,
    next_token: AtomicU64,
    tasks: TaskMap,
}

impl TokioScheduler {
    pub fn new(events: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            events,
            next_token: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn token(&self) -> TimerToken {
        TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, event: TimerEvent) -> TimerToken {
        let token = self.token();
        let events = self.events.clone();
        let tasks = Arc::clone(&self.tasks);

        // Hold the map while spawning so the task cannot finish before it is registered.
        let mut map = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&tasks).remove(&token);
            let _ = events.send(TimerFired { token, event });
        });
        map.insert(token, handle.abort_handle());
        token
    }

    fn schedule_interval(&self, period: Duration, event: TimerEvent) -> TimerToken {
        let token = self.token();
        let events = self.events.clone();
        let tasks = Arc::clone(&self.tasks);
        let period = period.max(Duration::from_millis(1));

        let mut map = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(TimerFired { token, event }).is_err() {
                    break;
                }
            }
            lock(&tasks).remove(&token);
        });
        map.insert(token, handle.abort_handle());
        token
    }

    fn cancel(&self, token: TimerToken) {
        if let Some(handle) = lock(&self.tasks).remove(&token) {
            handle.abort();
        }
    }

    fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in lock(&self.tasks).drain() {
            handle.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn once_fires_and_unregisters() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = TokioScheduler::new(tx);

        let token = scheduler.schedule_once(Duration::from_secs(5), TimerEvent::ScheduledRun);
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(
            rx.recv().await,
            Some(TimerFired {
                token,
                event: TimerEvent::ScheduledRun
            })
        );
        tokio::task::yield_now().await;
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_skips_immediate_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = TokioScheduler::new(tx);
        let started = Instant::now();

        let token = scheduler.schedule_interval(Duration::from_secs(5), TimerEvent::ActiveCheck);
        let tick = TimerFired {
            token,
            event: TimerEvent::ActiveCheck,
        };
        assert_eq!(rx.recv().await, Some(tick));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(rx.recv().await, Some(tick));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = TokioScheduler::new(tx);

        let token = scheduler.schedule_once(Duration::from_secs(1), TimerEvent::ScheduledRun);
        scheduler.cancel(token);
        scheduler.cancel(token);
        assert_eq!(scheduler.pending(), 0);

        let waited = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deliveries_name_their_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = TokioScheduler::new(tx);

        let first = scheduler.schedule_once(Duration::from_secs(1), TimerEvent::ScheduledRun);
        let second = scheduler.schedule_once(Duration::from_secs(2), TimerEvent::ScheduledRun);
        assert_ne!(first, second);

        assert_eq!(rx.recv().await.map(|f| f.token), Some(first));
        assert_eq!(rx.recv().await.map(|f| f.token), Some(second));
    }

    #[tokio::test]
    async fn drop_aborts_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = TokioScheduler::new(tx);
        scheduler.schedule_interval(Duration::from_millis(10), TimerEvent::RegularPoll);
        drop(scheduler);

        // The channel closes once the aborted task drops its sender.
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }
}
