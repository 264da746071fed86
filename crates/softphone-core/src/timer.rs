//! Cancellable timers
//!
//! A [`TimerScope`] owns a root [`CancellationToken`]. Every timer and every
//! in-flight network operation bound to a connection takes a child token from
//! the scope, so [`TimerScope::cancel_all`] stops all of them at once and then
//! installs a fresh root for whatever runs afterwards.
//!
//! A [`TimerSet`] keys timers by an owner-chosen key. Scheduling under a key that
//! is already scheduled replaces the previous timer. A one-shot timer removes
//! its own entry before its task runs, so the task may schedule the same key
//! again (as refresh timers do).

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Group of cancellation tokens that can be revoked together
#[derive(Debug)]
pub struct TimerScope {
    name: &'static str,
    root: Mutex<CancellationToken>,
}

impl TimerScope {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            root: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A token cancelled by the next [`cancel_all`](Self::cancel_all)
    pub fn token(&self) -> CancellationToken {
        self.root.lock().child_token()
    }

    /// Cancel every token handed out so far
    pub fn cancel_all(&self) {
        let previous = std::mem::replace(&mut *self.root.lock(), CancellationToken::new());
        trace!(scope = self.name, "Cancelling timer scope");
        previous.cancel();
    }
}

/// Delay before refreshing a subscription granted for `expires_secs`
///
/// ```rust
/// # use rvoip_softphone_core::timer::refresh_delay;
/// # use std::time::Duration;
/// assert_eq!(refresh_delay(3600, 0.9), Duration::from_secs(3240));
/// assert_eq!(refresh_delay(0, 0.9), Duration::from_secs(1));
/// ```
pub fn refresh_delay(expires_secs: u32, ratio: f64) -> Duration {
    let secs = (f64::from(expires_secs) * ratio).round().max(1.0);
    Duration::from_secs(secs as u64)
}

struct TimerEntry {
    id: u64,
    token: CancellationToken,
    due: Instant,
}

/// Keyed set of timers belonging to one [`TimerScope`]
pub struct TimerSet<K> {
    scope: Arc<TimerScope>,
    entries: Arc<Mutex<HashMap<K, TimerEntry>>>,
    next_id: AtomicU64,
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(scope: Arc<TimerScope>) -> Self {
        Self {
            scope,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn scope(&self) -> &Arc<TimerScope> {
        &self.scope
    }

    fn register(&self, key: &K, delay: Duration) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.scope.token();
        let entry = TimerEntry {
            id,
            token: token.clone(),
            due: Instant::now() + delay,
        };
        if let Some(previous) = self.entries.lock().insert(key.clone(), entry) {
            previous.token.cancel();
        }
        (id, token)
    }

    /// Run `task` once after `delay`
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, token) = self.register(&key, delay);
        let entries = self.entries.clone();
        trace!(scope = self.scope.name, key = ?key, delay_ms = delay.as_millis() as u64, "Timer scheduled");

        tokio::spawn(async move {
            let fired = tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            remove_if_current(&entries, &key, id);
            if fired {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = task() => {}
                }
            }
        });
    }

    /// Run `task` every `interval` until cancelled
    pub fn schedule_repeating<F, Fut>(&self, key: K, interval: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, token) = self.register(&key, interval);
        let entries = self.entries.clone();
        trace!(scope = self.scope.name, key = ?key, interval_ms = interval.as_millis() as u64, "Repeating timer scheduled");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Some(entry) = entries.lock().get_mut(&key) {
                    if entry.id == id {
                        entry.due = Instant::now() + interval;
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = task() => {}
                }
            }
            remove_if_current(&entries, &key, id);
        });
    }

    pub fn cancel(&self, key: &K) -> bool {
        match self.entries.lock().remove(key) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, entry) in self.entries.lock().drain() {
            entry.token.cancel();
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| !entry.token.is_cancelled())
    }

    /// When the timer under `key` fires next
    pub fn due_at(&self, key: &K) -> Option<Instant> {
        self.entries
            .lock()
            .get(key)
            .filter(|entry| !entry.token.is_cancelled())
            .map(|entry| entry.due)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.token.is_cancelled())
            .count()
    }
}

fn remove_if_current<K: Eq + Hash>(entries: &Mutex<HashMap<K, TimerEntry>>, key: &K, id: u64) {
    let mut entries = entries.lock();
    if entries.get(key).is_some_and(|entry| entry.id == id) {
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter_task(counter: &Arc<AtomicU32>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once_and_deregisters() {
        let timers = TimerSet::new(Arc::new(TimerScope::new("test")));
        let fired = Arc::new(AtomicU32::new(0));

        timers.schedule("refresh", Duration::from_secs(5), counter_task(&fired));
        assert!(timers.is_scheduled(&"refresh"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_scheduled(&"refresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_previous_timer() {
        let timers = TimerSet::new(Arc::new(TimerScope::new("test")));
        let fired = Arc::new(AtomicU32::new(0));

        timers.schedule("refresh", Duration::from_secs(5), counter_task(&fired));
        timers.schedule("refresh", Duration::from_secs(10), counter_task(&fired));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_cancel_stops_all_timers() {
        let scope = Arc::new(TimerScope::new("connection"));
        let a: TimerSet<u32> = TimerSet::new(scope.clone());
        let b: TimerSet<u32> = TimerSet::new(scope.clone());
        let fired = Arc::new(AtomicU32::new(0));

        a.schedule(1, Duration::from_secs(5), counter_task(&fired));
        let repeat = fired.clone();
        b.schedule_repeating(2, Duration::from_secs(1), move || {
            repeat.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        scope.cancel_all();
        assert!(!a.is_scheduled(&1));
        assert!(!b.is_scheduled(&2));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // Timers scheduled after the cancellation use the fresh root
        a.schedule(3, Duration::from_secs(1), counter_task(&fired));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_refresh_delay() {
        assert_eq!(refresh_delay(3600, 0.9), Duration::from_secs(3240));
        assert_eq!(refresh_delay(600, 0.5), Duration::from_secs(300));
        assert_eq!(refresh_delay(1, 0.1), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_at_reports_deadline() {
        let timers = TimerSet::new(Arc::new(TimerScope::new("test")));
        let start = Instant::now();
        timers.schedule("x", Duration::from_secs(3240), || async {});
        assert_eq!(timers.due_at(&"x"), Some(start + Duration::from_secs(3240)));
        assert!(timers.cancel(&"x"));
        assert_eq!(timers.due_at(&"x"), None);
    }
}
