use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Cancel-and-reschedule timers keyed by `K`
///
/// Scheduling a key that already has a pending task aborts that task and
/// restarts the window; only the latest trigger runs.
pub struct Debouncer<K> {
    delay: Duration,
    pending: Arc<Mutex<HashMap<K, (u64, JoinHandle<()>)>>>,
    next_ticket: Arc<AtomicU64>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            pending: Arc::clone(&self.pending),
            next_ticket: Arc::clone(&self.next_ticket),
        }
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn schedule<F>(&self, key: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().await;
        if let Some((_, previous)) = pending.remove(&key) {
            previous.abort();
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let map = Arc::clone(&self.pending);
        let own_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Past the window: no longer cancellable by a new trigger
            {
                let mut map = map.lock().await;
                if matches!(map.get(&own_key), Some((t, _)) if *t == ticket) {
                    map.remove(&own_key);
                }
            }
            task.await;
        });
        pending.insert(key, (ticket, handle));
    }

    pub async fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().await.contains_key(key)
    }

    /// Abort every pending task
    pub async fn cancel_all(&self) {
        for (_, (_, handle)) in self.pending.lock().await.drain() {
            handle.abort();
        }
    }
}
