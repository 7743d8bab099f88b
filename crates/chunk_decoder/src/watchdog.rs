use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

type ExpireFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Per-turn inactivity timer.
///
/// A turn is identified by a ticket. Every arm or reset starts a new
/// generation of the countdown; when one runs out the expiry callback gets
/// the ticket and that generation. A callback racing a reset sees a stale
/// generation through [`Watchdog::is_current`].
pub struct Watchdog {
    on_expire: ExpireFn,
    generations: AtomicU64,
    armed: Mutex<Option<Armed>>,
}

struct Armed {
    ticket: u64,
    generation: u64,
    timeout: Duration,
    task: JoinHandle<()>,
}

impl Watchdog {
    pub fn new(on_expire: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        Self {
            on_expire: Arc::new(on_expire),
            generations: AtomicU64::new(0),
            armed: Mutex::new(None),
        }
    }

    /// Starts the countdown for `ticket`, replacing any other armed turn.
    pub fn arm(&self, ticket: u64, timeout: Duration) {
        let mut armed = self.armed.lock();
        if let Some(previous) = armed.take() {
            previous.task.abort();
        }
        let generation = self.next_generation();
        debug!(ticket, generation, timeout_ms = timeout.as_millis() as u64, "watchdog armed");
        *armed = Some(Armed {
            ticket,
            generation,
            timeout,
            task: self.spawn(ticket, generation, timeout),
        });
    }

    /// Restarts the countdown if `ticket` is the armed turn.
    pub fn reset(&self, ticket: u64) -> bool {
        let mut armed = self.armed.lock();
        match armed.as_mut() {
            Some(current) if current.ticket == ticket => {
                current.task.abort();
                current.generation = self.next_generation();
                current.task = self.spawn(ticket, current.generation, current.timeout);
                true
            }
            _ => false,
        }
    }

    pub fn disarm(&self, ticket: u64) {
        let mut armed = self.armed.lock();
        if armed.as_ref().is_some_and(|current| current.ticket == ticket)
            && let Some(current) = armed.take()
        {
            current.task.abort();
        }
    }

    /// Whether an expiry for `ticket` at `generation` still matches the armed
    /// countdown.
    pub fn is_current(&self, ticket: u64, generation: u64) -> bool {
        self.armed
            .lock()
            .as_ref()
            .is_some_and(|current| current.ticket == ticket && current.generation == generation)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn spawn(&self, ticket: u64, generation: u64, timeout: Duration) -> JoinHandle<()> {
        let on_expire = self.on_expire.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!(ticket, generation, "watchdog expired");
            on_expire(ticket, generation);
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.get_mut().take() {
            armed.task.abort();
        }
    }
}
