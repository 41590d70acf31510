//! Serialized execution of protocol work.
//!
//! All protocol state mutation happens on one `Strand`: datagram delivery,
//! timer expiry, and servicing are posted here as closures and run strictly
//! one at a time. Application threads never mutate protocol state directly;
//! they take short locks to enqueue work and let the strand do the sending.
//!
//! Blocking inside a posted closure is not allowed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A serialized executor backed by a single tokio task.
pub struct Strand {
    tx: mpsc::UnboundedSender<Task>,
}

impl Strand {
    /// Spawn the driver task. Must be called from within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let _ = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });
        Arc::new(Self { tx })
    }

    /// Enqueue a closure to run on the strand.
    ///
    /// Posts after shutdown are silently discarded: a send failure only
    /// means the driver task is gone.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(f));
    }
}

struct TimerInner {
    /// Bumped on every arm/cancel so stale expiries are ignored.
    generation: u64,
    deadline: Option<Instant>,
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// A rearm-able one-shot timer whose expiry runs on the strand.
///
/// At most one expiry is pending at any time: `wait` cancels any previous
/// arming before installing the new deadline.
pub struct ServiceTimer {
    strand: Arc<Strand>,
    inner: Mutex<TimerInner>,
}

impl ServiceTimer {
    pub fn new(strand: Arc<Strand>) -> Arc<Self> {
        Arc::new(Self {
            strand,
            inner: Mutex::new(TimerInner {
                generation: 0,
                deadline: None,
                callback: None,
            }),
        })
    }

    /// Install the expiry callback. Replaces any previous callback but does
    /// not touch a pending deadline.
    pub fn set_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().callback = Some(Arc::new(cb));
    }

    /// Arm (or rearm) the timer to fire after `after`.
    pub fn wait(self: &Arc<Self>, after: Duration) {
        let deadline = Instant::now() + after;
        let generation = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.deadline = Some(deadline);
            inner.generation
        };
        let this = Arc::clone(self);
        let _ = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.fire(generation);
        });
    }

    fn fire(&self, generation: u64) {
        let cb = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.deadline = None;
            inner.callback.clone()
        };
        if let Some(cb) = cb {
            self.strand.post(move || cb());
        }
    }

    /// Cancel a pending expiry, if any.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.deadline = None;
    }

    /// Time until the pending expiry, or `None` when the timer is idle.
    pub fn expires_in(&self) -> Option<Duration> {
        self.inner
            .lock()
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}
