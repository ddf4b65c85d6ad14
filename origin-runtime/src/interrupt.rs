use shared::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative cancellation sentinel. A session coroutine checks [pull] after
/// each yield point; external code calls [interrupt] to request termination.
/// Interrupt surfaces as [Error::ErrInterrupted], which outer loops treat as
/// graceful termination.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    interrupted: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests termination. Idempotent; wakes every coroutine parked in
    /// [interrupted].
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// The post-yield check: `interrupt.pull()?` in every session loop.
    pub fn pull(&self) -> Result<()> {
        if self.inner.interrupted.load(Ordering::Acquire) {
            Err(Error::ErrInterrupted)
        } else {
            Ok(())
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Parks until interrupted. Used to race against blocking I/O with
    /// `tokio::select!`.
    pub async fn interrupted(&self) {
        while !self.is_interrupted() {
            let notified = self.inner.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}
