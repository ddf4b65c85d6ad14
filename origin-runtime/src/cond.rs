use shared::error::{Error, Result};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;

/// Intra-thread condition variable in the cooperative model: waiters are
/// coroutines on the same thread, so there is no lost-wakeup race between a
/// state check and [Cond::wait] as long as no await sits between them.
#[derive(Clone, Default)]
pub struct Cond {
    inner: Rc<Inner>,
}

#[derive(Default)]
struct Inner {
    notify: Notify,
    // Generation counter so broadcast wakes exactly the current waiters.
    generation: Cell<u64>,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends until signaled or broadcast.
    pub async fn wait(&self) {
        self.inner.notify.notified().await;
    }

    /// Suspends until signaled, or until `d` elapses with
    /// [Error::ErrTimeout].
    pub async fn timedwait(&self, d: Duration) -> Result<()> {
        match tokio::time::timeout(d, self.inner.notify.notified()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::ErrTimeout),
        }
    }

    /// Wakes one waiting coroutine, if any. A signal with no waiter is
    /// remembered for the next wait (the permit model).
    pub fn signal(&self) {
        self.inner.notify.notify_one();
    }

    /// Wakes every coroutine currently waiting.
    pub fn broadcast(&self) {
        self.inner.generation.set(self.inner.generation.get() + 1);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Runtime;
    use crate::{spawn, yield_now};

    #[test]
    fn test_timedwait_times_out() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let cond = Cond::new();
            let r = cond.timedwait(Duration::from_millis(5)).await;
            assert_eq!(r.unwrap_err(), Error::ErrTimeout);
        });
    }

    #[test]
    fn test_signal_wakes_one() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let cond = Cond::new();
            let c2 = cond.clone();
            let waiter = spawn("w", async move {
                c2.wait().await;
                1
            });
            yield_now().await;
            cond.signal();
            assert_eq!(waiter.await.unwrap(), 1);
        });
    }

    #[test]
    fn test_broadcast_wakes_all() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let cond = Cond::new();
            let mut waiters = vec![];
            for _ in 0..3 {
                let c = cond.clone();
                waiters.push(spawn("w", async move {
                    c.wait().await;
                }));
            }
            yield_now().await;
            cond.broadcast();
            for w in waiters {
                w.await.unwrap();
            }
        });
    }
}
