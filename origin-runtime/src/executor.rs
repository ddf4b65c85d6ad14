use shared::context::{current_cid, generate_cid, ContextId, ContextScope};
use shared::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinHandle, LocalSet};

/// Sentinel for I/O calls that must never time out.
pub const NO_TIMEOUT: Option<Duration> = None;

/// The per-thread cooperative runtime: a current-thread tokio reactor plus a
/// local task set. Coroutines spawned onto it never move across threads, so
/// session state needs no locks between them.
pub struct Runtime {
    rt: tokio::runtime::Runtime,
    local: LocalSet,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(Self {
            rt,
            local: LocalSet::new(),
        })
    }

    /// Runs the given root coroutine to completion, driving every coroutine
    /// spawned from inside it.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.local.block_on(&self.rt, fut)
    }
}

/// Spawns a coroutine on the current thread's local set. The child inherits
/// the parent's context id; root coroutines (no parent id) get a fresh one.
///
/// Must be called from within [Runtime::block_on].
pub fn spawn<F>(label: &str, fut: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let cid = current_cid().unwrap_or_else(generate_cid);
    log::debug!("spawn coroutine {}, cid={}", label, cid);
    tokio::task::spawn_local(ContextScope::new(cid, fut))
}

/// Spawns a root coroutine with its own fresh context id, e.g. one accepted
/// connection. Returns the id so callers can report it (stats client id).
pub fn spawn_with_cid<F>(label: &str, fut: F) -> (ContextId, JoinHandle<F::Output>)
where
    F: Future + 'static,
    F::Output: 'static,
{
    let cid = generate_cid();
    log::debug!("spawn coroutine {}, cid={}", label, cid);
    let handle = tokio::task::spawn_local(ContextScope::new(cid.clone(), fut));
    (cid, handle)
}

/// Voluntary reschedule; lets the poller and peer coroutines run.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// Timed wait. Suspends the calling coroutine for at least `d`.
pub async fn usleep(d: Duration) {
    tokio::time::sleep(d).await;
}

/// Applies an optional per-call timeout to an I/O future, surfacing
/// expiry as the distinct timeout error kind rather than EOF.
pub async fn io_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        None => fut.await,
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(r) => r,
            Err(_) => Err(Error::ErrTimeout),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_inherits_cid() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (cid, handle) = spawn_with_cid("parent", async {
                let parent = current_cid().unwrap();
                let child = spawn("child", async { current_cid().unwrap() });
                (parent, child.await.unwrap())
            });
            let (parent, child) = handle.await.unwrap();
            assert_eq!(parent, cid);
            assert_eq!(child, cid);
        });
    }

    #[test]
    fn test_io_timeout_expires() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let r: Result<()> = io_timeout(Some(Duration::from_millis(5)), async {
                usleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
            assert_eq!(r.unwrap_err(), Error::ErrTimeout);
        });
    }

    #[test]
    fn test_no_timeout_sentinel() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let r = io_timeout(NO_TIMEOUT, async { Ok(42) }).await;
            assert_eq!(r.unwrap(), 42);
        });
    }
}
