use crate::interrupt::Interrupt;
use shared::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

type Task = (String, Pin<Box<dyn Future<Output = Result<()>>>>);

/// Single-consumer FIFO for offloading slow side effects (HTTP hooks, file
/// notifications) from the ingest path. Producers never block; task failures
/// are logged and never propagate back.
pub struct AsyncCallWorker {
    tx: mpsc::UnboundedSender<Task>,
    interrupt: Interrupt,
}

impl AsyncCallWorker {
    /// Creates the worker and spawns its consumer coroutine.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let interrupt = Interrupt::new();
        let i2 = interrupt.clone();
        crate::spawn("async-call-worker", async move {
            Self::cycle(rx, i2).await;
        });
        Self { tx, interrupt }
    }

    /// Enqueues a task without blocking. Returns an error only if the worker
    /// has stopped.
    pub fn execute<F>(&self, label: &str, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + 'static,
    {
        self.tx
            .send((label.to_string(), Box::pin(task)))
            .map_err(|_| Error::Other("async worker stopped".to_string()))
    }

    pub fn stop(&self) {
        self.interrupt.interrupt();
    }

    async fn cycle(mut rx: mpsc::UnboundedReceiver<Task>, interrupt: Interrupt) {
        loop {
            tokio::select! {
                task = rx.recv() => {
                    let Some((label, fut)) = task else {
                        return;
                    };
                    if let Err(e) = fut.await {
                        log::warn!("async call {} failed: {}", label, e);
                    }
                }
                _ = interrupt.interrupted() => {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Runtime;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_tasks_run_in_order() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let worker = AsyncCallWorker::start();
            let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
            for i in 0..3 {
                let seen = seen.clone();
                worker
                    .execute("t", async move {
                        seen.borrow_mut().push(i);
                        Ok(())
                    })
                    .unwrap();
            }
            crate::usleep(std::time::Duration::from_millis(10)).await;
            assert_eq!(&*seen.borrow(), &[0, 1, 2]);
            worker.stop();
        });
    }

    #[test]
    fn test_failure_does_not_stop_worker() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let worker = AsyncCallWorker::start();
            let ran = Rc::new(Cell::new(false));
            worker
                .execute("bad", async { Err(Error::Other("boom".to_string())) })
                .unwrap();
            let r2 = ran.clone();
            worker
                .execute("good", async move {
                    r2.set(true);
                    Ok(())
                })
                .unwrap();
            crate::usleep(std::time::Duration::from_millis(10)).await;
            assert!(ran.get());
            worker.stop();
        });
    }
}
