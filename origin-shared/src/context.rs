//! Per-coroutine context ids for log correlation.
//!
//! Every session coroutine is stamped with a short opaque id; child
//! coroutines inherit the parent's id unless given a fresh one. The current
//! id is tracked per OS thread and swapped in and out around each poll of a
//! [ContextScope]-wrapped future, so any `log::` call made from inside a
//! session sees the right id via [current_cid].

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

const CID_LENGTH: usize = 8;

/// A short opaque string stamped on a running coroutine. Also used as the
/// client id in statistics and hook callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        ContextId(s.to_string())
    }
}

/// Generates a fresh random id, lowercase alphanumeric.
pub fn generate_cid() -> ContextId {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CID_LENGTH)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    ContextId(id)
}

thread_local! {
    static CURRENT_CID: RefCell<Option<ContextId>> = const { RefCell::new(None) };
}

/// The id of the coroutine currently being polled on this thread, if any.
pub fn current_cid() -> Option<ContextId> {
    CURRENT_CID.with(|c| c.borrow().clone())
}

fn swap_cid(cid: Option<ContextId>) -> Option<ContextId> {
    CURRENT_CID.with(|c| std::mem::replace(&mut *c.borrow_mut(), cid))
}

/// Future wrapper installing a context id for the duration of each poll.
pub struct ContextScope<F> {
    cid: ContextId,
    inner: F,
}

impl<F> ContextScope<F> {
    pub fn new(cid: ContextId, inner: F) -> Self {
        Self { cid, inner }
    }
}

impl<F: Future> Future for ContextScope<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: cid is never moved out; inner is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        let prev = swap_cid(Some(this.cid.clone()));
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
        let out = inner.poll(cx);
        swap_cid(prev);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_cid_shape() {
        let cid = generate_cid();
        assert_eq!(cid.as_str().len(), CID_LENGTH);
        assert!(cid
            .as_str()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_generate_cid_unique() {
        let a = generate_cid();
        let b = generate_cid();
        assert_ne!(a, b);
    }

    #[test]
    fn test_scope_installs_and_restores() {
        use std::task::{RawWaker, RawWakerVTable, Waker};

        fn noop_waker() -> Waker {
            fn clone(_: *const ()) -> RawWaker {
                RawWaker::new(std::ptr::null(), &VTABLE)
            }
            fn noop(_: *const ()) {}
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
            unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
        }

        let cid = ContextId::from("abcd1234");
        let observed = std::cell::RefCell::new(None);
        let fut = ContextScope::new(cid.clone(), async {
            // current_cid is visible from inside the scope
            current_cid()
        });
        futures_lite_poll(fut, &observed, noop_waker());
        assert_eq!(observed.borrow().clone().flatten(), Some(cid));
        assert_eq!(current_cid(), None);
    }

    fn futures_lite_poll<F: Future>(
        fut: F,
        out: &std::cell::RefCell<Option<F::Output>>,
        waker: std::task::Waker,
    ) {
        let mut fut = Box::pin(fut);
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
            *out.borrow_mut() = Some(v);
        }
    }
}
