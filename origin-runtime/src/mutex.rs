use shared::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tokio::sync::Notify;

/// Error-checked cooperative mutex: a coroutine that already holds the lock
/// must not re-lock it. Only meaningful across suspension points; plain
/// data shared between same-thread coroutines without awaits inside the
/// critical section needs no lock at all.
pub struct CoMutex<T> {
    inner: Rc<Inner<T>>,
}

struct Inner<T> {
    locked: Cell<bool>,
    owner: Cell<Option<tokio::task::Id>>,
    notify: Notify,
    value: RefCell<T>,
}

impl<T> Clone for CoMutex<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> CoMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(Inner {
                locked: Cell::new(false),
                owner: Cell::new(None),
                notify: Notify::new(),
                value: RefCell::new(value),
            }),
        }
    }

    /// Acquires the lock, suspending while another coroutine holds it.
    /// Re-locking by the owner is an error, not a deadlock.
    pub async fn lock(&self) -> Result<CoMutexGuard<'_, T>> {
        let me = tokio::task::try_id();
        if self.inner.locked.get() && me.is_some() && self.inner.owner.get() == me {
            return Err(Error::ErrMutexRelock);
        }
        while self.inner.locked.get() {
            self.inner.notify.notified().await;
        }
        self.inner.locked.set(true);
        self.inner.owner.set(me);
        Ok(CoMutexGuard { mutex: self })
    }
}

pub struct CoMutexGuard<'a, T> {
    mutex: &'a CoMutex<T>,
}

impl<T> std::fmt::Debug for CoMutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoMutexGuard").finish()
    }
}

impl<T> Deref for CoMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety of borrow: the lock flag serializes access between
        // coroutines; the guard's lifetime bounds the borrow.
        unsafe { &*self.mutex.inner.value.as_ptr() }
    }
}

impl<T> DerefMut for CoMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.inner.value.as_ptr() }
    }
}

impl<T> Drop for CoMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.inner.owner.set(None);
        self.mutex.inner.locked.set(false);
        self.mutex.inner.notify.notify_one();
    }
}
