//! Sleeping lock: a holder may block for an unbounded time (device I/O,
//! waiting on another transaction), so waiters sleep on a condition variable
//! instead of spinning.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

pub struct SleepLock<T> {
    locked: Mutex<bool>,
    cv: Condvar,
    value: UnsafeCell<T>,
}

// `value` is only reached through `get`/`get_mut` by the holder of `locked`.
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: Mutex::new(false),
            cv: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.raw_lock();
        SleepLockGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock().unwrap()
    }

    /// Block until the lock is free, then take it. Pair with `raw_unlock`.
    pub fn raw_lock(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.cv.wait(locked).unwrap();
        }
        *locked = true;
    }

    pub fn raw_unlock(&self) {
        let mut locked = self.locked.lock().unwrap();
        assert!(*locked, "raw_unlock: lock not held");
        *locked = false;
        self.cv.notify_one();
    }

    /// # Safety
    /// The caller must hold the lock.
    pub unsafe fn get(&self) -> &T {
        &*self.value.get()
    }

    /// # Safety
    /// The caller must hold the lock and not alias the returned reference.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.value.get()
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.lock.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.lock.get_mut() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guards_serialize_holders() {
        let lock = Arc::new(SleepLock::new(0usize));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = lock.lock();
                        let v = *guard;
                        thread::yield_now();
                        *guard = v + 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
        assert!(!lock.is_locked());
    }
}
