use crate::{Mutex, MutexGuard, Parker, RawLock, RawUnlock, SpinLock};
use alloc::collections::VecDeque;
use core::mem;

/// Condition variable, polymorphic over the lock protecting the predicate.
///
/// `wait` works with a [`Mutex`] over *any* raw discipline exposing the
/// [`RawLock`] + [`RawUnlock`] capabilities — a preemption lock and a
/// blocking handoff mutex queue through the same code path. The wait
/// sequence is the usual one: enqueue, announce the park, release the
/// caller's lock, sleep, re-acquire.
///
/// Wakeups may be spurious and the predicate is re-evaluated under the
/// re-acquired lock, so callers loop:
///
/// ```ignore
/// let mut g = m.lock();
/// while !ready(&g) {
///     g = cv.wait(g);
/// }
/// ```
pub struct Condvar<P: Parker> {
    parker: P,
    waiters: SpinLock<VecDeque<P::Id>>,
}

impl<P: Parker> Condvar<P> {
    pub fn new(parker: P) -> Self {
        Self {
            parker,
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Release the guard's lock, sleep until notified, re-acquire and
    /// return a fresh guard.
    pub fn wait<'a, T, R>(&self, guard: MutexGuard<'a, T, R>) -> MutexGuard<'a, T, R>
    where
        R: RawLock + RawUnlock,
    {
        let mutex: &'a Mutex<T, R> = MutexGuard::mutex(&guard);
        {
            let mut q = self.waiters.lock();
            q.push_back(self.parker.current());
            // Registering the park before releasing the caller's lock makes
            // a notify between unlock and sleep a remembered wakeup, not a
            // lost one.
            self.parker.prepare_park();
        }
        drop(guard);
        self.parker.park();
        mutex.lock()
    }

    /// Wake the longest-waiting thread, if any.
    pub fn notify_one(&self) {
        let id = self.waiters.lock().pop_front();
        if let Some(id) = id {
            self.parker.unpark(id);
        }
    }

    /// Wake every current waiter.
    ///
    /// The whole queue is detached in one step under the internal lock;
    /// threads that start waiting during the wakeups belong to the next
    /// generation and are not woken.
    pub fn notify_all(&self) {
        let woken = {
            let mut q = self.waiters.lock();
            mem::take(&mut *q)
        };
        for id in woken {
            self.parker.unpark(id);
        }
    }

    /// Number of threads currently waiting, for diagnostics.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}
