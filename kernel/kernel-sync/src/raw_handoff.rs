use crate::{Parker, RawLock, RawUnlock, SpinLock};
use alloc::collections::VecDeque;
use log::trace;

struct State<Id> {
    owner: Option<Id>,
    waiters: VecDeque<Id>,
}

/// Fair blocking lock with FIFO direct handoff.
///
/// Contenders never spin: a thread that finds the lock held enqueues itself
/// and parks. On release, ownership is assigned to the *front* waiter
/// before it is woken, so a released lock can never be stolen by a late
/// arrival — waiters acquire in strict FIFO order and the longest waiter
/// observes bounded delay.
pub struct RawHandoff<P: Parker> {
    parker: P,
    state: SpinLock<State<P::Id>>,
}

impl<P: Parker> RawHandoff<P> {
    pub fn new(parker: P) -> Self {
        Self {
            parker,
            state: SpinLock::new(State {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Current queue length, for diagnostics.
    pub fn contenders(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl<P: Parker> RawLock for RawHandoff<P> {
    fn raw_lock(&self) {
        let me = self.parker.current();

        let mut st = self.state.lock();
        if st.owner.is_none() {
            st.owner = Some(me);
            return;
        }
        debug_assert!(st.owner != Some(me), "handoff lock is not reentrant");

        st.waiters.push_back(me);
        trace!("thread {me:?} queues on contended lock");
        self.parker.prepare_park();
        drop(st);

        loop {
            self.parker.park();
            // Handoff: the releaser wrote `owner = me` before the unpark,
            // so anything else is a spurious wakeup.
            let st = self.state.lock();
            if st.owner == Some(me) {
                return;
            }
            self.parker.prepare_park();
            drop(st);
        }
    }

    fn raw_try_lock(&self) -> bool {
        let me = self.parker.current();
        let mut st = self.state.lock();
        if st.owner.is_none() {
            st.owner = Some(me);
            true
        } else {
            false
        }
    }
}

impl<P: Parker> RawUnlock for RawHandoff<P> {
    unsafe fn raw_unlock(&self) {
        let next = {
            let mut st = self.state.lock();
            debug_assert!(st.owner.is_some(), "unlock of an unheld lock");
            match st.waiters.pop_front() {
                Some(next) => {
                    st.owner = Some(next);
                    Some(next)
                }
                None => {
                    st.owner = None;
                    None
                }
            }
        };
        if let Some(next) = next {
            trace!("lock handed off to thread {next:?}");
            self.parker.unpark(next);
        }
    }
}
