//! Counting semaphore with FIFO-ordered blocking.

use crate::queue::Fifo;
use crate::sync::WouldBlock;
use crate::thread::{Current, ParkHandle};
use std::cell::{Cell, RefCell};

/// A counting semaphore.
///
/// The counter is never negative: a [`wait`] that finds it at zero parks
/// the calling thread instead of decrementing, and a [`signal`] releases
/// the longest-waiting thread. Waiters are released strictly in the order
/// their `wait` calls parked.
///
/// At the boundary of every operation the counter equals the number of
/// signals minus the number of completed waits since creation (plus the
/// initial value).
///
/// [`wait`]: Self::wait
/// [`signal`]: Self::signal
///
/// # Examples
///
/// ```
/// use std::rc::Rc;
/// use weft::sync::Semaphore;
/// use weft::{Completion, Scheduler, ThreadBuilder};
///
/// let sched = Scheduler::new();
/// let sem = Rc::new(Semaphore::new(0));
///
/// let waiter = sem.clone();
/// ThreadBuilder::new("waiter").spawn(&sched, move |cx| {
///     waiter.wait(cx);
/// });
///
/// let signaler = sem.clone();
/// ThreadBuilder::new("signaler").spawn(&sched, move |cx| {
///     signaler.signal(cx);
/// });
///
/// assert_eq!(sched.run(), Completion::AllFinished);
/// assert_eq!(sem.value(), 0);
/// ```
pub struct Semaphore {
    value: Cell<usize>,
    waiters: RefCell<Fifo<ParkHandle>>,
}

impl Semaphore {
    /// Creates a semaphore with the given initial counter value.
    pub fn new(initial: usize) -> Self {
        Self {
            value: Cell::new(initial),
            waiters: RefCell::new(Fifo::new()),
        }
    }

    /// The counter value at this instant.
    pub fn value(&self) -> usize {
        self.value.get()
    }

    /// Decrements the counter, parking until it is positive.
    ///
    /// A woken thread re-checks the counter before claiming a unit:
    /// repeated signals wake waiters one by one, and a unit signaled
    /// while the waiter was still queued may already have been claimed by
    /// a thread that never parked.
    pub fn wait(&self, cx: &Current) {
        loop {
            let pin = cx.pin();
            let value = self.value.get();
            if value > 0 {
                self.value.set(value - 1);
                return;
            }
            drop(pin);
            cx.park_with(|handle| self.waiters.borrow_mut().append(handle));
        }
    }

    /// Decrements the counter if it is positive, without ever parking.
    pub fn try_wait(&self, cx: &Current) -> Result<(), WouldBlock> {
        let _pin = cx.pin();
        let value = self.value.get();
        if value > 0 {
            self.value.set(value - 1);
            Ok(())
        } else {
            Err(WouldBlock)
        }
    }

    /// Increments the counter and releases the longest-waiting thread,
    /// if any. Never parks.
    pub fn signal(&self, cx: &Current) {
        let _pin = cx.pin();
        self.value.set(self.value.get() + 1);
        let head = self.waiters.borrow_mut().take();
        if let Some(handle) = head {
            handle.unpark();
        }
    }

    /// How many threads are parked in this semaphore's wait list.
    pub fn waiter_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}
