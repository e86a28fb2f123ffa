//! Fixed-capacity producer/consumer channel.

use crate::sync::{Full, Semaphore, WouldBlock};
use crate::thread::Current;
use std::cell::{Cell, RefCell};

/// A bounded FIFO buffer for handing elements between threads.
///
/// Two semaphores carry all of the blocking: one counts free slots
/// (producers park on it when the buffer is full) and one counts filled
/// slots (consumers park on it when the buffer is empty). The ring
/// bookkeeping itself — `first`, `count` and the slot contents — is
/// updated inside a critical section, since the semaphores alone do not
/// protect it.
///
/// Elements come out in the order they went in.
///
/// # Examples
///
/// ```
/// use std::rc::Rc;
/// use weft::sync::BoundedBuffer;
/// use weft::{Completion, Scheduler, ThreadBuilder};
///
/// let sched = Scheduler::new();
/// let buffer = Rc::new(BoundedBuffer::new(2));
///
/// let producer = buffer.clone();
/// ThreadBuilder::new("producer").spawn(&sched, move |cx| {
///     for item in 1..=3 {
///         producer.add(cx, item);
///     }
/// });
///
/// let consumer = buffer.clone();
/// ThreadBuilder::new("consumer").spawn(&sched, move |cx| {
///     assert_eq!(consumer.take(cx), 1);
///     assert_eq!(consumer.take(cx), 2);
///     assert_eq!(consumer.take(cx), 3);
/// });
///
/// assert_eq!(sched.run(), Completion::AllFinished);
/// ```
pub struct BoundedBuffer<T> {
    /// Ring storage; an empty slot holds `None`, so a stale element can
    /// never be read twice.
    slots: RefCell<Box<[Option<T>]>>,
    /// Index of the oldest element.
    first: Cell<usize>,
    /// Number of occupied slots, `0..=capacity`.
    count: Cell<usize>,
    /// Free slots; producers wait on this.
    avail: Semaphore,
    /// Filled slots; consumers wait on this.
    used: Semaphore,
}

impl<T> BoundedBuffer<T> {
    /// Creates a buffer with room for `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded buffer requires a positive capacity");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: RefCell::new(slots.into_boxed_slice()),
            first: Cell::new(0),
            count: Cell::new(0),
            avail: Semaphore::new(capacity),
            used: Semaphore::new(0),
        }
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.slots.borrow().len()
    }

    /// The number of elements currently buffered.
    pub fn len(&self) -> usize {
        self.count.get()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.count.get() == 0
    }

    /// Appends `elem`, parking while the buffer is full.
    pub fn add(&self, cx: &Current, elem: T) {
        self.avail.wait(cx);
        let _pin = cx.pin();
        self.store(elem);
        self.used.signal(cx);
    }

    /// Appends `elem` if a slot is free, handing it back otherwise.
    pub fn try_add(&self, cx: &Current, elem: T) -> Result<(), Full<T>> {
        let _pin = cx.pin();
        if self.avail.try_wait(cx).is_err() {
            return Err(Full(elem));
        }
        self.store(elem);
        self.used.signal(cx);
        Ok(())
    }

    /// Removes the oldest element, parking while the buffer is empty.
    pub fn take(&self, cx: &Current) -> T {
        self.used.wait(cx);
        let _pin = cx.pin();
        let elem = self.load();
        self.avail.signal(cx);
        elem
    }

    /// Removes the oldest element if there is one, without ever parking.
    pub fn try_take(&self, cx: &Current) -> Result<T, WouldBlock> {
        let _pin = cx.pin();
        self.used.try_wait(cx)?;
        let elem = self.load();
        self.avail.signal(cx);
        Ok(elem)
    }

    fn store(&self, elem: T) {
        let mut slots = self.slots.borrow_mut();
        let index = (self.first.get() + self.count.get()) % slots.len();
        debug_assert!(slots[index].is_none(), "occupied slot about to be clobbered");
        slots[index] = Some(elem);
        self.count.set(self.count.get() + 1);
    }

    fn load(&self) -> T {
        let mut slots = self.slots.borrow_mut();
        let first = self.first.get();
        let elem = slots[first]
            .take()
            .expect("slot bookkeeping out of sync with the filled-slot semaphore");
        self.count.set(self.count.get() - 1);
        self.first.set((first + 1) % slots.len());
        elem
    }
}
