//! Semaphore counter arithmetic, FIFO wake order and deadlock reporting.

use std::cell::RefCell;
use std::rc::Rc;
use weft::sync::{Semaphore, WouldBlock};
use weft::{Completion, Scheduler, ThreadBuilder};

#[test]
fn counter_reflects_completed_waits_and_signals() {
    let sched = Scheduler::new();
    let sem = Rc::new(Semaphore::new(3));

    let worker = sem.clone();
    let handle = ThreadBuilder::new("worker").spawn(&sched, move |cx| {
        worker.wait(cx);
        worker.wait(cx);
        worker.signal(cx);
    });

    assert_eq!(sched.run(), Completion::AllFinished);
    assert_eq!(handle.exit_code(), Some(0));
    // initial 3, two completed waits, one signal.
    assert_eq!(sem.value(), 2);
}

#[test]
fn signals_before_waits_never_park() {
    let sched = Scheduler::new();
    let sem = Rc::new(Semaphore::new(0));

    let signaler = sem.clone();
    ThreadBuilder::new("signaler").spawn(&sched, move |cx| {
        signaler.signal(cx);
        signaler.signal(cx);
    });
    let waiter = sem.clone();
    let handle = ThreadBuilder::new("waiter").spawn(&sched, move |cx| {
        waiter.wait(cx);
        waiter.wait(cx);
    });

    assert_eq!(sched.run(), Completion::AllFinished);
    assert_eq!(handle.exit_code(), Some(0));
    assert_eq!(sem.value(), 0);
}

#[test]
fn waiters_wake_in_fifo_order() {
    let sched = Scheduler::new();
    let sem = Rc::new(Semaphore::new(0));
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["first", "second"] {
        let sem = sem.clone();
        let log = log.clone();
        ThreadBuilder::new(name).spawn(&sched, move |cx| {
            sem.wait(cx);
            log.borrow_mut().push(name);
        });
    }
    let signaler = sem.clone();
    let watcher = sem.clone();
    ThreadBuilder::new("signaler").spawn(&sched, move |cx| {
        assert_eq!(watcher.waiter_count(), 2);
        signaler.signal(cx);
        signaler.signal(cx);
    });

    assert_eq!(sched.run(), Completion::AllFinished);
    assert_eq!(*log.borrow(), vec!["first", "second"]);
    assert_eq!(sem.value(), 0);
    assert_eq!(sem.waiter_count(), 0);
}

#[test]
fn one_signal_releases_exactly_the_head_waiter() {
    let sched = Scheduler::new();
    let sem = Rc::new(Semaphore::new(0));
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b"] {
        let sem = sem.clone();
        let log = log.clone();
        ThreadBuilder::new(name).spawn(&sched, move |cx| {
            sem.wait(cx);
            log.borrow_mut().push(name);
        });
    }
    let signaler = sem.clone();
    ThreadBuilder::new("signaler").spawn(&sched, move |cx| {
        signaler.signal(cx);
    });

    // "b" can never be released: one signal, two waiters.
    assert_eq!(sched.run(), Completion::Deadlocked);
    assert_eq!(*log.borrow(), vec!["a"]);
    assert_eq!(sem.waiter_count(), 1);
}

#[test]
fn waiting_with_no_signaler_deadlocks() {
    let sched = Scheduler::new();
    let sem = Rc::new(Semaphore::new(0));

    let stuck = sem.clone();
    let handle = ThreadBuilder::new("stuck").spawn(&sched, move |cx| {
        stuck.wait(cx);
    });
    ThreadBuilder::new("busy").spawn(&sched, move |cx| {
        for _ in 0..3 {
            cx.yield_now();
        }
    });

    assert_eq!(sched.run(), Completion::Deadlocked);
    // The stuck thread never exited.
    assert_eq!(handle.exit_code(), None);
}

#[test]
fn try_wait_refuses_instead_of_parking() {
    let sched = Scheduler::new();
    let sem = Rc::new(Semaphore::new(0));

    let probe = sem.clone();
    let handle = ThreadBuilder::new("probe").spawn(&sched, move |cx| {
        assert_eq!(probe.try_wait(cx), Err(WouldBlock));
        probe.signal(cx);
        assert_eq!(probe.try_wait(cx), Ok(()));
        assert_eq!(probe.try_wait(cx), Err(WouldBlock));
    });

    assert_eq!(sched.run(), Completion::AllFinished);
    assert_eq!(handle.exit_code(), Some(0));
    assert_eq!(sem.value(), 0);
}
