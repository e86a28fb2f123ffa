//! # weft: a cooperative user-level threading library
//!
//! `weft` multiplexes many lightweight threads over one OS thread. There
//! is no preemption: a thread runs until it yields, parks on a
//! synchronization primitive, or returns — and only then does the
//! scheduler dispatch the next thread, in strict FIFO order. Because a
//! switch can never interrupt straight-line code, shared state needs no
//! locking at all; the only discipline is to not switch away in the
//! middle of a multi-step update, and the [`Current::pin`]
//! critical-section guard turns a violation of that rule into a loud
//! panic instead of silent corruption.
//!
//! Three layers build on each other:
//!
//! - [`Scheduler`] with [`ThreadBuilder`] — thread lifecycle, dispatch,
//!   and the final [`Completion`] verdict: all threads finished, or the
//!   survivors deadlocked.
//! - [`sync::Semaphore`] — a counting semaphore whose waiters park and
//!   are released FIFO.
//! - [`sync::BoundedBuffer`] — a fixed-capacity producer/consumer
//!   channel made of two semaphores and a ring.
//!
//! ## Example
//!
//! ```
//! use weft::{Completion, Scheduler, ThreadBuilder};
//!
//! let sched = Scheduler::new();
//! ThreadBuilder::new("ping").spawn(&sched, |cx| {
//!     for _ in 0..3 {
//!         cx.yield_now();
//!     }
//! });
//! ThreadBuilder::new("pong").spawn(&sched, |cx| {
//!     for _ in 0..3 {
//!         cx.yield_now();
//!     }
//! });
//! assert_eq!(sched.run(), Completion::AllFinished);
//! ```
//!
//! ## Blocking and deadlock
//!
//! A parked thread stays parked until another thread releases it; there
//! are no timeouts. When the ready queue drains while parked threads
//! remain, no thread can ever run again and [`Scheduler::run`] reports
//! [`Completion::Deadlocked`] — a legitimate outcome of a valid program,
//! distinct from the invariant violations (unparking a non-parked
//! thread, switching inside a critical section, stack overflow) that
//! panic instead.

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("weft's context switch is implemented only for x86_64 unix targets");

pub mod queue;
pub mod sync;
pub mod thread;

pub use thread::scheduler::{Completion, Scheduler};
pub use thread::{Current, JoinHandle, ParkHandle, PinGuard, STACK_SIZE, ThreadBuilder};
