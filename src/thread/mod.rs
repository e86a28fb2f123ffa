//! Thread abstraction and the cooperative context-switch machinery.
//!
//! ## The threading model
//!
//! A running scheduler consists of a collection of threads, each with its
//! own heap-allocated stack and saved execution context. Exactly one
//! thread executes at a time; control moves between threads only at
//! explicit call points ([`Current::yield_now`], [`Current::park_with`],
//! thread exit). There is no preemption and no hardware parallelism, so
//! the correctness burden is about sequencing, not locking.
//!
//! Thread records are owned values. A record is held by exactly one place
//! at any moment: the scheduler's ready queue, a [`ParkHandle`] sitting in
//! some wait list, or the scheduler's `current` slot while the thread is
//! on the CPU. The record (and with it the stack) of a finished thread is
//! freed by the scheduler immediately after it switches away from it.

pub mod scheduler;

use scheduler::Scheduler;
use std::arch::naked_asm;
use std::cell::Cell;
use std::marker::PhantomPinned;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of each thread's stack.
pub const STACK_SIZE: usize = 0x100000;
/// Thread magic to detect stack overflow.
pub(crate) const THREAD_MAGIC: usize = 0xdeadbeefcafebabe;

/// The thread stack.
///
/// The region is `STACK_SIZE`-aligned so the whole struct occupies
/// exactly one stack-sized block; the magic word sits at the low end,
/// where a deeply overflowing stack will eventually trample it.
#[repr(C, align(0x100000))]
pub(crate) struct ThreadStack {
    pub(crate) magic: usize,
    /// Padding to fill up to [`STACK_SIZE`].
    pub(crate) _pad: [u8; STACK_SIZE - size_of::<usize>()],
    /// Marker of the (exclusive) end of the usable stack.
    pub(crate) _usable_marker: [u8; 0],
    /// Pinned.
    _pin: PhantomPinned,
}

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable and sits in the ready queue.
    Runnable,
    /// Thread is running on the CPU.
    Running,
    /// Thread is parked, waiting for a [`ParkHandle::unpark`].
    Parked,
    /// Thread has exited with an exit code.
    Exited(i32),
    /// The scheduler's root context (the caller of
    /// [`Scheduler::run`]); never queued, never parked.
    Idle,
}

fn next_tid() -> u64 {
    static TID: AtomicU64 = AtomicU64::new(0);
    TID.fetch_add(1, Ordering::SeqCst)
}

/// A thread record.
#[repr(C)]
pub(crate) struct Thread {
    /// The stack pointer saved on context switch.
    ///
    /// ## WARNING
    /// This field must stay at offset 0: the context-switch trampoline
    /// passes `&sp` of the outgoing thread in `rdi`, and the post-switch
    /// bookkeeping reinterprets that address as the record itself. Add
    /// new members **BELOW** this field.
    pub(crate) sp: usize,
    /// The stack region. `None` only for the root record, which runs on
    /// the caller's own OS stack.
    pub(crate) stack: Option<Box<ThreadStack>>,
    /// Thread id, unique within the process.
    pub(crate) tid: u64,
    /// Thread name.
    pub(crate) name: String,
    /// State of the thread.
    pub(crate) state: ThreadState,
    /// The scheduler this record belongs to; installed on first dispatch.
    pub(crate) sched: *const Scheduler,
    /// Exit code of the thread, observed by [`JoinHandle::join`].
    pub(crate) exit_status: Rc<Cell<Option<i32>>>,
    /// Dropper for the entry closure of a thread that never ran.
    pub(crate) pending_fn: Option<(unsafe fn(*mut ()), *mut ())>,
}

impl Thread {
    fn new<I>(name: I) -> Box<Self>
    where
        String: From<I>,
    {
        let mut stack: Box<ThreadStack> = unsafe { Box::new_uninit().assume_init() };
        stack.magic = THREAD_MAGIC;
        Box::new(Self {
            sp: 0,
            stack: Some(stack),
            tid: next_tid(),
            name: String::from(name),
            state: ThreadState::Runnable,
            sched: std::ptr::null(),
            exit_status: Rc::new(Cell::new(None)),
            pending_fn: None,
        })
    }

    /// Builds the record that stands in for the context calling
    /// [`Scheduler::run`]. It owns no green stack; its `sp` is filled in
    /// when the first dispatch switches away from the caller.
    pub(crate) fn new_root(sched: &Scheduler) -> Box<Self> {
        Box::new(Self {
            sp: 0,
            stack: None,
            tid: next_tid(),
            name: String::from("idle"),
            state: ThreadState::Idle,
            sched: sched as *const Scheduler,
            exit_status: Rc::new(Cell::new(None)),
            pending_fn: None,
        })
    }

    pub(crate) fn check_stack_magic(&self) {
        if let Some(stack) = self.stack.as_deref() {
            assert!(
                stack.magic == THREAD_MAGIC,
                "stack overflow detected on thread {} ({})",
                self.tid,
                self.name,
            );
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Reclaims the entry closure if the thread never started.
        if let Some((dropper, raw)) = self.pending_fn.take() {
            unsafe { dropper(raw) };
        }
    }
}

unsafe fn drop_raw_closure<F>(raw: *mut ()) {
    unsafe { drop(Box::from_raw(raw as *mut F)) };
}

/// A handle to join a thread.
///
/// Joining is cooperative: [`join`] yields until the target thread has
/// recorded its exit status.
///
/// [`join`]: Self::join
pub struct JoinHandle {
    tid: u64,
    exit_status: Rc<Cell<Option<i32>>>,
}

impl JoinHandle {
    pub(crate) fn new_for(th: &Thread) -> Self {
        Self {
            tid: th.tid,
            exit_status: th.exit_status.clone(),
        }
    }

    /// Thread id of the underlying thread.
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// The exit code, if the underlying thread has already exited.
    ///
    /// Unlike [`join`](Self::join) this never yields, so it can probe a
    /// thread's fate from outside the scheduler, e.g. after
    /// [`Scheduler::run`](scheduler::Scheduler::run) has returned.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.get()
    }

    /// Yields until the underlying thread exits and returns its exit
    /// code: `0` for a closure that returned normally, `-1` for one that
    /// panicked, or the explicit code passed to [`Current::exit`].
    pub fn join(self, cx: &Current) -> i32 {
        loop {
            if let Some(code) = self.exit_status.get() {
                return code;
            }
            cx.yield_now();
        }
    }
}

/// An owning handle to a parked thread.
///
/// The handle owns the thread record outright: while a thread is parked
/// its record lives in exactly one wait list, and releasing it is a move,
/// so a thread cannot be resumed twice or from two lists at once.
pub struct ParkHandle {
    pub(crate) th: Box<Thread>,
}

impl ParkHandle {
    /// Consumes the handle and makes the thread runnable again by
    /// appending it to the tail of the ready queue.
    ///
    /// The calling thread keeps the CPU; the unparked thread runs when
    /// the scheduler reaches it.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not parked. A handle for a non-parked
    /// thread means the state machine was corrupted by the caller.
    pub fn unpark(self) {
        let Self { mut th } = self;
        assert!(
            th.state == ThreadState::Parked,
            "tried to unpark thread {} ({}) in state {:?}",
            th.tid,
            th.name,
            th.state,
        );
        th.state = ThreadState::Runnable;
        let sched = unsafe { &*th.sched };
        sched.note_unparked();
        sched.enqueue(th);
    }
}

struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        // Unwinding out of the wait-list callback would drop the handle
        // that owns the running thread's own stack. Not survivable.
        std::process::abort();
    }
}

/// The capability handle of the running thread.
///
/// Every thread entry closure receives a `&Current` for the thread it
/// runs on. All operations that act on "the calling thread" — yielding,
/// parking, pinning, exiting — go through it, so they are only reachable
/// from code that is actually running on a scheduler thread.
pub struct Current {
    th: *mut Thread,
}

impl Current {
    /// The scheduler this thread belongs to.
    pub fn scheduler(&self) -> &Scheduler {
        unsafe { &*(*self.th).sched }
    }

    /// The calling thread's id.
    pub fn tid(&self) -> u64 {
        unsafe { (*self.th).tid }
    }

    /// The calling thread's name.
    pub fn name(&self) -> &str {
        unsafe { &(*self.th).name }
    }

    /// Voluntarily relinquishes the CPU.
    ///
    /// The calling thread goes to the tail of the ready queue and the
    /// head runs next. With no other runnable thread this is a no-op and
    /// the caller simply keeps running.
    pub fn yield_now(&self) {
        self.scheduler().reschedule();
    }

    /// Parks the calling thread.
    ///
    /// `f` receives the [`ParkHandle`] owning the calling thread and must
    /// record it in whatever wait list will later release it — parking
    /// performs no registration of its own. The call returns once some
    /// other thread calls [`ParkHandle::unpark`].
    ///
    /// # Panics
    ///
    /// Panics if called inside a critical section (see [`Current::pin`]).
    pub fn park_with(&self, f: impl FnOnce(ParkHandle)) {
        let sched = self.scheduler();
        assert!(
            !sched.is_pinned(),
            "tried to park a thread inside a critical section"
        );
        unsafe { (*self.th).state = ThreadState::Parked };
        sched.note_parked();
        let bomb = AbortOnUnwind;
        f(ParkHandle {
            th: unsafe { Box::from_raw(self.th) },
        });
        std::mem::forget(bomb);
        sched.reschedule();
    }

    /// Exits the calling thread with `exit_code`.
    ///
    /// The thread's stack and record are freed by the scheduler
    /// immediately after it switches away.
    pub fn exit(&self, exit_code: i32) -> ! {
        let sched = self.scheduler();
        unsafe {
            (*self.th).exit_status.set(Some(exit_code));
            (*self.th).state = ThreadState::Exited(exit_code);
        }
        sched.reschedule();
        unreachable!("an exited thread was dispatched again")
    }

    /// Enters a critical section.
    ///
    /// While the returned guard lives, any attempt to switch away from
    /// the calling thread (yield, park) fails loudly instead of leaving a
    /// shared structure half-updated. On a single-core cooperative
    /// scheduler this is the whole of mutual exclusion; there is no
    /// memory locking to do.
    ///
    /// Guards nest; drop them in reverse order of creation.
    pub fn pin(&self) -> PinGuard<'_> {
        let sched = self.scheduler();
        sched.pin();
        PinGuard { sched }
    }
}

/// A RAII guard for a critical section. See [`Current::pin`].
pub struct PinGuard<'a> {
    sched: &'a Scheduler,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.sched.unpin();
    }
}

// Context switch related code.

/// The context-switch magic.
///
/// Saves the System V callee-saved registers of the outgoing context,
/// parks its stack pointer in `*_current_sp`, installs `_next_sp` and
/// restores the incoming frame. `rdi` is untouched throughout, so the
/// tail call hands [`finish_context_switch`] the outgoing thread record
/// (`sp` is the record's first field).
#[unsafe(naked)]
unsafe extern "C" fn context_switch_trampoline(_current_sp: *mut usize, _next_sp: usize) {
    // RDI: current stack pointer storage. RSI: next stack pointer.
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Switch.
        "mov r8, rsp",
        "mov [rdi], r8",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // XXX: tail call, outgoing thread record travels in rdi.
        "jmp {}",
        sym finish_context_switch,
    );
}

/// Bookkeeping for the thread that was just switched away from. Runs on
/// the incoming thread's stack, which is the only safe place to free an
/// exited thread's record.
unsafe extern "C" fn finish_context_switch(prev: *mut Thread) {
    unsafe {
        match (*prev).state {
            ThreadState::Exited(code) => {
                let th = Box::from_raw(prev);
                log::debug!(
                    "thread {} ({}) finished with exit code {}",
                    th.tid,
                    th.name,
                    code
                );
                drop(th);
            }
            ThreadState::Running => {
                let sched = &*(*prev).sched;
                let mut th = Box::from_raw(prev);
                th.state = ThreadState::Runnable;
                sched.enqueue(th);
            }
            // A parked record is owned by its ParkHandle; the root record
            // is owned by the frame of Scheduler::run.
            ThreadState::Parked | ThreadState::Idle => {}
            ThreadState::Runnable => {
                unreachable!("thread state has been corrupted: {:?}", (*prev).state)
            }
        }
    }
}

/// The very beginning of a thread.
///
/// The initial frame leaves the record pointer, the closure pointer and
/// the monomorphized entry wrapper on the stack; the remaining
/// `end_of_stack` slot doubles as the entry's null return address, which
/// both terminates backtraces and keeps the System V stack-alignment
/// parity.
#[unsafe(naked)]
unsafe extern "C" fn start() -> ! {
    naked_asm!(
        "pop rdi",
        "pop rsi",
        "pop rax",
        "jmp rax",
    );
}

/// A struct to mimic the stack state of a suspended thread.
///
/// The first activation pops the six callee-saved slots and "returns"
/// into the [`start`] shim, which forwards `thread_ptr` and `thread_fn`
/// to the wrapper at `entry`.
#[repr(C)]
struct ContextSwitchFrame<F: FnOnce(&Current)> {
    _r15: usize,
    _r14: usize,
    _r13: usize,
    _r12: usize,
    _bx: usize,
    _bp: usize,
    ret_addr: usize,
    thread_ptr: *mut Thread,
    thread_fn: *mut F,
    entry: usize,
    end_of_stack: usize,
}

/// A builder for a new thread.
pub struct ThreadBuilder {
    th: Box<Thread>,
}

impl ThreadBuilder {
    /// Creates a new builder for a thread named `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            th: Thread::new(name),
        }
    }

    /// Spawns the thread onto `sched`'s ready queue and returns a handle
    /// to join it.
    ///
    /// The closure runs once the scheduler dispatches the thread; when it
    /// returns the thread exits with code 0, and if it panics the panic
    /// is caught at the thread boundary and the thread exits with -1.
    pub fn spawn<F>(self, sched: &Scheduler, thread_fn: F) -> JoinHandle
    where
        F: FnOnce(&Current) + 'static,
    {
        let th = self.into_thread(thread_fn);
        let handle = JoinHandle::new_for(&th);
        log::trace!("spawned thread {} ({})", th.tid, th.name);
        sched.enqueue(th);
        handle
    }

    fn into_thread<F>(self, thread_fn: F) -> Box<Thread>
    where
        F: FnOnce(&Current) + 'static,
    {
        extern "C" fn thread_start<F: FnOnce(&Current)>(th: *mut Thread, thread_fn: *mut F) -> ! {
            let thread_fn = unsafe { *Box::from_raw(thread_fn) };
            unsafe { (*th).pending_fn = None };
            let cx = Current { th };
            let code = match catch_unwind(AssertUnwindSafe(|| thread_fn(&cx))) {
                Ok(()) => 0,
                Err(_) => -1,
            };
            cx.exit(code)
        }

        let Self { mut th } = self;
        let th_ptr = &raw mut *th;
        let stack = th.stack.as_mut().expect("spawned threads own a stack");
        let frame = unsafe {
            ((&raw mut stack._usable_marker as usize - size_of::<ContextSwitchFrame<F>>())
                as *mut ContextSwitchFrame<F>)
                .as_mut()
                .unwrap()
        };
        frame.ret_addr = start as usize;
        frame.thread_ptr = th_ptr;
        frame.thread_fn = Box::into_raw(Box::new(thread_fn));
        frame.entry = thread_start::<F> as usize;
        frame.end_of_stack = 0;
        th.pending_fn = Some((drop_raw_closure::<F>, frame.thread_fn as *mut ()));
        th.sp = frame as *mut _ as usize;
        th
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_block_covers_exactly_one_region() {
        assert_eq!(size_of::<ThreadStack>(), STACK_SIZE);
        assert_eq!(align_of::<ThreadStack>(), STACK_SIZE);
    }

    #[test]
    fn initial_frame_keeps_stack_parity() {
        // Six saved registers, the shim return address, the three slots
        // the shim pops, and the null return address it leaves behind.
        assert_eq!(
            size_of::<ContextSwitchFrame<fn(&Current)>>(),
            11 * size_of::<usize>()
        );
        // The frame base must land on the call-style parity (rsp % 16 ==
        // 8) so the bookkeeping routine entered from the trampoline sees
        // a conventional stack.
        assert_eq!((STACK_SIZE - 11 * size_of::<usize>()) % 16, 8);
    }

    #[test]
    fn fresh_threads_are_runnable_with_magic_in_place() {
        let th = Thread::new("probe");
        assert_eq!(th.state, ThreadState::Runnable);
        th.check_stack_magic();
    }
}
