//! Cooperative single-threaded fiber runtime.
//!
//! Each thread can run one runtime at a time with [start]. Fibers are stackful coroutines which
//! only switch when they [park], so code between two suspension points never interleaves with
//! another fiber. A parked fiber resumes when its [Waker] is scheduled or its deadline passes.
//!
//! Lifetimes are structured: a fiber that finished its closure waits for its children before it
//! releases its stack, and [start] returns once every fiber spawned inside it has finished.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use std::{cmp, hint, mem, panic, thread};

use crate::coroutine::{Coroutine, CoroutineId, Stats};
use crate::report::{self, Panic};

mod context_switch;
mod stack;
mod tls;

const DEFAULT_USABLE_PAGES: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(pages) => pages,
    None => panic!(),
};

/// Fiber stack geometry, in 4 KiB pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Inaccessible pages below each stack, faulting on overflow.
    pub guard_pages: NonZeroUsize,
    /// Pages available to each fiber.
    pub usable_pages: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            guard_pages: NonZeroUsize::MIN,
            usable_pages: DEFAULT_USABLE_PAGES,
        }
    }
}

const DEADLOCK: &str = "deadlock: every fiber is parked and no timer is pending";

/// Runs [f] as the root fiber of a new runtime on the current thread.
///
/// Returns once [f] and every fiber it (transitively) spawned have finished.
/// A panic in [f] is returned rather than propagated, and so is a deadlock: once every fiber is
/// parked with no deadline pending, the parked fibers are abandoned and a panic payload is returned.
///
/// # Panics
/// If a runtime is already running on this thread.
pub fn start<F: FnOnce() -> T, T>(f: F) -> thread::Result<T> {
    start_with(Config::default(), f)
}

/// Same as [start] with custom stack geometry.
pub fn start_with<F: FnOnce() -> T, T>(config: Config, f: F) -> thread::Result<T> {
    tls::exclusive_runtime(config, || {
        let (original, root) = tls::runtime(|runtime| {
            let root_fiber = runtime.create_fiber::<F, T>(f, start_trampoline::<F, T>, None);
            runtime.running_fiber = Some(root_fiber);

            (
                runtime.original.as_mut_ptr(),
                &runtime.running().continuation as *const context_switch::Continuation,
            )
        });

        unsafe { context_switch::jump(original, root) };

        let abandoned = tls::runtime(|runtime| {
            if !runtime.is_deadlocked {
                return Ok(unsafe { runtime.running().stack.union_ref::<thread::Result<T>>().read() });
            }

            // values living on the abandoned stacks are leaked, the stacks themselves are reused
            let fibers: Vec<FiberState> = runtime.fibers.drain().collect();
            runtime.stack_pool.extend(fibers.iter().map(|fiber| fiber.stack));
            Err(fibers)
        });

        match abandoned {
            Ok(output) => output,
            Err(fibers) => {
                log::error!("{DEADLOCK}, abandoning {} coroutine(s)", fibers.len());
                drop(fibers); // pending deferred callbacks may touch the runtime
                Err(Box::new(DEADLOCK) as Box<dyn Any + Send>)
            }
        }
    })
}

/// Whether a runtime is running on the current thread.
pub fn is_active() -> bool {
    tls::try_runtime(|_| ()).is_some()
}

extern "C" fn start_trampoline<F: FnOnce() -> T, T>() -> ! {
    // execute closure
    let closure: F = tls::runtime(|rt| unsafe { rt.running().stack.union_ref::<F>().read() });
    let result = panic::catch_unwind(panic::AssertUnwindSafe(closure));
    hint::black_box(&result); // removing this causes a segfault in release mode

    tls::runtime(|runtime| unsafe {
        runtime.running().stack.union_mut::<thread::Result<T>>().write(result);
    });

    exit_running();

    // deallocate stack, the output stays readable until the runtime drops the pool
    let original = tls::runtime(|runtime| {
        let stack = runtime.running().stack;
        runtime.stack_pool.push(stack);
        runtime.original.as_ptr()
    });

    // return to original thread
    let mut dummy = mem::MaybeUninit::uninit();
    unsafe { context_switch::jump(dummy.as_mut_ptr(), original) };
    unreachable!()
}

/// Spawns a new fiber which runs after the fibers that are already ready.
///
/// A panic escaping [f] is handed to the installed [report::Reporter].
///
/// # Panics
/// If called outside of a fiber.
pub fn spawn<F: FnOnce() + 'static>(f: F) -> Coroutine {
    tls::runtime(|runtime| {
        let parent = runtime.running_fiber();
        let child = runtime.create_fiber::<F, ()>(f, spawn_trampoline::<F>, Some(parent));
        runtime.ready_fibers.push_back(child);
        runtime.fibers[parent.0].children.insert(child);

        Coroutine::new(runtime.fibers[child.0].id)
    })
}

extern "C" fn spawn_trampoline<F: FnOnce()>() -> ! {
    // execute closure
    let closure: F = tls::runtime(|rt| unsafe { rt.running().stack.union_ref::<F>().read() });
    let result = panic::catch_unwind(panic::AssertUnwindSafe(closure));
    hint::black_box(&result); // removing this causes a segfault in release mode

    if let Err(payload) = result {
        report::report(&Panic::new(payload));
    }

    exit_running();

    // cleanup parent, deallocate stack
    let next = tls::runtime(|runtime| {
        let index = runtime.running_fiber();
        let fiber = runtime.fibers.remove(index.0);

        if let Some(parent_index) = fiber.parent {
            let parent = &mut runtime.fibers[parent_index.0];
            parent.children.remove(&index);

            if parent.is_completed && parent.children.is_empty() {
                runtime.unpark(parent_index);
            }
        }

        runtime.stack_pool.push(fiber.stack);
        runtime.next_continuation()
    });

    // continue to next fiber
    let mut dummy = mem::MaybeUninit::uninit();
    unsafe { context_switch::jump(dummy.as_mut_ptr(), next) };
    unreachable!()
}

/// Drains the running fiber's deferred callbacks, then waits for its children.
fn exit_running() {
    // callbacks deferred by a callback land on top of the stack and run next
    while let Some(deferred) = tls::runtime(|rt| rt.running().defers.pop()) {
        if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(deferred)) {
            report::report(&Panic::new(payload));
        }
    }

    let has_children = tls::runtime(|runtime| {
        let fiber = runtime.running();
        fiber.is_completed = true;
        let (id, has_children) = (fiber.id, !fiber.children.is_empty());

        runtime.live.remove(&id);
        log::trace!("coroutine {id} finished");

        has_children
    });

    if has_children {
        park(|_| {}); // woken up by last child
    }
}

/// Registers [f] to run when the running fiber exits.
///
/// # Panics
/// If called outside of a fiber.
pub(crate) fn defer(f: Box<dyn FnOnce()>) {
    tls::runtime(|runtime| runtime.running().defers.push(f));
}

/// Runs [f] against the runtime of the current thread, if any.
pub(crate) fn inspect<T>(f: impl FnOnce(&RuntimeState) -> T) -> Option<T> {
    tls::try_runtime(|runtime| f(runtime))
}

/// Suspends the running fiber until [Waker::schedule] is called on the waker passed to [schedule].
pub fn park(schedule: impl FnOnce(Waker)) {
    park_timeout(None, schedule);
}

/// Suspends the running fiber until its waker is scheduled or [timeout] elapses.
///
/// Returns `false` if the fiber was resumed by the deadline rather than a [Waker].
/// `None` waits indefinitely.
pub fn park_timeout(timeout: Option<Duration>, schedule: impl FnOnce(Waker)) -> bool {
    let waker = tls::runtime(|runtime| runtime.prepare_park(timeout));
    schedule(waker);

    // continue to next fiber
    let (running, next) = tls::runtime(|runtime| {
        (
            &mut runtime.running().continuation as *mut context_switch::Continuation,
            runtime.next_continuation(),
        )
    });
    unsafe { context_switch::jump(running, next) };

    tls::runtime(|runtime| !mem::take(&mut runtime.running().timed_out))
}

/// Reschedules the running fiber behind every fiber that is already ready.
pub fn yield_now() {
    park(|waker| {
        waker.schedule();
    });
}

/// Handle for scheduling a parked fiber.
///
/// Only valid for the park it was created for, waking a fiber through a stale waker does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waker {
    fiber: FiberIndex,
    token: u64,
}

impl Waker {
    /// Wake up the parked fiber to be run at some point.
    ///
    /// Returns `false` if the fiber was already woken, by another waker or by its deadline.
    pub fn schedule(self) -> bool {
        tls::try_runtime(|runtime| self.schedule_with(runtime)).unwrap_or(false)
    }

    /// Whether the fiber is still parked waiting for this waker.
    pub fn is_parked(&self) -> bool {
        tls::try_runtime(|runtime| runtime.is_parked_by(self)).unwrap_or(false)
    }

    fn schedule_with(self, runtime: &mut RuntimeState) -> bool {
        if !runtime.is_parked_by(&self) {
            return false;
        }

        runtime.unpark(self.fiber);
        true
    }
}

pub(crate) struct RuntimeState {
    config: Config,
    fibers: slab::Slab<FiberState>,
    live: BTreeMap<CoroutineId, FiberIndex>,
    ready_fibers: VecDeque<FiberIndex>,
    running_fiber: Option<FiberIndex>,
    timers: BTreeMap<(Instant, u64), FiberIndex>,
    stack_pool: Vec<StackBase>,
    original: mem::MaybeUninit<context_switch::Continuation>,
    last_id: u64,
    last_token: u64,
    peak: usize,
    spawned: u64,
    is_deadlocked: bool,
}

impl RuntimeState {
    fn new(config: Config) -> Self {
        RuntimeState {
            config,
            fibers: slab::Slab::new(),
            live: BTreeMap::new(),
            ready_fibers: VecDeque::new(),
            running_fiber: None,
            timers: BTreeMap::new(),
            stack_pool: Vec::new(),
            original: mem::MaybeUninit::uninit(),
            last_id: 0,
            last_token: 0,
            peak: 0,
            spawned: 0,
            is_deadlocked: false,
        }
    }

    /// [U] is the type the trampoline writes back into the stack union, if any.
    fn create_fiber<F, U>(
        &mut self,
        f: F,
        trampoline: extern "C" fn() -> !,
        parent: Option<FiberIndex>,
    ) -> FiberIndex {
        // allocate stack
        let config = self.config;
        let mut stack_base = self.stack_pool.pop().unwrap_or_else(|| {
            let stack = stack::Stack::new(config.guard_pages, config.usable_pages)
                .expect("failed to allocate fiber stack");
            StackBase(stack.into_base())
        });

        unsafe { stack_base.union_mut::<F>().write(f) };

        self.last_id += 1;
        let id = CoroutineId::new(self.last_id);
        let parent_id = parent.map(|index| self.fibers[index.0].id);

        let index = FiberIndex(self.fibers.insert(FiberState {
            id,
            parent,
            parent_id,
            stack: stack_base,
            continuation: unsafe {
                context_switch::prepare_stack(
                    stack_base.after_union::<F, thread::Result<U>>(),
                    trampoline,
                )
            },
            children: BTreeSet::new(),
            defers: Vec::new(),
            park: None,
            timed_out: false,
            is_completed: false,
        }));

        self.live.insert(id, index);
        self.peak = cmp::max(self.peak, self.live.len());
        self.spawned += 1;
        log::trace!("coroutine {id} spawned");

        index
    }

    fn running_fiber(&self) -> FiberIndex {
        self.running_fiber.expect("not running inside a fiber")
    }

    fn running(&mut self) -> &mut FiberState {
        let fiber_index = self.running_fiber();
        &mut self.fibers[fiber_index.0]
    }

    fn prepare_park(&mut self, timeout: Option<Duration>) -> Waker {
        self.last_token += 1;
        let token = self.last_token;
        let fiber = self.running_fiber();

        // a deadline too far to represent is no deadline
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        if let Some(deadline) = deadline {
            self.timers.insert((deadline, token), fiber);
        }

        let state = &mut self.fibers[fiber.0];
        state.park = Some(Park { token, deadline });
        state.timed_out = false;

        Waker { fiber, token }
    }

    fn is_parked_by(&self, waker: &Waker) -> bool {
        self.fibers
            .get(waker.fiber.0)
            .and_then(|fiber| fiber.park)
            .is_some_and(|park| park.token == waker.token)
    }

    fn unpark(&mut self, fiber: FiberIndex) {
        if let Some(park) = self.fibers[fiber.0].park.take() {
            if let Some(deadline) = park.deadline {
                self.timers.remove(&(deadline, park.token));
            }

            self.ready_fibers.push_back(fiber);
        }
    }

    fn expire_timers(&mut self, now: Instant) {
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }

            let ((_, token), fiber) = entry.remove_entry();
            let state = &mut self.fibers[fiber.0];
            if state.park.is_some_and(|park| park.token == token) {
                state.park = None;
                state.timed_out = true;
                self.ready_fibers.push_back(fiber);
            }
        }
    }

    fn next_continuation(&mut self) -> *const context_switch::Continuation {
        loop {
            self.expire_timers(Instant::now());

            if let Some(fiber) = self.ready_fibers.pop_front() {
                self.running_fiber = Some(fiber);
                break &self.fibers[fiber.0].continuation as *const context_switch::Continuation;
            }

            // nothing can make progress until the nearest deadline
            match self.timers.keys().next() {
                Some(&(deadline, _)) => thread::sleep(deadline.saturating_duration_since(Instant::now())),
                None => {
                    // return to original thread, start reports it
                    self.is_deadlocked = true;
                    break self.original.as_ptr();
                }
            }
        }
    }

    pub(crate) fn current_id(&self) -> Option<CoroutineId> {
        self.running_fiber.map(|index| self.fibers[index.0].id)
    }

    /// `None` if [id] isn't alive, `Some(None)` for the root fiber.
    pub(crate) fn parent_of(&self, id: CoroutineId) -> Option<Option<CoroutineId>> {
        self.live.get(&id).map(|index| self.fibers[index.0].parent_id)
    }

    pub(crate) fn exists(&self, id: CoroutineId) -> bool {
        self.live.contains_key(&id)
    }

    pub(crate) fn list(&self) -> Vec<CoroutineId> {
        self.live.keys().copied().collect()
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            coroutine_num: self.live.len(),
            coroutine_peak_num: self.peak,
            spawned_total: self.spawned,
            ready_num: self.ready_fibers.len(),
            timer_num: self.timers.len(),
        }
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        let Config {
            guard_pages,
            usable_pages,
        } = self.config;

        for stack_base in self.stack_pool.drain(..) {
            drop(unsafe { stack::Stack::from_base(stack_base.0, guard_pages, usable_pages) });
        }
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FiberIndex(usize);

struct FiberState {
    id: CoroutineId,
    parent: Option<FiberIndex>,
    parent_id: Option<CoroutineId>,
    stack: StackBase,
    continuation: context_switch::Continuation,
    children: BTreeSet<FiberIndex>,
    defers: Vec<Box<dyn FnOnce()>>,
    park: Option<Park>,
    timed_out: bool,
    is_completed: bool,
}

#[derive(Debug, Copy, Clone)]
struct Park {
    token: u64,
    deadline: Option<Instant>,
}

/// Upper address of a fiber's stack memory, stack addresses grow downwards.
/// The union of the user's closure and its output is stored at the top of the stack to save space in [FiberState].
#[derive(Debug, Copy, Clone)]
struct StackBase(*mut u8);

impl StackBase {
    unsafe fn union_ref<U>(&self) -> *const U {
        (self.0 as *const U).sub(1)
    }

    unsafe fn union_mut<U>(&mut self) -> *mut U {
        (self.0 as *mut U).sub(1)
    }

    unsafe fn after_union<F, U>(&self) -> *mut u8 {
        let union_size = cmp::max(mem::size_of::<F>(), mem::size_of::<U>());
        self.0.sub(union_size)
    }
}
