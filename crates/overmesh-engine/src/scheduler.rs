//! Cooperative scheduler: one engine thread owns the state, everything else
//! submits work.
//!
//! Tasks wake in monotonic order; at equal wake time the lower priority
//! value runs first, then insertion order.  Generator tasks return
//! `Some(delay)` to sleep and be rescheduled, `None` to finish.  The only
//! suspension points are those returns and [`Scheduler::call`] boundaries.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{error, warn};

/// Tasks below this priority are abandoned at shutdown; everything at or
/// above it is drained first.
pub const SHUTDOWN_PRIORITY_FLOOR: i32 = -512;

/// How long shutdown waits for the queue to drain before reporting an
/// improper stop.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Raised to pending callers when the engine stops before their task ran.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("early shutdown")]
pub struct EarlyShutdown;

enum Task<S> {
    Once(Box<dyn FnOnce(&mut S) + Send>),
    Generator(Box<dyn FnMut(&mut S) -> Option<Duration> + Send>),
}

struct Entry<S> {
    wake: Instant,
    priority: i32,
    seq: u64,
    task: Task<S>,
}

impl<S> PartialEq for Entry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<S> Eq for Entry<S> {}

impl<S> PartialOrd for Entry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Entry<S> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest wake, then the
        // lowest priority value, then the oldest submission pops first.
        other
            .wake
            .cmp(&self.wake)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Queue<S> {
    entries: BinaryHeap<Entry<S>>,
    next_seq: u64,
    done: bool,
}

type ExceptionHook = Box<dyn Fn(&str) + Send + Sync>;

struct Shared<S> {
    queue: Mutex<Queue<S>>,
    condvar: Condvar,
    shutdown: AtomicBool,
    hard_stop: AtomicBool,
    improper: AtomicBool,
    strict: AtomicBool,
    hook: Mutex<Option<ExceptionHook>>,
    engine_thread: Mutex<Option<thread::ThreadId>>,
}

/// Handle to the engine thread owning a state value of type `S`.
pub struct Scheduler<S: 'static> {
    shared: Arc<Shared<S>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<S: Send + 'static> Scheduler<S> {
    /// Spawn the engine thread around `state`.
    pub fn spawn(name: &str, state: S) -> Arc<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: BinaryHeap::new(),
                next_seq: 0,
                done: false,
            }),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            hard_stop: AtomicBool::new(false),
            improper: AtomicBool::new(false),
            strict: AtomicBool::new(false),
            hook: Mutex::new(None),
            engine_thread: Mutex::new(None),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(thread_shared, state))
            .expect("spawn engine thread");

        Arc::new(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Any panic inside a task is fatal and triggers shutdown.  Default for
    /// tests.
    pub fn set_strict(&self, strict: bool) {
        self.shared.strict.store(strict, Ordering::SeqCst);
    }

    /// Hook invoked with the panic message of any failed task.
    pub fn set_exception_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.hook.lock() = Some(Box::new(hook));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Fire-and-forget task at priority 0, runnable immediately.
    pub fn register(&self, f: impl FnOnce(&mut S) + Send + 'static) {
        self.register_with(Duration::ZERO, 0, f);
    }

    pub fn register_with(
        &self,
        delay: Duration,
        priority: i32,
        f: impl FnOnce(&mut S) + Send + 'static,
    ) {
        self.push(delay, priority, Task::Once(Box::new(f)));
    }

    /// Recurring task: each `Some(delay)` return suspends it for `delay`.
    pub fn register_generator(
        &self,
        delay: Duration,
        priority: i32,
        g: impl FnMut(&mut S) -> Option<Duration> + Send + 'static,
    ) {
        self.push(delay, priority, Task::Generator(Box::new(g)));
    }

    fn push(&self, delay: Duration, priority: i32, task: Task<S>) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry {
            wake: Instant::now() + delay,
            priority,
            seq,
            task,
        });
        self.shared.condvar.notify_all();
    }

    /// Run `f` on the engine thread and wait for its result.
    ///
    /// Must not be invoked from the engine thread itself: the state is
    /// exclusively borrowed there, so the call would deadlock.  Handlers
    /// already run with `&mut S` and never need this.
    pub fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, EarlyShutdown> {
        if Some(thread::current().id()) == *self.shared.engine_thread.lock() {
            panic!("Scheduler::call invoked from the engine thread");
        }
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(EarlyShutdown);
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.register(move |state| {
            let _ = tx.send(f(state));
        });
        rx.recv().map_err(|_| EarlyShutdown)
    }

    /// Stop the engine.  Pending tasks at priority >= [`SHUTDOWN_PRIORITY_FLOOR`]
    /// are woken immediately and given [`SHUTDOWN_GRACE`] to drain; tasks
    /// that keep rescheduling cause an improper stop.
    ///
    /// Returns true on a clean stop.
    pub fn shutdown(&self) -> bool {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        {
            let mut queue = self.shared.queue.lock();
            while !queue.done {
                if self
                    .shared
                    .condvar
                    .wait_until(&mut queue, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if !queue.done {
                warn!("engine did not drain within the shutdown grace period");
                self.shared.improper.store(true, Ordering::SeqCst);
                self.shared.hard_stop.store(true, Ordering::SeqCst);
                self.shared.condvar.notify_all();
            }
        }

        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        !self.shared.improper.load(Ordering::SeqCst)
    }

    /// True when a prior shutdown failed to drain ("improper stop").
    pub fn improper_stop(&self) -> bool {
        self.shared.improper.load(Ordering::SeqCst)
    }
}

fn run_loop<S>(shared: Arc<Shared<S>>, mut state: S) {
    *shared.engine_thread.lock() = Some(thread::current().id());

    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.hard_stop.load(Ordering::SeqCst) {
                    queue.entries.clear();
                }
                let shutting_down = shared.shutdown.load(Ordering::SeqCst);
                if shutting_down {
                    // Abandon exempt tasks, wake everything else now.
                    let drained = std::mem::take(&mut queue.entries);
                    let now = Instant::now();
                    for mut entry in drained.into_sorted_vec() {
                        if entry.priority < SHUTDOWN_PRIORITY_FLOOR {
                            continue;
                        }
                        entry.wake = entry.wake.min(now);
                        queue.entries.push(entry);
                    }
                    if queue.entries.is_empty() {
                        queue.done = true;
                        shared.condvar.notify_all();
                        return;
                    }
                }

                let now = Instant::now();
                match queue.entries.peek() {
                    Some(entry) if entry.wake <= now => break queue.entries.pop(),
                    Some(entry) => {
                        let wake = entry.wake;
                        shared.condvar.wait_until(&mut queue, wake);
                    }
                    None => {
                        shared.condvar.wait(&mut queue);
                    }
                }
            }
        };

        let Some(entry) = entry else { continue };
        run_task(&shared, &mut state, entry);
    }
}

fn run_task<S>(shared: &Arc<Shared<S>>, state: &mut S, entry: Entry<S>) {
    let Entry {
        priority,
        seq,
        task,
        ..
    } = entry;

    match task {
        Task::Once(f) => {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(state)));
            if let Err(panic) = result {
                handle_panic(shared, panic);
            }
        }
        Task::Generator(mut g) => {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| g(state)));
            match result {
                Ok(Some(delay)) => {
                    let mut queue = shared.queue.lock();
                    queue.entries.push(Entry {
                        wake: Instant::now() + delay,
                        priority,
                        seq,
                        task: Task::Generator(g),
                    });
                }
                Ok(None) => {}
                Err(panic) => handle_panic(shared, panic),
            }
        }
    }
}

fn handle_panic<S>(shared: &Arc<Shared<S>>, panic: Box<dyn std::any::Any + Send>) {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic".to_string());

    match &*shared.hook.lock() {
        Some(hook) => hook(&message),
        None => error!("engine task failed: {message}"),
    }

    if shared.strict.load(Ordering::SeqCst) {
        shared.shutdown.store(true, Ordering::SeqCst);
        shared.condvar.notify_all();
    }
}
