//! Weft runtime: cooperative task scheduling for one node.
//!
//! Each node runs a `Scheduler` that multiplexes lightweight tasks — one
//! main-loop task plus one per in-flight inbound command. Tasks are backed
//! by OS threads, but a baton discipline (one `running` slot, a gate per
//! task) guarantees that at most one task executes at any instant, so
//! execution between suspension points is strictly serial and no task ever
//! observes another task's partial mutation. A task gives up the baton only
//! at [`SchedulerHandle::yield_now`], at [`Condition::wait`], or by
//! finishing.
//!
//! Shutdown is by poisoning rather than by unwinding:
//! [`SchedulerHandle::poison`] wakes every current and future waiter with
//! [`WaitOutcome::Poisoned`] and the scheduler drains the remaining tasks.
//! A task panic is captured, the scheduler drains the same way, and the
//! panic resumes on the node thread when [`Scheduler::run`] returns.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

// ── Wait outcomes ───────────────────────────────────────────────────────

/// Why a [`Condition`] wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Some task notified the condition.
    Notified,
    /// The deadline passed first. The waiter decides whether to retry or
    /// give up; nothing is cleaned up on its behalf.
    TimedOut,
    /// The scheduler is draining; this wait can never be satisfied.
    Poisoned,
}

type TaskId = u64;
type CondId = u64;

// ── Gate ────────────────────────────────────────────────────────────────

/// Per-task baton gate. A task thread parks here whenever it does not hold
/// the baton; the control loop opens the gate to hand it over.
struct Gate {
    run: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Gate {
            run: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        *run = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        while !*run {
            run = self.cv.wait(run).unwrap_or_else(|e| e.into_inner());
        }
        *run = false;
    }
}

// ── Scheduler state ─────────────────────────────────────────────────────

enum TaskState {
    Ready,
    Running,
    Waiting { cond: CondId },
}

struct TaskEntry {
    gate: Arc<Gate>,
    state: TaskState,
    /// Why the task was last moved out of `Waiting`; consumed on resume.
    wake: Option<WaitOutcome>,
    /// Deadline of a timed wait, cleared on wake.
    deadline: Option<Instant>,
}

struct SchedState {
    tasks: HashMap<TaskId, TaskEntry>,
    ready: VecDeque<TaskId>,
    running: Option<TaskId>,
    /// Tasks that have been spawned and not yet finished.
    live: usize,
    next_task: TaskId,
    next_cond: CondId,
    waiters: HashMap<CondId, Vec<TaskId>>,
    poisoned: bool,
    /// First escaped task panic, re-raised on the node thread.
    fault: Option<Box<dyn std::any::Any + Send>>,
    joins: Vec<thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<SchedState>,
    /// Signalled whenever the baton is returned or a task finishes.
    control: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

thread_local! {
    /// The (scheduler, task) executing on this thread, set for the whole
    /// life of a task thread.
    static CURRENT_TASK: RefCell<Option<(Arc<Shared>, TaskId)>> = const { RefCell::new(None) };
}

fn current_task() -> Option<(Arc<Shared>, TaskId)> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// Move a waiting task back to the ready set, recording why.
fn wake_task(st: &mut SchedState, task: TaskId, outcome: WaitOutcome) {
    if let Some(entry) = st.tasks.get_mut(&task) {
        entry.state = TaskState::Ready;
        entry.wake = Some(outcome);
        entry.deadline = None;
        st.ready.push_back(task);
    }
}

/// Wake every timed waiter whose deadline has passed.
fn expire_timers(st: &mut SchedState) {
    let now = Instant::now();
    let expired: Vec<(TaskId, CondId)> = st
        .tasks
        .iter()
        .filter_map(|(id, entry)| match (&entry.state, entry.deadline) {
            (TaskState::Waiting { cond }, Some(deadline)) if deadline <= now => {
                Some((*id, *cond))
            }
            _ => None,
        })
        .collect();
    for (task, cond) in expired {
        if let Some(list) = st.waiters.get_mut(&cond) {
            list.retain(|t| *t != task);
        }
        wake_task(st, task, WaitOutcome::TimedOut);
    }
}

fn earliest_deadline(st: &SchedState) -> Option<Instant> {
    st.tasks
        .values()
        .filter_map(|entry| entry.deadline)
        .min()
}

fn poison_locked(st: &mut SchedState) {
    if st.poisoned {
        return;
    }
    st.poisoned = true;
    let conds: Vec<CondId> = st.waiters.keys().copied().collect();
    for cond in conds {
        if let Some(list) = st.waiters.remove(&cond) {
            for task in list {
                wake_task(st, task, WaitOutcome::Poisoned);
            }
        }
    }
}

// ── Scheduler ───────────────────────────────────────────────────────────

/// The per-node scheduler. Created on the node thread; [`run`](Self::run)
/// consumes that thread until every task has finished.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Scheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedState {
                    tasks: HashMap::new(),
                    ready: VecDeque::new(),
                    running: None,
                    live: 0,
                    next_task: 0,
                    next_cond: 0,
                    waiters: HashMap::new(),
                    poisoned: false,
                    fault: None,
                    joins: Vec::new(),
                }),
                control: Condvar::new(),
            }),
        }
    }

    /// A cloneable handle for spawning tasks and creating conditions.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take over the current thread, run `entry` as the first task, and
    /// return once all tasks have completed.
    ///
    /// # Panics
    ///
    /// If any task panicked, the remaining tasks are drained (waiters wake
    /// with [`WaitOutcome::Poisoned`]) and the first panic payload is
    /// re-raised here.
    pub fn run(self, entry: impl FnOnce() + Send + 'static) {
        self.handle().spawn(entry);
        loop {
            let mut st = self.shared.lock();
            expire_timers(&mut st);
            if st.fault.is_some() {
                poison_locked(&mut st);
            }
            if st.live == 0 {
                let fault = st.fault.take();
                let joins = std::mem::take(&mut st.joins);
                drop(st);
                for join in joins {
                    let _ = join.join();
                }
                if let Some(payload) = fault {
                    panic::resume_unwind(payload);
                }
                return;
            }
            if st.running.is_some() {
                // A task holds the baton; wait for it to come back.
                drop(
                    self.shared
                        .control
                        .wait(st)
                        .unwrap_or_else(|e| e.into_inner()),
                );
                continue;
            }
            if let Some(task) = st.ready.pop_front() {
                let Some(entry) = st.tasks.get_mut(&task) else {
                    continue;
                };
                entry.state = TaskState::Running;
                let gate = Arc::clone(&entry.gate);
                st.running = Some(task);
                drop(st);
                gate.open();
                continue;
            }
            // Nothing runnable: sleep until the earliest timed wait expires.
            // With no timed waiters at all, only an external bug could leave
            // live tasks here, and blocking reports it as a visible hang.
            match earliest_deadline(&st) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    drop(
                        self.shared
                            .control
                            .wait_timeout(st, timeout)
                            .unwrap_or_else(|e| e.into_inner())
                            .0,
                    );
                }
                None => drop(
                    self.shared
                        .control
                        .wait(st)
                        .unwrap_or_else(|e| e.into_inner()),
                ),
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ── SchedulerHandle ─────────────────────────────────────────────────────

/// Shared access to one node's scheduler, usable from any of its tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Add a task to the ready set.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let gate = Arc::new(Gate::new());
        let shared = Arc::clone(&self.shared);
        let mut st = self.shared.lock();
        let task = st.next_task;
        st.next_task += 1;
        st.tasks.insert(
            task,
            TaskEntry {
                gate: Arc::clone(&gate),
                state: TaskState::Ready,
                wake: None,
                deadline: None,
            },
        );
        st.ready.push_back(task);
        st.live += 1;
        let join = thread::Builder::new()
            .name(format!("weft-task-{task}"))
            .spawn(move || task_main(shared, task, &gate, f))
            .unwrap_or_else(|e| panic!("spawning task thread: {e}"));
        st.joins.push(join);
        trace!(task, "task spawned");
    }

    /// Voluntarily hand the baton over; this task re-enters the ready set
    /// behind the tasks already queued. A no-op outside a task, or when no
    /// other task is runnable.
    pub fn yield_now(&self) {
        let Some((shared, task)) = current_task() else {
            return;
        };
        let gate = {
            let mut st = shared.lock();
            expire_timers(&mut st);
            if st.ready.is_empty() {
                return;
            }
            let Some(entry) = st.tasks.get_mut(&task) else {
                return;
            };
            entry.state = TaskState::Ready;
            let gate = Arc::clone(&entry.gate);
            st.ready.push_back(task);
            st.running = None;
            shared.control.notify_one();
            gate
        };
        gate.wait();
    }

    /// Create a fresh [`Condition`] on this scheduler.
    #[must_use]
    pub fn condition(&self) -> Condition {
        let mut st = self.shared.lock();
        let id = st.next_cond;
        st.next_cond += 1;
        Condition {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Mark the scheduler draining and wake every waiter with
    /// [`WaitOutcome::Poisoned`]. Later waits return `Poisoned` at once.
    pub fn poison(&self) {
        let mut st = self.shared.lock();
        poison_locked(&mut st);
        trace!("scheduler poisoned");
    }

    /// Whether [`poison`](Self::poison) has been called.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.shared.lock().poisoned
    }

    /// Whether any task other than the caller is ready to run.
    #[must_use]
    pub fn has_runnable(&self) -> bool {
        let mut st = self.shared.lock();
        expire_timers(&mut st);
        !st.ready.is_empty()
    }

    /// The nearest deadline among timed waiters, if any.
    #[must_use]
    pub fn earliest_deadline(&self) -> Option<Instant> {
        earliest_deadline(&self.shared.lock())
    }

    /// Wake timed waiters whose deadline has passed.
    pub fn expire_timers(&self) {
        expire_timers(&mut self.shared.lock());
    }
}

fn task_main(shared: Arc<Shared>, task: TaskId, gate: &Gate, f: impl FnOnce()) {
    gate.wait();
    CURRENT_TASK.with(|c| *c.borrow_mut() = Some((Arc::clone(&shared), task)));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    let mut st = shared.lock();
    st.tasks.remove(&task);
    st.live -= 1;
    st.running = None;
    if let Err(payload) = result {
        trace!(task, "task panicked");
        if st.fault.is_none() {
            st.fault = Some(payload);
        }
    } else {
        trace!(task, "task finished");
    }
    shared.control.notify_one();
}

// ── Condition ───────────────────────────────────────────────────────────

/// Suspend/notify primitive private to one scheduler. Atomicity comes from
/// the baton discipline: a waiter registers and a notifier fires only while
/// holding the baton, so no external mutex is needed around the state the
/// condition protects.
#[derive(Clone)]
pub struct Condition {
    shared: Arc<Shared>,
    id: CondId,
}

impl Condition {
    /// Suspend the current task until notified (or the scheduler drains).
    ///
    /// # Panics
    ///
    /// Must be called from a task of the owning scheduler.
    pub fn wait(&self) -> WaitOutcome {
        self.wait_inner(None)
    }

    /// Suspend the current task until notified, but no longer than
    /// `timeout` past the next scheduling point.
    ///
    /// # Panics
    ///
    /// Must be called from a task of the owning scheduler.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        self.wait_inner(Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> WaitOutcome {
        let Some((shared, task)) = current_task() else {
            panic!("Condition::wait outside a scheduler task");
        };
        let gate = {
            let mut st = shared.lock();
            if st.poisoned {
                return WaitOutcome::Poisoned;
            }
            let Some(entry) = st.tasks.get_mut(&task) else {
                panic!("Condition::wait from an unknown task");
            };
            entry.state = TaskState::Waiting { cond: self.id };
            entry.deadline = deadline;
            let gate = Arc::clone(&entry.gate);
            st.waiters.entry(self.id).or_default().push(task);
            st.running = None;
            shared.control.notify_one();
            gate
        };
        gate.wait();
        let mut st = shared.lock();
        st.tasks
            .get_mut(&task)
            .and_then(|entry| entry.wake.take())
            .unwrap_or(WaitOutcome::Notified)
    }

    /// Make the longest-waiting task runnable, then yield so the notifier
    /// does not monopolize the scheduler.
    pub fn notify(&self) {
        self.wake_waiters(false);
    }

    /// Make every waiting task runnable, then yield.
    pub fn notify_all(&self) {
        self.wake_waiters(true);
    }

    fn wake_waiters(&self, all: bool) {
        let woke = {
            let mut st = self.shared.lock();
            let woken: Vec<TaskId> = match st.waiters.get_mut(&self.id) {
                Some(list) if !list.is_empty() => {
                    if all {
                        std::mem::take(list)
                    } else {
                        vec![list.remove(0)]
                    }
                }
                _ => Vec::new(),
            };
            for task in &woken {
                wake_task(&mut st, *task, WaitOutcome::Notified);
            }
            !woken.is_empty()
        };
        if woke {
            SchedulerHandle {
                shared: Arc::clone(&self.shared),
            }
            .yield_now();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn log(log: &Log, entry: &'static str) {
        log.lock().unwrap().push(entry);
    }

    #[test]
    fn entry_runs_before_spawned_tasks() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let order: Log = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let h = handle.clone();
        sched.run(move || {
            log(&o, "entry");
            let o2 = Arc::clone(&o);
            h.spawn(move || log(&o2, "a"));
            let o3 = Arc::clone(&o);
            h.spawn(move || log(&o3, "b"));
            h.yield_now();
            log(&o, "entry-resumed");
        });
        assert_eq!(*order.lock().unwrap(), ["entry", "a", "b", "entry-resumed"]);
    }

    #[test]
    fn yield_without_other_tasks_is_a_noop() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let order: Log = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        sched.run(move || {
            handle.yield_now();
            log(&o, "still-here");
        });
        assert_eq!(*order.lock().unwrap(), ["still-here"]);
    }

    #[test]
    fn notify_hands_over_to_the_waiter() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let order: Log = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        let h = handle.clone();
        sched.run(move || {
            let cond = h.condition();
            let waiter_cond = cond.clone();
            let o2 = Arc::clone(&o);
            h.spawn(move || {
                assert_eq!(waiter_cond.wait(), WaitOutcome::Notified);
                log(&o2, "woken");
            });
            h.yield_now();
            cond.notify();
            log(&o, "notifier-resumed");
        });
        assert_eq!(*order.lock().unwrap(), ["woken", "notifier-resumed"]);
    }

    #[test]
    fn notify_all_wakes_every_waiter() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let woken = Arc::new(Mutex::new(0u32));
        let h = handle.clone();
        let w = Arc::clone(&woken);
        sched.run(move || {
            let cond = h.condition();
            for _ in 0..3 {
                let c = cond.clone();
                let w2 = Arc::clone(&w);
                h.spawn(move || {
                    assert_eq!(c.wait(), WaitOutcome::Notified);
                    *w2.lock().unwrap() += 1;
                });
            }
            h.yield_now();
            cond.notify_all();
        });
        assert_eq!(*woken.lock().unwrap(), 3);
    }

    #[test]
    fn timed_wait_expires_without_notification() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let outcome = Arc::new(Mutex::new(None));
        let h = handle.clone();
        let out = Arc::clone(&outcome);
        sched.run(move || {
            let cond = h.condition();
            let out2 = Arc::clone(&out);
            h.spawn(move || {
                *out2.lock().unwrap() = Some(cond.wait_timeout(Duration::from_millis(20)));
            });
        });
        assert_eq!(*outcome.lock().unwrap(), Some(WaitOutcome::TimedOut));
    }

    #[test]
    fn timed_wait_prefers_notification() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let outcome = Arc::new(Mutex::new(None));
        let h = handle.clone();
        let out = Arc::clone(&outcome);
        sched.run(move || {
            let cond = h.condition();
            let waiter_cond = cond.clone();
            let out2 = Arc::clone(&out);
            h.spawn(move || {
                *out2.lock().unwrap() = Some(waiter_cond.wait_timeout(Duration::from_secs(30)));
            });
            h.yield_now();
            cond.notify();
        });
        assert_eq!(*outcome.lock().unwrap(), Some(WaitOutcome::Notified));
    }

    #[test]
    fn poison_wakes_all_waiters() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let h = handle.clone();
        let out = Arc::clone(&outcomes);
        sched.run(move || {
            for _ in 0..2 {
                let cond = h.condition();
                let out2 = Arc::clone(&out);
                h.spawn(move || {
                    out2.lock().unwrap().push(cond.wait());
                });
            }
            h.yield_now();
            h.poison();
        });
        assert_eq!(
            *outcomes.lock().unwrap(),
            [WaitOutcome::Poisoned, WaitOutcome::Poisoned]
        );
    }

    #[test]
    fn wait_after_poison_returns_immediately() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let h = handle.clone();
        sched.run(move || {
            h.poison();
            let cond = h.condition();
            assert_eq!(cond.wait(), WaitOutcome::Poisoned);
        });
    }

    #[test]
    fn task_panic_resumes_on_the_node_thread() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let caught = panic::catch_unwind(AssertUnwindSafe(move || {
            sched.run(move || {
                handle.spawn(|| panic!("task exploded"));
            });
        }));
        let payload = caught.unwrap_err();
        let text = payload.downcast_ref::<&str>().copied().unwrap_or_default();
        assert_eq!(text, "task exploded");
    }

    #[test]
    fn panic_drains_remaining_waiters() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let outcome = Arc::new(Mutex::new(None));
        let h = handle.clone();
        let out = Arc::clone(&outcome);
        let caught = panic::catch_unwind(AssertUnwindSafe(move || {
            sched.run(move || {
                let cond = h.condition();
                let out2 = Arc::clone(&out);
                h.spawn(move || {
                    *out2.lock().unwrap() = Some(cond.wait());
                });
                h.yield_now();
                panic!("entry exploded");
            });
        }));
        assert!(caught.is_err());
        assert_eq!(*outcome.lock().unwrap(), Some(WaitOutcome::Poisoned));
    }
}
