//! The cooperative scheduler.
//!
//! All community processing runs on one dedicated worker thread. Any thread
//! may submit work through [`Scheduler::register`],
//! [`Scheduler::persistent_register`] and [`Scheduler::unregister`]; the
//! submissions are queued behind a mutex and merged into the worker's heaps
//! in one batch at the top of every loop iteration.
//!
//! # Ordering
//!
//! Pending tasks are ordered by deadline, then by descending priority, then
//! by submission order. Once a task is due it moves to a second heap ordered
//! by priority first, so tasks that become due together run strictly by
//! priority rather than by arrival.
//!
//! # Logical time
//!
//! `delay` is added to the scheduler's logical clock, not to the wall clock.
//! While a task runs, the clock is pinned to that task's deadline, so work
//! rescheduled from inside a task keeps its cadence regardless of jitter.
//!
//! # State machine
//!
//! ```text
//!                              -> fatal task error -> Exception
//!                             /
//! Init -> start() -> Running
//!                             \
//!                              -> stop() -> PleaseStop -> Finished
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};

/// Task priority, clamped to `[Priority::MIN, Priority::MAX]`.
///
/// Among tasks due at the same time, higher priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(i16);

impl Priority {
    /// Lowest priority.
    pub const MIN: Priority = Priority(-1024);
    /// Highest priority.
    pub const MAX: Priority = Priority(1024);
    /// Default priority.
    pub const DEFAULT: Priority = Priority(0);

    /// A priority, clamped into range.
    pub fn new(value: i32) -> Self {
        let clamped = value.clamp(Self::MIN.0 as i32, Self::MAX.0 as i32);
        // In range after the clamp.
        Priority(clamped as i16)
    }

    /// The numeric value.
    pub fn value(&self) -> i16 {
        self.0
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority::new(value)
    }
}

/// Identifier of a registered task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// Generated by the scheduler.
    Auto(u64),
    /// Chosen by the caller.
    Named(String),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Auto(n) => write!(f, "#{n}"),
            TaskId::Named(name) => f.write_str(name),
        }
    }
}

impl From<&str> for TaskId {
    fn from(name: &str) -> Self {
        TaskId::Named(name.to_string())
    }
}

impl From<String> for TaskId {
    fn from(name: String) -> Self {
        TaskId::Named(name)
    }
}

/// What a resumable task wants after one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Resume again after this long.
    Wait(Duration),
    /// Finished with a result.
    Done(T),
}

/// A task that runs in steps, yielding the worker between them.
pub trait Resumable: Send {
    /// Value produced when finished.
    type Output: Send + 'static;

    /// Run until the next suspension point.
    fn resume(&mut self) -> Result<Step<Self::Output>, TaskError>;

    /// Called instead of `resume` when the scheduler shuts down or the task
    /// is unregistered.
    fn cancel(&mut self) {}
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created, not started.
    Init,
    /// Worker is running tasks.
    Running,
    /// Stop requested.
    PleaseStop,
    /// Worker ended normally.
    Finished,
    /// Worker ended on a fatal task error.
    Exception,
}

type Continuation = Box<dyn FnOnce() + Send>;

enum JobStep {
    Wait(Duration),
    Finished(Option<Continuation>),
    Fatal(TaskError),
}

trait Job: Send {
    fn run(&mut self) -> JobStep;
    fn cancel(&mut self) {}
}

struct CallJob<T> {
    call: Option<Box<dyn FnOnce() -> Result<T, TaskError> + Send>>,
    on_done: Option<Box<dyn FnOnce(Result<T, TaskError>) + Send>>,
}

impl<T: Send + 'static> Job for CallJob<T> {
    fn run(&mut self) -> JobStep {
        let Some(call) = self.call.take() else {
            return JobStep::Finished(None);
        };
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Err(panic) => JobStep::Fatal(TaskError::Panicked(panic_message(panic))),
            Ok(Err(e)) if e.is_fatal() => JobStep::Fatal(e),
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::error!("task failed: {}", e);
                }
                JobStep::Finished(finish(self.on_done.take(), result))
            }
        }
    }
}

struct ResumableJob<R: Resumable> {
    task: R,
    on_done: Option<Box<dyn FnOnce(Result<R::Output, TaskError>) + Send>>,
}

impl<R: Resumable> Job for ResumableJob<R> {
    fn run(&mut self) -> JobStep {
        let task = &mut self.task;
        match panic::catch_unwind(AssertUnwindSafe(|| task.resume())) {
            Err(panic) => JobStep::Fatal(TaskError::Panicked(panic_message(panic))),
            Ok(Err(e)) if e.is_fatal() => JobStep::Fatal(e),
            Ok(Ok(Step::Wait(delay))) => JobStep::Wait(delay),
            Ok(Ok(Step::Done(value))) => JobStep::Finished(finish(self.on_done.take(), Ok(value))),
            Ok(Err(e)) => {
                tracing::error!("resumable task failed: {}", e);
                JobStep::Finished(finish(self.on_done.take(), Err(e)))
            }
        }
    }

    fn cancel(&mut self) {
        let task = &mut self.task;
        if panic::catch_unwind(AssertUnwindSafe(|| task.cancel())).is_err() {
            tracing::error!("resumable task panicked while cancelling");
        }
    }
}

struct ContinuationJob(Option<Continuation>);

impl Job for ContinuationJob {
    fn run(&mut self) -> JobStep {
        let Some(continuation) = self.0.take() else {
            return JobStep::Finished(None);
        };
        match panic::catch_unwind(AssertUnwindSafe(continuation)) {
            Ok(()) => JobStep::Finished(None),
            Err(panic) => JobStep::Fatal(TaskError::Panicked(panic_message(panic))),
        }
    }
}

fn finish<T: Send + 'static>(
    on_done: Option<Box<dyn FnOnce(Result<T, TaskError>) + Send>>,
    result: Result<T, TaskError>,
) -> Option<Continuation> {
    on_done.map(|callback| Box::new(move || callback(result)) as Continuation)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A unit of work for the scheduler.
///
/// ```ignore
/// scheduler.register(
///     Task::call(|| { do_work(); Ok(()) })
///         .delay(Duration::from_secs(5))
///         .priority(10),
/// );
/// ```
pub struct Task {
    job: Box<dyn Job>,
    delay: Duration,
    priority: Priority,
    id: Option<TaskId>,
}

impl Task {
    /// A one-shot call.
    pub fn call<F>(call: F) -> Self
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        Self::from_job(CallJob {
            call: Some(Box::new(call)),
            on_done: None,
        })
    }

    /// A one-shot call whose result, success or recoverable failure, is
    /// handed to `on_done` as a separate task at the same priority.
    pub fn call_then<F, T, C>(call: F, on_done: C) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        Self::from_job(CallJob {
            call: Some(Box::new(call)),
            on_done: Some(Box::new(on_done)),
        })
    }

    /// A resumable task.
    pub fn resumable<R: Resumable + 'static>(task: R) -> Self {
        Self::from_job(ResumableJob {
            task,
            on_done: None,
        })
    }

    /// A resumable task with a completion callback.
    pub fn resumable_then<R, C>(task: R, on_done: C) -> Self
    where
        R: Resumable + 'static,
        C: FnOnce(Result<R::Output, TaskError>) + Send + 'static,
    {
        Self::from_job(ResumableJob {
            task,
            on_done: Some(Box::new(on_done)),
        })
    }

    fn from_job(job: impl Job + 'static) -> Self {
        Self {
            job: Box::new(job),
            delay: Duration::ZERO,
            priority: Priority::DEFAULT,
            id: None,
        }
    }

    /// Run no earlier than `delay` from the scheduler's logical now.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("delay", &self.delay)
            .field("priority", &self.priority)
            .field("id", &self.id)
            .finish()
    }
}

struct Entry {
    deadline: Instant,
    priority: Priority,
    seq: u64,
    id: TaskId,
    job: Box<dyn Job>,
}

/// Min-heap on (deadline, -priority, seq).
struct Pending(Entry);

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then(self.0.priority.cmp(&other.0.priority))
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

/// Max-heap on (priority, -deadline, -seq).
struct Expired(Entry);

impl Ord for Expired {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.deadline.cmp(&self.0.deadline))
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for Expired {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Expired {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Expired {}

enum Action {
    Register(Entry),
    PersistentRegister(Entry),
    Unregister(TaskId),
}

/// The worker's private queues.
#[derive(Default)]
struct Queues {
    pending: BinaryHeap<Pending>,
    expired: BinaryHeap<Expired>,
    /// Entries per id across both heaps and the running task.
    counts: HashMap<TaskId, usize>,
}

impl Queues {
    fn apply(&mut self, action: Action) {
        match action {
            Action::Register(entry) => self.push(entry),
            Action::PersistentRegister(entry) => {
                if self.counts.get(&entry.id).copied().unwrap_or(0) > 0 {
                    tracing::debug!("persistent_register: {} already scheduled", entry.id);
                    return;
                }
                self.push(entry);
            }
            Action::Unregister(id) => self.unregister(&id),
        }
    }

    fn push(&mut self, entry: Entry) {
        *self.counts.entry(entry.id.clone()).or_insert(0) += 1;
        self.pending.push(Pending(entry));
    }

    fn release(&mut self, id: &TaskId) {
        if let Some(count) = self.counts.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(id);
            }
        }
    }

    fn unregister(&mut self, id: &TaskId) {
        if self.counts.remove(id).is_none() {
            return;
        }
        let mut removed = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        for Pending(entry) in pending.into_vec() {
            if entry.id == *id {
                removed.push(entry);
            } else {
                self.pending.push(Pending(entry));
            }
        }
        let expired = std::mem::take(&mut self.expired);
        for Expired(entry) in expired.into_vec() {
            if entry.id == *id {
                removed.push(entry);
            } else {
                self.expired.push(Expired(entry));
            }
        }
        tracing::debug!("unregistered {} ({} entries)", id, removed.len());
        for mut entry in removed {
            entry.job.cancel();
        }
    }

    fn promote(&mut self, now: Instant) {
        while self.pending.peek().is_some_and(|p| p.0.deadline <= now) {
            if let Some(Pending(entry)) = self.pending.pop() {
                self.expired.push(Expired(entry));
            }
        }
    }

    fn cancel_all(&mut self) {
        let pending = std::mem::take(&mut self.pending).into_vec().into_iter().map(|p| p.0);
        let expired = std::mem::take(&mut self.expired).into_vec().into_iter().map(|e| e.0);
        for mut entry in pending.chain(expired) {
            entry.job.cancel();
        }
        self.counts.clear();
    }
}

struct Inner {
    state: SchedulerState,
    exception: Option<TaskError>,
    next_seq: u64,
    next_id: u64,
    timestamp: Instant,
    actions: Vec<Action>,
    worker: Option<ThreadId>,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    config: SchedulerConfig,
    inner: Mutex<Inner>,
    /// Wakes the worker when work is submitted or stop is requested.
    wake: Condvar,
    /// Signals state transitions to `start` and `stop` callers.
    changed: Condvar,
}

/// Handle to a scheduler; clones share the same worker.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// A scheduler in the `Init` state.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    state: SchedulerState::Init,
                    exception: None,
                    next_seq: 0,
                    next_id: 0,
                    timestamp: Instant::now(),
                    actions: Vec::new(),
                    worker: None,
                    handle: None,
                }),
                wake: Condvar::new(),
                changed: Condvar::new(),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        self.shared.inner.lock().state
    }

    /// Whether the worker is running tasks.
    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Whether the worker has ended, normally or not.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            SchedulerState::Finished | SchedulerState::Exception
        )
    }

    /// The fatal error that stopped the worker, if any.
    pub fn exception(&self) -> Option<TaskError> {
        self.shared.inner.lock().exception.clone()
    }

    /// Whether the caller is the worker thread.
    pub fn is_current_thread(&self) -> bool {
        self.shared.inner.lock().worker == Some(thread::current().id())
    }

    /// Spawn the worker thread.
    ///
    /// With `wait`, blocks until the worker reports `Running`.
    pub fn start(&self, wait: bool) -> Result<(), SchedulerError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != SchedulerState::Init || inner.handle.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || run(shared))?;
        inner.handle = Some(handle);
        tracing::info!("scheduler thread {:?} started", self.shared.config.thread_name);

        if wait {
            while inner.state == SchedulerState::Init {
                self.shared.changed.wait(&mut inner);
            }
        }
        Ok(())
    }

    /// Ask the worker to stop without waiting. Safe from any thread.
    pub fn request_stop(&self) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            SchedulerState::Running | SchedulerState::Init if inner.handle.is_some() => {
                inner.state = SchedulerState::PleaseStop;
                tracing::debug!("scheduler state: PleaseStop");
                self.shared.wake.notify_one();
            }
            SchedulerState::Init => {
                inner.state = SchedulerState::Finished;
                self.shared.changed.notify_all();
            }
            _ => {}
        }
    }

    /// Stop the worker and wait up to the configured timeout.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        self.stop_timeout(self.shared.config.stop_timeout())
    }

    /// Stop the worker and wait up to `timeout`.
    ///
    /// Calling this from the worker thread would wait for itself; that is
    /// reported as [`SchedulerError::StopFromWorker`] and nothing is changed.
    /// Use [`request_stop`](Self::request_stop) there instead.
    pub fn stop_timeout(&self, timeout: Duration) -> Result<(), SchedulerError> {
        if self.is_current_thread() {
            return Err(SchedulerError::StopFromWorker);
        }
        self.request_stop();

        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while matches!(
            inner.state,
            SchedulerState::PleaseStop | SchedulerState::Running | SchedulerState::Init
        ) {
            if self.shared.changed.wait_until(&mut inner, deadline).timed_out() {
                tracing::warn!("scheduler did not stop within {:?}", timeout);
                return Err(SchedulerError::Timeout(timeout));
            }
        }
        let handle = inner.handle.take();
        drop(inner);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked during shutdown");
            }
        }
        Ok(())
    }

    /// Schedule a task and return its id.
    ///
    /// Tasks may be registered before `start`; they run once the worker does.
    pub fn register(&self, task: Task) -> TaskId {
        self.submit(task, false)
    }

    /// Schedule a task unless a task with the same id is already scheduled,
    /// running, or waiting for its completion callback.
    pub fn persistent_register(&self, id: impl Into<TaskId>, task: Task) -> TaskId {
        self.submit(task.id(id), true)
    }

    fn submit(&self, task: Task, persistent: bool) -> TaskId {
        let mut inner = self.shared.inner.lock();
        let id = match task.id {
            Some(id) => id,
            None => {
                inner.next_id += 1;
                TaskId::Auto(inner.next_id)
            }
        };
        inner.next_seq += 1;
        // Only the worker sees the pinned clock; other threads submit from wall time.
        let now = if inner.worker == Some(thread::current().id()) {
            inner.timestamp
        } else {
            Instant::now()
        };
        let entry = Entry {
            deadline: now + task.delay,
            priority: task.priority,
            seq: inner.next_seq,
            id: id.clone(),
            job: task.job,
        };
        tracing::trace!("register {} after {:?}", id, task.delay);
        inner.actions.push(if persistent {
            Action::PersistentRegister(entry)
        } else {
            Action::Register(entry)
        });
        self.shared.wake.notify_one();
        id
    }

    /// Remove every scheduled entry with this id.
    ///
    /// A task that is already executing finishes its current step.
    pub fn unregister(&self, id: &TaskId) {
        let mut inner = self.shared.inner.lock();
        inner.actions.push(Action::Unregister(id.clone()));
        self.shared.wake.notify_one();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("thread_name", &self.shared.config.thread_name)
            .field("state", &self.state())
            .finish()
    }
}

fn run(shared: Arc<Shared>) {
    {
        let mut inner = shared.inner.lock();
        if inner.state == SchedulerState::Init {
            inner.state = SchedulerState::Running;
            tracing::debug!("scheduler state: Running");
        }
        inner.worker = Some(thread::current().id());
    }
    shared.changed.notify_all();

    let idle = shared.config.idle_wait();
    let mut queues = Queues::default();

    loop {
        let mut inner = shared.inner.lock();
        if inner.state != SchedulerState::Running {
            break;
        }
        for action in inner.actions.drain(..) {
            queues.apply(action);
        }

        let now = Instant::now();
        queues.promote(now);
        inner.timestamp = queues.expired.peek().map(|e| e.0.deadline).unwrap_or(now);

        let Some(Expired(mut entry)) = queues.expired.pop() else {
            let wait = queues
                .pending
                .peek()
                .map(|p| p.0.deadline.saturating_duration_since(now))
                .unwrap_or(idle)
                .min(idle);
            tracing::trace!("wait: {:?}", wait);
            shared.wake.wait_for(&mut inner, wait);
            continue;
        };
        drop(inner);

        match entry.job.run() {
            JobStep::Wait(delay) => {
                entry.deadline += delay;
                queues.pending.push(Pending(entry));
            }
            JobStep::Finished(Some(continuation)) => {
                entry.job = Box::new(ContinuationJob(Some(continuation)));
                queues.expired.push(Expired(entry));
            }
            JobStep::Finished(None) => queues.release(&entry.id),
            JobStep::Fatal(error) => {
                tracing::error!("task {} raised fatal error: {}", entry.id, error);
                queues.release(&entry.id);
                let mut inner = shared.inner.lock();
                inner.state = SchedulerState::Exception;
                inner.exception = Some(error);
            }
        }
    }

    queues.cancel_all();

    let mut inner = shared.inner.lock();
    if inner.state != SchedulerState::Exception {
        inner.state = SchedulerState::Finished;
    }
    let unmerged = std::mem::take(&mut inner.actions);
    tracing::debug!("scheduler state: {:?}", inner.state);
    drop(inner);
    // Submissions that never reached the heaps are dropped with their captures.
    drop(unmerged);
    shared.changed.notify_all();
}
