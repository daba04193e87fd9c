//! A cooperative scheduler for lightweight tasks.
//!
//! Each OS thread runs one [`Scheduler`]. Tasks are plain futures that are
//! polled on that thread only, so they need neither be `Send` nor take any
//! locks for state confined to the thread. A task suspends itself by
//! awaiting a [`WaitEvent`] obtained from [`Scheduler::wait_event`]. The
//! wait is registered in the thread's [`WaiterRegistry`] under a
//! [`WaitKey`] and ends either when some event source calls
//! [`Scheduler::deliver`] for it or when its timeout passes and the run
//! loop calls [`Scheduler::expire`].
//!
//! The scheduler itself never blocks. The run loop of the thread polls the
//! runnable tasks via [`Scheduler::run_ready`], then waits on the
//! multiplexer no longer than [`Scheduler::next_deadline`] allows.

use core::cell::{Cell, Ref, RefCell, RefMut};
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::{Context, Poll};
use core::time::Duration;

use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use futures_util::task::{waker, ArcWake};
use parking_lot::Mutex;
use tracing::{error, trace};

pub mod waiters;

pub use self::waiters::{
    ExactKey, WaitError, WaitKey, WaiterId, WaiterRegistry,
};

//------------ TaskId --------------------------------------------------------

/// Identifies a task of a scheduler.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u64);

//------------ Outcome and Completion ----------------------------------------

/// How a wait ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// An event was delivered with this payload.
    ///
    /// An empty payload signals an error by convention of the event
    /// sources.
    Delivered(Vec<u8>),

    /// The timeout passed before anything was delivered.
    TimedOut,
}

/// The result of a finished wait.
#[derive(Debug)]
pub struct Completion {
    /// How the wait ended.
    pub outcome: Outcome,

    /// The key in the state it had when the wait ended.
    ///
    /// This carries the near miss counter and partial TCP transfers back
    /// to the task.
    pub key: WaitKey,
}

//------------ ReadyQueue and TaskWaker --------------------------------------

/// The queue of tasks to poll next.
///
/// Wakers may be used from any thread, hence the lock.
#[derive(Debug, Default)]
struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
}

/// The waker of a task.
#[derive(Debug)]
struct TaskWaker {
    id: TaskId,

    /// Whether the task is in the ready queue already.
    queued: AtomicBool,

    ready: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::AcqRel) {
            arc_self.ready.queue.lock().push_back(arc_self.id);
        }
    }
}

//------------ Task ----------------------------------------------------------

/// The future of a task.
pub type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

struct Task {
    /// The future, taken out while it is being polled.
    future: Option<LocalTask>,

    waker: Arc<TaskWaker>,
}

//------------ Scheduler -----------------------------------------------------

/// The cooperative scheduler of one thread.
///
/// Cloning the value gives another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

struct Inner {
    tasks: RefCell<HashMap<TaskId, Task>>,
    next_task: Cell<u64>,
    ready: Arc<ReadyQueue>,
    waiters: RefCell<WaiterRegistry>,
    deadlines: RefCell<BTreeSet<(Instant, WaiterId)>>,
    completions: RefCell<HashMap<WaiterId, Completion>>,

    /// The task count published for other threads.
    load: Arc<AtomicUsize>,
}

impl Scheduler {
    /// Creates a new scheduler without any tasks.
    pub fn new() -> Self {
        Self::with_load_counter(Default::default())
    }

    /// Creates a new scheduler publishing its task count to `load`.
    pub fn with_load_counter(load: Arc<AtomicUsize>) -> Self {
        Scheduler {
            inner: Rc::new(Inner {
                tasks: Default::default(),
                next_task: Cell::new(0),
                ready: Default::default(),
                waiters: Default::default(),
                deadlines: Default::default(),
                completions: Default::default(),
                load,
            }),
        }
    }

    /// Creates a new task and schedules it for an immediate first run.
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = TaskId(self.inner.next_task.get());
        self.inner.next_task.set(id.0 + 1);
        let waker = Arc::new(TaskWaker {
            id,
            queued: AtomicBool::new(true),
            ready: self.inner.ready.clone(),
        });
        let len = {
            let mut tasks = self.inner.tasks.borrow_mut();
            tasks.insert(
                id,
                Task {
                    future: Some(Box::pin(future)),
                    waker,
                },
            );
            tasks.len()
        };
        self.inner.ready.queue.lock().push_back(id);
        self.inner.load.store(len, Ordering::Relaxed);
        id
    }

    /// Registers a wait for `key` that ends after `timeout` at the latest.
    ///
    /// The registration happens right away so that events arriving before
    /// the returned future is first polled are not lost. Dropping the
    /// future before it resolved removes the registration again.
    pub fn wait_event(
        &self,
        key: WaitKey,
        timeout: Duration,
    ) -> Result<WaitEvent, WaitError> {
        let deadline = Instant::now() + timeout;
        let id = self.inner.waiters.borrow_mut().insert(key, deadline)?;
        self.inner.deadlines.borrow_mut().insert((deadline, id));
        Ok(WaitEvent {
            sched: self.clone(),
            id,
            done: false,
        })
    }

    /// Ends the wait of a registered entry with the given payload.
    ///
    /// Returns whether there was such an entry.
    pub fn deliver(&self, id: WaiterId, payload: Vec<u8>) -> bool {
        self.complete(id, Outcome::Delivered(payload))
    }

    /// Ends all waits whose deadline is not after `now`.
    ///
    /// Returns the number of waits ended.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut deadlines = self.inner.deadlines.borrow_mut();
            let mut expired = Vec::new();
            while let Some(&(deadline, id)) = deadlines.first() {
                if deadline > now {
                    break;
                }
                deadlines.pop_first();
                expired.push(id);
            }
            expired
        };
        expired
            .into_iter()
            .filter(|id| self.complete(*id, Outcome::TimedOut))
            .count()
    }

    /// Returns the earliest deadline of all registered waits.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .deadlines
            .borrow()
            .first()
            .map(|(deadline, _)| *deadline)
    }

    /// Polls tasks until none is runnable any more.
    ///
    /// Returns the number of polls made.
    pub fn run_ready(&self) -> usize {
        let mut polls = 0;
        loop {
            let next = self.inner.ready.queue.lock().pop_front();
            let Some(id) = next else { break };
            let taken = {
                let mut tasks = self.inner.tasks.borrow_mut();
                tasks.get_mut(&id).and_then(|task| {
                    task.future.take().map(|fut| (fut, task.waker.clone()))
                })
            };
            let Some((mut future, task_waker)) = taken else {
                continue;
            };
            task_waker.queued.store(false, Ordering::Release);
            let waker = waker(task_waker);
            let mut cx = Context::from_waker(&waker);
            polls += 1;
            let res = panic::catch_unwind(AssertUnwindSafe(|| {
                future.as_mut().poll(&mut cx)
            }));
            match res {
                Ok(Poll::Pending) => {
                    if let Some(task) =
                        self.inner.tasks.borrow_mut().get_mut(&id)
                    {
                        task.future = Some(future);
                    }
                    continue;
                }
                Ok(Poll::Ready(())) => trace!(task = id.0, "task finished"),
                Err(fault) => error!(
                    task = id.0,
                    fault = fault_message(fault.as_ref()),
                    "task faulted"
                ),
            }
            let finished = self.inner.tasks.borrow_mut().remove(&id);
            self.publish_load();
            // Dropping may deregister waits, so only do it once the task
            // table is no longer borrowed.
            drop(finished);
            drop(future);
        }
        polls
    }

    /// Returns whether any task is waiting to be polled.
    pub fn has_ready(&self) -> bool {
        !self.inner.ready.queue.lock().is_empty()
    }

    /// Returns the number of tasks that have not completed yet.
    ///
    /// A task waiting for an event still counts: it will become runnable
    /// again and occupies resources until it completes. This is the value
    /// used for admission control and reported as load to other threads.
    pub fn runnable_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Returns the number of registered waits.
    pub fn waiting_count(&self) -> usize {
        self.inner.waiters.borrow().len()
    }

    /// Returns the counter through which the task count is published.
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        self.inner.load.clone()
    }

    /// Returns the waiter registry.
    pub fn waiters(&self) -> Ref<'_, WaiterRegistry> {
        self.inner.waiters.borrow()
    }

    /// Returns the waiter registry for updating.
    ///
    /// The returned guard must be dropped before calling other methods of
    /// the scheduler.
    pub fn waiters_mut(&self) -> RefMut<'_, WaiterRegistry> {
        self.inner.waiters.borrow_mut()
    }

    /// Drops all tasks and everything they wait for.
    ///
    /// Tasks usually hold on to the context that owns the scheduler. This
    /// breaks those cycles when a thread shuts down.
    pub fn clear(&self) {
        let tasks = core::mem::take(&mut *self.inner.tasks.borrow_mut());
        self.inner.ready.queue.lock().clear();
        drop(tasks);
        self.inner.completions.borrow_mut().clear();
        self.inner.deadlines.borrow_mut().clear();
        *self.inner.waiters.borrow_mut() = WaiterRegistry::new();
        self.publish_load();
    }

    fn complete(&self, id: WaiterId, outcome: Outcome) -> bool {
        let Some(waiter) = self.inner.waiters.borrow_mut().remove(id) else {
            return false;
        };
        self.inner
            .deadlines
            .borrow_mut()
            .remove(&(waiter.deadline, id));
        self.inner.completions.borrow_mut().insert(
            id,
            Completion {
                outcome,
                key: waiter.key,
            },
        );
        if let Some(waker) = waiter.waker {
            waker.wake();
        }
        true
    }

    fn cancel(&self, id: WaiterId) {
        let waiter = self.inner.waiters.borrow_mut().remove(id);
        if let Some(waiter) = waiter {
            self.inner
                .deadlines
                .borrow_mut()
                .remove(&(waiter.deadline, id));
        }
        self.inner.completions.borrow_mut().remove(&id);
    }

    fn publish_load(&self) {
        let len = self.inner.tasks.borrow().len();
        self.inner.load.store(len, Ordering::Relaxed);
    }
}

//--- Default

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

//------------ WaitEvent -----------------------------------------------------

/// A registered wait.
///
/// Resolves to the [`Completion`] of the wait.
#[must_use = "the wait is removed again when the future is dropped"]
pub struct WaitEvent {
    sched: Scheduler,
    id: WaiterId,
    done: bool,
}

impl WaitEvent {
    /// Returns the registry entry of the wait.
    pub fn id(&self) -> WaiterId {
        self.id
    }
}

impl Future for WaitEvent {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let completion =
            self.sched.inner.completions.borrow_mut().remove(&self.id);
        match completion {
            Some(completion) => {
                self.done = true;
                Poll::Ready(completion)
            }
            None => {
                self.sched
                    .inner
                    .waiters
                    .borrow_mut()
                    .set_waker(self.id, cx.waker());
                Poll::Pending
            }
        }
    }
}

impl Drop for WaitEvent {
    fn drop(&mut self) {
        if !self.done {
            self.sched.cancel(self.id)
        }
    }
}

//------------ Helpers -------------------------------------------------------

/// Extracts the message of a panic payload.
fn fault_message(fault: &(dyn Any + Send)) -> &str {
    if let Some(msg) = fault.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = fault.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown fault"
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn key(id: u16) -> WaitKey {
        let remote: SocketAddr = "192.0.2.1:53".parse().unwrap();
        WaitKey::udp(remote, 3, id, "example.", 1)
    }

    #[test]
    fn spawned_tasks_run_to_completion() {
        let sched = Scheduler::new();
        let hits = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            sched.spawn(async move { hits.set(hits.get() + 1) });
        }
        assert_eq!(sched.runnable_count(), 3);
        assert_eq!(sched.load_counter().load(Ordering::Relaxed), 3);
        assert_eq!(sched.run_ready(), 3);
        assert_eq!(hits.get(), 3);
        assert_eq!(sched.runnable_count(), 0);
        assert_eq!(sched.load_counter().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn faulting_task_leaves_others_running() {
        let sched = Scheduler::new();
        let ran = Rc::new(Cell::new(false));
        sched.spawn(async { panic!("task fault") });
        {
            let ran = ran.clone();
            sched.spawn(async move { ran.set(true) });
        }
        assert_eq!(sched.runnable_count(), 2);
        assert_eq!(sched.run_ready(), 2);
        assert!(ran.get());
        assert_eq!(sched.runnable_count(), 0);
        assert_eq!(sched.load_counter().load(Ordering::Relaxed), 0);
        assert!(!sched.has_ready());
    }

    #[test]
    fn faulting_task_releases_its_wait() {
        let sched = Scheduler::new();
        {
            let sched2 = sched.clone();
            sched.spawn(async move {
                let wait =
                    sched2.wait_event(key(1), Duration::from_secs(10)).unwrap();
                let _ = wait.await;
                panic!("fault after wakeup");
            });
        }
        let pending = {
            let sched2 = sched.clone();
            sched.spawn(async move {
                let wait =
                    sched2.wait_event(key(2), Duration::from_secs(10)).unwrap();
                let _ = wait.await;
            })
        };
        sched.run_ready();
        assert_eq!(sched.waiting_count(), 2);
        let first = sched.waiters().find_exact(&key(1).exact_key()).unwrap();
        assert!(sched.deliver(first, vec![1]));
        sched.run_ready();
        assert_eq!(sched.runnable_count(), 1);
        assert_eq!(sched.waiting_count(), 1);
        assert!(sched.inner.tasks.borrow().contains_key(&pending));
    }

    #[test]
    fn delivery_resumes_the_waiting_task() {
        let sched = Scheduler::new();
        let result = Rc::new(RefCell::new(None));
        {
            let sched2 = sched.clone();
            let result = result.clone();
            sched.spawn(async move {
                let wait =
                    sched2.wait_event(key(1), Duration::from_secs(10)).unwrap();
                *result.borrow_mut() = Some(wait.await.outcome);
            });
        }
        sched.run_ready();
        assert_eq!(sched.waiting_count(), 1);
        assert_eq!(sched.runnable_count(), 1);

        let id = sched.waiters().iter().next().unwrap().0;
        assert!(sched.deliver(id, b"answer".to_vec()));
        assert!(!sched.deliver(id, b"again".to_vec()));
        sched.run_ready();
        assert_eq!(
            result.borrow_mut().take(),
            Some(Outcome::Delivered(b"answer".to_vec()))
        );
        assert_eq!(sched.waiting_count(), 0);
        assert_eq!(sched.runnable_count(), 0);
    }

    #[test]
    fn expiry_times_out_waits() {
        let sched = Scheduler::new();
        let result = Rc::new(RefCell::new(None));
        {
            let sched2 = sched.clone();
            let result = result.clone();
            sched.spawn(async move {
                let wait = sched2.wait_event(key(1), Duration::ZERO).unwrap();
                *result.borrow_mut() = Some(wait.await.outcome);
            });
        }
        sched.run_ready();
        let deadline = sched.next_deadline().unwrap();
        assert_eq!(sched.expire(deadline - Duration::from_millis(1)), 0);
        assert_eq!(sched.expire(deadline), 1);
        assert_eq!(sched.next_deadline(), None);
        sched.run_ready();
        assert_eq!(result.borrow_mut().take(), Some(Outcome::TimedOut));
    }

    #[test]
    fn completion_returns_updated_key() {
        let sched = Scheduler::new();
        let wait = sched.wait_event(key(1), Duration::from_secs(1)).unwrap();
        sched.waiters_mut().attach_to_chain(wait.id(), 77);
        assert!(sched.deliver(wait.id(), vec![1]));

        // Delivered before the first poll, so the future is ready at once.
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut wait = wait;
        match Pin::new(&mut wait).poll(&mut cx) {
            Poll::Ready(completion) => {
                assert!(completion.key.chain.contains(&77));
            }
            Poll::Pending => panic!("wait should be complete"),
        }
    }

    #[test]
    fn dropping_a_wait_deregisters_it() {
        let sched = Scheduler::new();
        let wait = sched.wait_event(key(1), Duration::from_secs(1)).unwrap();
        assert_eq!(
            sched.wait_event(key(1), Duration::from_secs(1)).err(),
            Some(WaitError::DuplicateKey)
        );
        drop(wait);
        assert_eq!(sched.waiting_count(), 0);
        assert_eq!(sched.next_deadline(), None);
        assert!(sched.wait_event(key(1), Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn clear_drops_suspended_tasks() {
        let sched = Scheduler::new();
        let sched2 = sched.clone();
        sched.spawn(async move {
            let _wait = sched2.wait_event(key(1), Duration::from_secs(10));
            futures_util::future::pending::<()>().await;
        });
        sched.run_ready();
        assert_eq!(sched.runnable_count(), 1);
        assert_eq!(sched.waiting_count(), 1);
        sched.clear();
        assert_eq!(sched.runnable_count(), 0);
        assert_eq!(sched.waiting_count(), 0);
    }
}
