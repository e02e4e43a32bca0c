//! Task executor for the cooperative runtime
//!
//! Tasks are `!Send` futures polled on the runtime's thread. Wakers only push
//! task ids onto a shared ready queue, which is the one piece of state they
//! may touch from another thread.

use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

pub type LocalTask = Pin<Box<dyn Future<Output = ()>>>;
type ReadyQueue = Arc<Mutex<VecDeque<TaskId>>>;

/// Waker that requeues its task
struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.lock().push_back(self.id);
    }
}

/// Task executor
pub struct Executor {
    /// Pending tasks by ID
    tasks: RefCell<HashMap<TaskId, LocalTask>>,
    /// Ready queue
    ready: ReadyQueue,
    next_id: Cell<u64>,
}

impl Executor {
    /// Create a new executor
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(HashMap::new()),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            next_id: Cell::new(1),
        }
    }

    /// Spawn a task; it is polled on the next call to `run_ready`
    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.tasks.borrow_mut().insert(id, Box::pin(task));
        self.ready.lock().push_back(id);
        id
    }

    /// Poll every task that was ready when the call started.
    /// Returns the number of tasks polled.
    pub fn run_ready(&self) -> usize {
        let batch: Vec<TaskId> = self.ready.lock().drain(..).collect();
        let mut polled = 0;

        for id in batch {
            // Taken out of the map while polled so the task may spawn
            let Some(mut task) = self.tasks.borrow_mut().remove(&id) else {
                // Duplicate wake of a task that already finished
                continue;
            };
            polled += 1;

            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: self.ready.clone(),
            }));
            let mut cx = Context::from_waker(&waker);

            if task.as_mut().poll(&mut cx).is_pending() {
                self.tasks.borrow_mut().insert(id, task);
            }
        }

        polled
    }

    /// Whether any task is queued to run
    pub fn has_ready(&self) -> bool {
        !self.ready.lock().is_empty()
    }

    /// Take every pending task out of the executor without running it.
    ///
    /// The tasks are returned rather than dropped here, so their destructors
    /// run after the task map is no longer borrowed.
    pub fn drain(&self) -> Vec<LocalTask> {
        self.ready.lock().clear();
        self.tasks.borrow_mut().drain().map(|(_, task)| task).collect()
    }

    /// Check if executor has any pending tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Join handles
// =============================================================================

struct JoinState<T> {
    output: Option<T>,
    finished: bool,
    waker: Option<Waker>,
}

/// Awaitable result of a spawned task. Dropping it detaches the task.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has produced its output
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        match state.output.take() {
            Some(output) => Poll::Ready(output),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Spawn a future whose output can be awaited through the returned handle
pub fn spawn_joinable<F>(executor: &Executor, future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let state = Rc::new(RefCell::new(JoinState {
        output: None,
        finished: false,
        waker: None,
    }));
    let task_state = state.clone();

    let id = executor.spawn(async move {
        let output = future.await;
        let waker = {
            let mut state = task_state.borrow_mut();
            state.output = Some(output);
            state.finished = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    });

    JoinHandle { id, state }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_run() {
        let executor = Executor::new();
        let counter = Rc::new(Cell::new(0));
        let task_counter = counter.clone();

        executor.spawn(async move {
            task_counter.set(task_counter.get() + 1);
        });

        assert_eq!(executor.run_ready(), 1);
        assert_eq!(counter.get(), 1);
        assert!(executor.is_empty());
    }

    #[test]
    fn test_join_handle_output() {
        let executor = Executor::new();
        let handle = spawn_joinable(&executor, async { 40 + 2 });
        assert!(!handle.is_finished());

        executor.run_ready();
        assert!(handle.is_finished());

        let waker = Waker::from(Arc::new(TaskWaker {
            id: TaskId(0),
            ready: Arc::new(Mutex::new(VecDeque::new())),
        }));
        let mut cx = Context::from_waker(&waker);
        let mut handle = Box::pin(handle);
        assert_eq!(handle.as_mut().poll(&mut cx), Poll::Ready(42));
    }

    #[test]
    fn test_drain_takes_pending_tasks() {
        let executor = Executor::new();
        let dropped = Rc::new(Cell::new(false));

        struct SetOnDrop(Rc<Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let guard = SetOnDrop(dropped.clone());
        executor.spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        executor.spawn(std::future::pending());
        executor.run_ready();
        assert_eq!(executor.len(), 2);

        let tasks = executor.drain();
        assert!(executor.is_empty());
        assert!(!executor.has_ready());
        assert!(!dropped.get());
        drop(tasks);
        assert!(dropped.get());
    }
}
