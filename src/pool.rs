//! Fixed pool of worker threads with a bounded shared task queue.
//!
//! Each worker owns its state exclusively on its own OS thread; callers reach
//! that state through [`WorkerPool::execute_on`], which enqueues a function
//! onto the worker's private FIFO. Function queues drain before the shared
//! task queue. When the bounded task queue is full, the oldest pending task
//! is dropped in favour of the new one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{debug, error};

use crate::task::AsyncTask;

#[derive(thiserror::Error, Debug)]
#[error("worker initialization failed: {0}")]
pub struct WorkerError(pub String);

pub trait Worker: Send + 'static {
    type Task: Send + 'static;

    /// Called once on the worker thread before any task. A failure removes
    /// the worker from the pool.
    fn init(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn process(&mut self, task: Self::Task);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

/// Fires once the worker's `init()` finished, with the worker id either way.
pub type WorkerInitTask = AsyncTask<WorkerId, (WorkerId, WorkerError)>;

type WorkerFn<W> = Box<dyn FnOnce(&mut W) + Send>;

struct Slot<W: Worker> {
    id: WorkerId,
    funcs: VecDeque<WorkerFn<W>>,
}

struct State<W: Worker> {
    tasks: VecDeque<W::Task>,
    slots: Vec<Slot<W>>,
    queue_limit: usize,
}

struct Shared<W: Worker> {
    state: Mutex<State<W>>,
    cv: Condvar,
}

impl<W: Worker> Shared<W> {
    fn lock(&self) -> MutexGuard<'_, State<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_slot(&self, id: WorkerId) {
        self.lock().slots.retain(|slot| slot.id != id);
    }
}

pub struct WorkerPool<W: Worker> {
    shared: Arc<Shared<W>>,
    threads: Mutex<Vec<ThreadEntry>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

struct ThreadEntry {
    id: WorkerId,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl<W: Worker> WorkerPool<W> {
    /// `queue_limit` of zero means unbounded.
    pub fn new(queue_limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tasks: VecDeque::new(),
                    slots: Vec::new(),
                    queue_limit,
                }),
                cv: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawns `worker` on its own thread. `init_task` fires when the
    /// worker's `init()` completed, successfully or not.
    pub fn push_worker(&self, worker: W, init_task: Option<Arc<WorkerInitTask>>) -> WorkerId {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let stop = Arc::new(AtomicBool::new(false));
        self.shared.lock().slots.push(Slot {
            id,
            funcs: VecDeque::new(),
        });

        let shared = Arc::clone(&self.shared);
        let thread_stop = Arc::clone(&stop);
        let spawned = std::thread::Builder::new()
            .name(format!("pool-worker-{}", id.0))
            .spawn(move || worker_loop(worker, id, thread_stop, shared, init_task));
        match spawned {
            Ok(handle) => {
                self.threads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(ThreadEntry { id, stop, handle });
            }
            Err(e) => {
                error!("failed to spawn worker thread: {e}");
                self.shared.remove_slot(id);
            }
        }
        id
    }

    /// Enqueues a task for whichever worker frees up first. Overflowing the
    /// bounded queue evicts the oldest pending task.
    pub fn post(&self, task: W::Task) {
        {
            let mut state = self.shared.lock();
            if state.queue_limit > 0 && state.tasks.len() >= state.queue_limit {
                state.tasks.pop_front();
                debug!("worker pool queue full, dropped oldest task");
            }
            state.tasks.push_back(task);
        }
        self.shared.cv.notify_one();
    }

    /// Runs `f` with exclusive access to the given worker's state, on that
    /// worker's thread. Returns false when the worker is gone.
    pub fn execute_on<F>(&self, id: WorkerId, f: F) -> bool
    where
        F: FnOnce(&mut W) + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            let Some(slot) = state.slots.iter_mut().find(|slot| slot.id == id) else {
                return false;
            };
            slot.funcs.push_back(Box::new(f));
        }
        self.shared.cv.notify_all();
        true
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.shared.lock().slots.iter().map(|slot| slot.id).collect()
    }

    pub fn remove_worker(&self, id: WorkerId) -> bool {
        let entry = {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(pos) = threads.iter().position(|entry| entry.id == id) else {
                return false;
            };
            threads.remove(pos)
        };
        entry.stop.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if entry.handle.join().is_err() {
            error!("worker thread {id:?} panicked");
        }
        self.shared.remove_slot(id);
        true
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<ThreadEntry> = {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *threads)
        };
        for entry in &entries {
            entry.stop.store(true, Ordering::Release);
        }
        self.shared.cv.notify_all();
        for entry in entries {
            let id = entry.id;
            if entry.handle.join().is_err() {
                error!("worker thread {id:?} panicked");
            }
            self.shared.remove_slot(id);
        }
    }
}

impl<W: Worker> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Work<W: Worker> {
    Func(WorkerFn<W>),
    Task(W::Task),
}

fn worker_loop<W: Worker>(
    mut worker: W,
    id: WorkerId,
    stop: Arc<AtomicBool>,
    shared: Arc<Shared<W>>,
    init_task: Option<Arc<WorkerInitTask>>,
) {
    match worker.init() {
        Ok(()) => {
            if let Some(task) = init_task {
                task.complete_success(id);
            }
        }
        Err(e) => {
            error!("worker {id:?} failed to initialize: {e}");
            shared.remove_slot(id);
            if let Some(task) = init_task {
                task.complete_error((id, e));
            }
            return;
        }
    }

    loop {
        let work = {
            let mut state = shared.lock();
            loop {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                let own_funcs = state
                    .slots
                    .iter_mut()
                    .find(|slot| slot.id == id)
                    .and_then(|slot| slot.funcs.pop_front());
                if let Some(func) = own_funcs {
                    break Work::Func(func);
                }
                if let Some(task) = state.tasks.pop_front() {
                    break Work::Task(task);
                }
                state = shared
                    .cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        match work {
            Work::Func(func) => func(&mut worker),
            Work::Task(task) => worker.process(task),
        }
    }
}

/// Blocks startup until a known number of workers reported in. The barrier is
/// used at initialization only; runtime operations never wait on it.
#[derive(Clone)]
pub struct InitBarrier {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl InitBarrier {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((Mutex::new(count), Condvar::new())),
        }
    }

    pub fn notify(&self) {
        let (lock, cv) = &*self.inner;
        let mut remaining = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let (lock, cv) = &*self.inner;
        let mut remaining = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *remaining > 0 {
            remaining = cv.wait(remaining).unwrap_or_else(PoisonError::into_inner);
        }
    }
}
