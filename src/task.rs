//! Cancellable single-shot asynchronous tasks.
//!
//! An [`AsyncTask`] holds one pending callback pair and resolves exactly once:
//! either the success callback, the error callback, or neither (when it was
//! cancelled first). All state transitions happen through a single
//! compare-and-swap on the state word, so a completion racing a cancellation
//! is decided exactly once regardless of which threads are involved.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const PENDING: u8 = 0;
const DONE: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle onto the runtime used to dispatch completion callbacks back onto
/// the event loop. Threaded explicitly through constructors; components never
/// reach for an ambient runtime.
#[derive(Clone, Debug)]
pub struct Executor {
    handle: tokio::runtime::Handle,
}

impl Executor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Captures the runtime of the calling context. Panics outside a runtime,
    /// so this belongs in setup code only.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    pub fn dispatch_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
    }

    /// Runs a blocking closure on the runtime's blocking pool.
    pub fn dispatch_blocking<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_blocking(f);
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

/// Object-safe cancellation handle; lets owners keep `Arc<dyn Cancellable>`
/// as their single `pending_work` reference.
pub trait Cancellable: Send + Sync {
    /// Returns true when this call won the race against completion.
    fn cancel(&self) -> bool;
}

type SuccessCb<T> = Box<dyn FnOnce(T) + Send>;
type ErrorCb<E> = Box<dyn FnOnce(E) + Send>;

struct Callbacks<T, E> {
    on_success: Option<SuccessCb<T>>,
    on_error: Option<ErrorCb<E>>,
}

pub struct AsyncTask<T, E = ()> {
    state: Arc<AtomicU8>,
    callbacks: Mutex<Option<Callbacks<T, E>>>,
    executor: Option<Executor>,
}

impl<T: Send + 'static, E: Send + 'static> AsyncTask<T, E> {
    /// Callbacks run inline on whichever thread completes the task.
    pub fn new<S, F>(on_success: S, on_error: F) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(E) + Send + 'static,
    {
        Self::build(
            Some(Box::new(on_success)),
            Some(Box::new(on_error)),
            None,
        )
    }

    /// Callbacks are dispatched onto `executor` instead of running inline;
    /// the completing thread never executes user code itself.
    pub fn with_executor<S, F>(executor: Executor, on_success: S, on_error: F) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(E) + Send + 'static,
    {
        Self::build(
            Some(Box::new(on_success)),
            Some(Box::new(on_error)),
            Some(executor),
        )
    }

    /// A task nobody observes; completions only flip the state word.
    pub fn detached() -> Self {
        Self::build(None, None, None)
    }

    fn build(
        on_success: Option<SuccessCb<T>>,
        on_error: Option<ErrorCb<E>>,
        executor: Option<Executor>,
    ) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
            callbacks: Mutex::new(Some(Callbacks {
                on_success,
                on_error,
            })),
            executor,
        }
    }

    pub fn complete_success(&self, value: T) {
        let Some(cbs) = self.take_callbacks() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let run = move || {
            if try_transition(&state, DONE) {
                if let Some(cb) = cbs.on_success {
                    cb(value);
                }
            }
        };
        match &self.executor {
            Some(executor) => executor.dispatch(run),
            None => run(),
        }
    }

    pub fn complete_error(&self, error: E) {
        let Some(cbs) = self.take_callbacks() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let run = move || {
            if try_transition(&state, DONE) {
                if let Some(cb) = cbs.on_error {
                    cb(error);
                }
            }
        };
        match &self.executor {
            Some(executor) => executor.dispatch(run),
            None => run(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn take_callbacks(&self) -> Option<Callbacks<T, E>> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<T: Send + 'static, E: Send + 'static> Cancellable for AsyncTask<T, E> {
    fn cancel(&self) -> bool {
        try_transition(&self.state, CANCELLED)
    }
}

fn try_transition(state: &AtomicU8, target: u8) -> bool {
    state
        .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn success_callback_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let task: AsyncTask<u32, ()> = AsyncTask::new(
            move |v| {
                assert_eq!(v, 7);
                h.fetch_add(1, Ordering::SeqCst);
            },
            |()| panic!("error callback must not run"),
        );
        task.complete_success(7);
        task.complete_success(8);
        task.complete_error(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[test]
    fn cancel_beats_completion() {
        let task: AsyncTask<u32, ()> = AsyncTask::new(
            |_| panic!("cancelled task must not run success"),
            |()| panic!("cancelled task must not run error"),
        );
        assert!(task.cancel());
        assert!(!task.cancel());
        task.complete_success(1);
        assert!(task.is_cancelled());
    }

    #[test]
    fn completion_beats_cancel() {
        let (tx, rx) = mpsc::channel();
        let task: AsyncTask<u32, ()> = AsyncTask::new(
            move |v| tx.send(v).unwrap(),
            |()| panic!("error callback must not run"),
        );
        task.complete_success(3);
        assert!(!task.cancel());
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[test]
    fn error_path_is_exclusive() {
        let (tx, rx) = mpsc::channel();
        let task: AsyncTask<u32, &'static str> = AsyncTask::new(
            |_| panic!("success callback must not run"),
            move |e| tx.send(e).unwrap(),
        );
        task.complete_error("boom");
        task.complete_success(1);
        assert_eq!(rx.recv().unwrap(), "boom");
    }

    #[tokio::test]
    async fn executor_dispatch_runs_on_runtime() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let task: AsyncTask<u32, ()> = AsyncTask::with_executor(
            Executor::current(),
            move |v| {
                let _ = tx.send(v);
            },
            |()| {},
        );
        // Complete from a foreign thread; the callback still lands on the
        // runtime via the executor handle.
        let task = Arc::new(task);
        let completer = Arc::clone(&task);
        std::thread::spawn(move || completer.complete_success(42))
            .join()
            .unwrap();
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn cancel_between_dispatch_and_run_suppresses_callback() {
        // A task with an executor defers the state transition to the
        // dispatched closure, so cancellation can still win after
        // `complete_success` returned.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
        let task: Arc<AsyncTask<u32, ()>> = Arc::new(AsyncTask::with_executor(
            Executor::current(),
            move |v| {
                let _ = tx.send(v);
            },
            |()| {},
        ));
        task.cancel();
        task.complete_success(9);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
