use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

/// Typed handle to the result of a [`spawn`](crate::ThreadPool::spawn)ed
/// task.
///
/// [`get`](Self::get) blocks until the task has run, then returns its value,
/// or re-raises the panic the task died with, so the submitter sees exactly
/// what the task raised.
pub struct Job<T> {
    state: Arc<State<T>>,
}

struct State<T> {
    result: Mutex<Option<thread::Result<T>>>,
    cv: Condvar,
}

/// Completion side of a [`Job`], held by the pool task.
pub(crate) struct Promise<T> {
    state: Arc<State<T>>,
}

pub(crate) fn pair<T>() -> (Job<T>, Promise<T>) {
    let state = Arc::new(State {
        result: Mutex::new(None),
        cv: Condvar::new(),
    });
    (
        Job {
            state: state.clone(),
        },
        Promise { state },
    )
}

impl<T> Job<T> {
    /// Blocks until the task completes; returns its value or re-raises its
    /// panic.
    pub fn get(self) -> T {
        let mut result = self.state.result.lock();
        self.state
            .cv
            .wait_while(&mut result, |result| result.is_none());
        match result.take().expect("job completed") {
            Ok(value) => value,
            Err(payload) => {
                drop(result);
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// True once the task has finished (successfully or not).
    pub fn is_done(&self) -> bool {
        self.state.result.lock().is_some()
    }
}

impl<T> Promise<T> {
    pub(crate) fn fulfill(self, result: thread::Result<T>) {
        let mut slot = self.state.result.lock();
        *slot = Some(result);
        drop(slot);
        self.state.cv.notify_all();
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("done", &self.is_done())
            .finish()
    }
}
