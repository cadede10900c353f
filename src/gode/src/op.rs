//! Awaitable handles for queued VM operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::{Error, ErrorKind};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// What a queued operation produces: a host JSON value or a structured
/// error.
pub type OpResult = Result<serde_json::Value, Error>;

struct OpState {
    result: Mutex<Option<OpResult>>,
    cond: Condvar,
    /// The VM worker thread; waiting from it would deadlock and fails fast.
    worker: Option<ThreadId>,
}

/// A future-like handle for a closure queued onto the VM serializer.
///
/// The state advances monotonically from pending to exactly one terminal
/// result, observable any number of times through [`AwaitableOp::wait`].
/// Success values are host JSON exports; engine values never cross the
/// VM-thread boundary.
pub struct AwaitableOp {
    id: u64,
    state: Arc<OpState>,
}

/// Completion side, held by the worker. Dropping it without completing (a
/// panicked closure, a disposed queue) cancels the op with a `Disposed` error
/// so waiters never hang.
pub(crate) struct OpCompleter {
    state: Arc<OpState>,
    completed: bool,
}

impl AwaitableOp {
    pub(crate) fn pending(worker: Option<ThreadId>) -> (AwaitableOp, OpCompleter) {
        let state = Arc::new(OpState {
            result: Mutex::new(None),
            cond: Condvar::new(),
            worker,
        });
        (
            AwaitableOp {
                id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
                state: state.clone(),
            },
            OpCompleter {
                state,
                completed: false,
            },
        )
    }

    /// An op born terminal, used when the queue rejects work outright.
    pub(crate) fn completed(result: OpResult) -> AwaitableOp {
        let (op, mut completer) = AwaitableOp::pending(None);
        completer.complete(result);
        op
    }

    /// Stable identifier of this operation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the operation terminates and return its result. Calling
    /// from the VM worker thread fails immediately with `Deadlock`.
    pub fn wait(&self) -> OpResult {
        self.check_worker()?;
        let mut result = self.state.result.lock().expect("op state poisoned");
        while result.is_none() {
            result = self
                .state
                .cond
                .wait(result)
                .expect("op state poisoned");
        }
        result.clone().expect("checked above")
    }

    /// Bounded wait. `None` means the timeout elapsed; the operation still
    /// runs to completion on the worker.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<OpResult> {
        if let Err(err) = self.check_worker() {
            return Some(Err(err));
        }
        let deadline = Instant::now() + timeout;
        let mut result = self.state.result.lock().expect("op state poisoned");
        while result.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timed_out) = self
                .state
                .cond
                .wait_timeout(result, deadline - now)
                .expect("op state poisoned");
            result = guard;
            if timed_out.timed_out() && result.is_none() {
                return None;
            }
        }
        result.clone()
    }

    /// Non-blocking peek at a terminal result.
    pub fn try_result(&self) -> Option<OpResult> {
        self.state.result.lock().expect("op state poisoned").clone()
    }

    fn check_worker(&self) -> Result<(), Error> {
        if self.state.worker == Some(std::thread::current().id()) {
            return Err(Error::new(
                ErrorKind::Deadlock,
                "wait called on the VM worker thread",
            )
            .with_operation("wait"));
        }
        Ok(())
    }
}

impl OpCompleter {
    pub(crate) fn complete(&mut self, result: OpResult) {
        let mut slot = self.state.result.lock().expect("op state poisoned");
        if slot.is_none() {
            *slot = Some(result);
            self.state.cond.notify_all();
        }
        self.completed = true;
    }
}

impl Drop for OpCompleter {
    fn drop(&mut self) {
        if !self.completed {
            let mut slot = self.state.result.lock().expect("op state poisoned");
            if slot.is_none() {
                *slot = Some(Err(Error::new(
                    ErrorKind::Disposed,
                    "operation cancelled before completion",
                )));
                self.state.cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_completed_result() {
        let op = AwaitableOp::completed(Ok(serde_json::json!(7)));
        assert_eq!(op.wait().unwrap(), serde_json::json!(7));
        // Result stays observable.
        assert_eq!(op.wait().unwrap(), serde_json::json!(7));
    }

    #[test]
    fn wait_blocks_until_completion() {
        let (op, mut completer) = AwaitableOp::pending(None);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(serde_json::json!("done")));
        });
        assert_eq!(op.wait().unwrap(), serde_json::json!("done"));
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_elapses() {
        let (op, _completer) = AwaitableOp::pending(None);
        assert!(op.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn wait_on_worker_thread_is_deadlock() {
        let (op, _completer) = AwaitableOp::pending(Some(std::thread::current().id()));
        let err = op.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deadlock);
        let timed = op.wait_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(timed.unwrap_err().kind(), ErrorKind::Deadlock);
    }

    #[test]
    fn dropped_completer_cancels() {
        let (op, completer) = AwaitableOp::pending(None);
        drop(completer);
        assert_eq!(op.wait().unwrap_err().kind(), ErrorKind::Disposed);
    }

    #[test]
    fn first_completion_wins() {
        let (op, mut completer) = AwaitableOp::pending(None);
        completer.complete(Ok(serde_json::json!(1)));
        completer.complete(Ok(serde_json::json!(2)));
        assert_eq!(op.wait().unwrap(), serde_json::json!(1));
    }

    #[test]
    fn op_ids_are_unique() {
        let a = AwaitableOp::completed(Ok(serde_json::Value::Null));
        let b = AwaitableOp::completed(Ok(serde_json::Value::Null));
        assert_ne!(a.id(), b.id());
    }
}
