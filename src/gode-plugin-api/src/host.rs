use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use crate::{PluginError, PluginValue};

/// The runtime side of the plugin boundary. Implemented by the host; plugins
/// only ever see it behind the [`Host`] handle.
///
/// All three operations are safe to call from any thread, including plugin
/// background threads: they communicate with the VM exclusively by enqueuing
/// work on its serializer.
pub trait HostContext: Send + Sync {
    /// Queue an invocation of a registered script callback. Returns
    /// immediately; the result becomes available through the returned wait
    /// handle once the VM thread has run the callback.
    fn invoke_callback(&self, callback: u64, args: Vec<PluginValue>) -> CallbackWait;

    /// Allocate an identifier for a deferred result.
    fn allocate_promise(&self) -> u64;

    /// Settle a promise previously returned from a plugin call.
    fn settle_promise(&self, promise: u64, result: Result<PluginValue, PluginError>);
}

/// Handle to the hosting runtime, passed to `Initialize` and to every plugin
/// call as the first argument.
#[derive(Clone)]
pub struct Host {
    inner: Arc<dyn HostContext>,
}

impl Host {
    pub fn new(inner: Arc<dyn HostContext>) -> Self {
        Self { inner }
    }

    /// Create a deferred result. Return the [`PluginPromise`] from the plugin
    /// call; settle it later (typically from a background thread) through the
    /// [`Completer`].
    pub fn promise(&self) -> (PluginPromise, Completer) {
        let id = self.inner.allocate_promise();
        (
            PluginPromise { id },
            Completer {
                id,
                host: self.inner.clone(),
            },
        )
    }

    /// The raw host context. Used by runtime implementations to mint
    /// [`Callback`] handles; plugins have no use for it.
    pub fn context(&self) -> &Arc<dyn HostContext> {
        &self.inner
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").finish()
    }
}

/// A deferred plugin result, surfaced to the script as a promise.
#[derive(Debug)]
pub struct PluginPromise {
    pub(crate) id: u64,
}

impl PluginPromise {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Settles a [`PluginPromise`]. The first settlement wins; later calls are
/// ignored by the runtime.
#[derive(Clone)]
pub struct Completer {
    id: u64,
    host: Arc<dyn HostContext>,
}

impl Completer {
    pub fn resolve(self, value: PluginValue) {
        self.host.settle_promise(self.id, Ok(value));
    }

    pub fn reject(self, error: PluginError) {
        self.host.settle_promise(self.id, Err(error));
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("id", &self.id).finish()
    }
}

/// A script function handed to a plugin. Invoking it enqueues the call onto
/// the VM serializer, so it is legal from any thread; the invocation itself
/// never blocks.
#[derive(Clone)]
pub struct Callback {
    id: u64,
    host: Arc<dyn HostContext>,
}

impl Callback {
    pub fn new(id: u64, host: Arc<dyn HostContext>) -> Self {
        Self { id, host }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invoke the script callback with `args`. Await the result with
    /// [`CallbackWait::wait`] if the plugin needs it.
    pub fn call(&self, args: Vec<PluginValue>) -> CallbackWait {
        self.host.invoke_callback(self.id, args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish()
    }
}

struct WaitCell {
    state: Mutex<Option<Result<PluginValue, PluginError>>>,
    cond: Condvar,
    /// Thread that must not block on this cell (the VM worker).
    barred: Option<ThreadId>,
}

/// Wait handle for a queued callback invocation.
pub struct CallbackWait {
    cell: Arc<WaitCell>,
}

/// Completion side of a [`CallbackWait`], held by the runtime.
#[derive(Clone)]
pub struct CallbackDone {
    cell: Arc<WaitCell>,
}

impl CallbackWait {
    /// A pending wait/done pair. `barred` names a thread for which waiting
    /// would deadlock; `wait` from that thread fails fast instead of blocking.
    pub fn pending(barred: Option<ThreadId>) -> (CallbackWait, CallbackDone) {
        let cell = Arc::new(WaitCell {
            state: Mutex::new(None),
            cond: Condvar::new(),
            barred,
        });
        (
            CallbackWait { cell: cell.clone() },
            CallbackDone { cell },
        )
    }

    /// An already-settled wait handle.
    pub fn ready(result: Result<PluginValue, PluginError>) -> CallbackWait {
        let (wait, done) = CallbackWait::pending(None);
        done.complete(result);
        wait
    }

    /// Block until the callback has run and return its result.
    pub fn wait(&self) -> Result<PluginValue, PluginError> {
        self.check_thread()?;
        let mut state = self.cell.state.lock().expect("callback cell poisoned");
        while state.is_none() {
            state = self
                .cell
                .cond
                .wait(state)
                .expect("callback cell poisoned");
        }
        state.clone().expect("checked above")
    }

    /// Bounded wait. `None` means the timeout elapsed; the callback still runs
    /// to completion on the VM thread.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<PluginValue, PluginError>> {
        if let Err(err) = self.check_thread() {
            return Some(Err(err));
        }
        let mut state = self.cell.state.lock().expect("callback cell poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while state.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timed_out) = self
                .cell
                .cond
                .wait_timeout(state, deadline - now)
                .expect("callback cell poisoned");
            state = guard;
            if timed_out.timed_out() && state.is_none() {
                return None;
            }
        }
        state.clone()
    }

    fn check_thread(&self) -> Result<(), PluginError> {
        if self.cell.barred == Some(std::thread::current().id()) {
            return Err(PluginError::new(
                "waiting on a callback from the VM worker thread would deadlock",
            ));
        }
        Ok(())
    }
}

impl CallbackDone {
    /// Record the callback result. The first completion wins.
    pub fn complete(&self, result: Result<PluginValue, PluginError>) {
        let mut state = self.cell.state.lock().expect("callback cell poisoned");
        if state.is_none() {
            *state = Some(result);
            self.cell.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_wait_returns_immediately() {
        let wait = CallbackWait::ready(Ok(PluginValue::Int(3)));
        assert_eq!(wait.wait().unwrap(), PluginValue::Int(3));
        // A second wait sees the same result.
        assert_eq!(wait.wait().unwrap(), PluginValue::Int(3));
    }

    #[test]
    fn pending_wait_blocks_until_complete() {
        let (wait, done) = CallbackWait::pending(None);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            done.complete(Ok(PluginValue::from("late")));
        });
        assert_eq!(wait.wait().unwrap(), PluginValue::from("late"));
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_elapses() {
        let (wait, _done) = CallbackWait::pending(None);
        assert!(wait.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn wait_on_barred_thread_fails_fast() {
        let (wait, _done) = CallbackWait::pending(Some(std::thread::current().id()));
        let err = wait.wait().unwrap_err();
        assert!(err.message.contains("deadlock"));
    }

    #[test]
    fn first_completion_wins() {
        let (wait, done) = CallbackWait::pending(None);
        done.complete(Ok(PluginValue::Int(1)));
        done.complete(Ok(PluginValue::Int(2)));
        assert_eq!(wait.wait().unwrap(), PluginValue::Int(1));
    }
}
