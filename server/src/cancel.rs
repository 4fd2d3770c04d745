//! A small cancellation token with typed causes.
//!
//! Cancellation with an attached cause is the central control-flow device of
//! the judge: per-player budgets, the global match deadline and the build
//! deadline all cancel a token with their own [`Cause`], and error
//! classification later matches those causes by identity on the error chain.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Why a token was cancelled.
///
/// Fieldless and `Copy`, so comparing variants is comparing identities. The
/// enum implements [`std::error::Error`] so a cause can travel on an `anyhow`
/// chain and be recovered by downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Cause {
    #[error("master timeout")]
    TimeoutMaster,
    #[error("slave timeout")]
    TimeoutSlave,
    #[error("global timeout")]
    TimeoutGlobal,
    #[error("build timeout")]
    BuildTimeout,
    #[error("session closed")]
    Closed,
}

type Hook = Box<dyn FnOnce(Cause) + Send>;

#[derive(Default)]
struct State {
    cause: Option<Cause>,
    hooks: Vec<Hook>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// A cancellable, waitable token.
///
/// Clones share one underlying state. The first [`CancelToken::cancel`] wins;
/// its cause is stored, blocked waiters wake up, and registered hooks run.
/// Children created with [`CancelToken::child`] are cancelled together with
/// their parent but can also be cancelled on their own.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Cancel with `cause`. Only the first call has any effect.
    pub fn cancel(&self, cause: Cause) {
        let hooks = {
            let mut state = self.inner.state.lock().expect("cancel token poisoned");
            if state.cause.is_some() {
                return;
            }
            state.cause = Some(cause);
            std::mem::take(&mut state.hooks)
        };
        self.inner.cond.notify_all();
        // Hooks run outside the lock; they may touch other tokens.
        for hook in hooks {
            hook(cause);
        }
    }

    /// The cause this token was cancelled with, if any.
    pub fn cause(&self) -> Option<Cause> {
        self.inner.state.lock().expect("cancel token poisoned").cause
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// Run `hook` when the token is cancelled, immediately if it already was.
    pub fn on_cancel(&self, hook: impl FnOnce(Cause) + Send + 'static) {
        let cause = {
            let mut state = self.inner.state.lock().expect("cancel token poisoned");
            match state.cause {
                Some(cause) => cause,
                None => {
                    state.hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        hook(cause);
    }

    /// A token that is cancelled whenever this one is.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let propagate = child.clone();
        self.on_cancel(move |cause| propagate.cancel(cause));
        child
    }

    /// Block until the token is cancelled or `timeout` elapses.
    ///
    /// Returns the cause when cancelled in time, `None` otherwise.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Cause> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().expect("cancel token poisoned");
        loop {
            if let Some(cause) = state.cause {
                return Some(cause);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(state, left)
                .expect("cancel token poisoned");
            state = guard;
        }
    }

    /// Arm a deadline: after `timeout`, the token is cancelled with `cause`
    /// unless it was cancelled earlier. The waiter thread exits either way.
    pub fn deadline(&self, timeout: Duration, cause: Cause) {
        let token = self.clone();
        std::thread::spawn(move || {
            if token.wait_timeout(timeout).is_none() {
                token.cancel(cause);
            }
        });
    }
}

/// Whether `cause` sits anywhere on an error chain.
pub fn has_cause(err: &anyhow::Error, cause: Cause) -> bool {
    err.chain()
        .any(|e| e.downcast_ref::<Cause>() == Some(&cause))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_cancel_wins() {
        let token = CancelToken::new();
        token.cancel(Cause::TimeoutMaster);
        token.cancel(Cause::TimeoutSlave);
        assert_eq!(token.cause(), Some(Cause::TimeoutMaster));
    }

    #[test]
    fn child_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel(Cause::TimeoutGlobal);
        assert_eq!(child.cause(), Some(Cause::TimeoutGlobal));
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel(Cause::Closed);
        assert_eq!(parent.child().cause(), Some(Cause::Closed));
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel(Cause::TimeoutSlave);
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn hook_runs_once_on_cancel() {
        let token = CancelToken::new();
        let (tx, rx) = std::sync::mpsc::channel();
        token.on_cancel(move |cause| tx.send(cause).unwrap());

        token.cancel(Cause::BuildTimeout);
        token.cancel(Cause::Closed);
        assert_eq!(rx.recv().unwrap(), Cause::BuildTimeout);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wait_observes_cancellation() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel(Cause::TimeoutGlobal);
        assert_eq!(handle.join().unwrap(), Some(Cause::TimeoutGlobal));
    }

    #[test]
    fn wait_times_out() {
        let token = CancelToken::new();
        assert_eq!(token.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn deadline_fires() {
        let token = CancelToken::new();
        token.deadline(Duration::from_millis(30), Cause::TimeoutGlobal);
        assert_eq!(
            token.wait_timeout(Duration::from_secs(5)),
            Some(Cause::TimeoutGlobal)
        );
    }

    #[test]
    fn deadline_does_not_override_earlier_cancel() {
        let token = CancelToken::new();
        token.deadline(Duration::from_millis(30), Cause::TimeoutGlobal);
        token.cancel(Cause::Closed);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(token.cause(), Some(Cause::Closed));
    }

    #[test]
    fn cause_is_found_on_chains() {
        use anyhow::Context;

        let err = anyhow::Error::new(Cause::TimeoutSlave).context("failed to shoot");
        assert!(has_cause(&err, Cause::TimeoutSlave));
        assert!(!has_cause(&err, Cause::TimeoutMaster));
    }
}
