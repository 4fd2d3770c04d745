//! Per-player time accounting.
//!
//! A [`Stopwatch`] accrues wall-clock time only between [`Stopwatch::resume`]
//! and [`Stopwatch::pause`] calls. When the accumulated running time reaches
//! the timeout, the cancel callback fires exactly once and the stopwatch
//! closes itself.
//!
//! The waiting is done by one background worker per stopwatch, which blocks
//! on an mpsc channel: `resume` sends the remaining budget to arm the
//! deadline, `pause` sends a disarm, dropping the sender releases the worker.
//! All transitions go through one mutex, so a pause racing a close cannot
//! reach a dead worker.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::{CancelToken, Cause};

struct SwState {
    total: Duration,
    last_resume: Option<Instant>,
    // None once closed, by hand or by the worker firing.
    deadline_updates: Option<Sender<Option<Duration>>>,
}

/// Keeps track of the time that passes between `resume` and `pause` calls.
///
/// Created paused. Not meant for concurrent `resume`/`pause` on the same
/// stopwatch; one player session drives it sequentially.
pub struct Stopwatch {
    timeout: Duration,
    state: Arc<Mutex<SwState>>,
}

impl Stopwatch {
    /// Creates a paused stopwatch that calls `cancel` once `timeout` of
    /// running time has accumulated.
    pub fn new(timeout: Duration, cancel: impl FnOnce() + Send + 'static) -> Stopwatch {
        let (tx, rx) = mpsc::channel::<Option<Duration>>();
        let state = Arc::new(Mutex::new(SwState {
            total: Duration::ZERO,
            last_resume: None,
            deadline_updates: Some(tx),
        }));

        let worker_state = state.clone();
        std::thread::spawn(move || {
            let mut armed: Option<Duration> = None;
            loop {
                let update = match armed {
                    Some(left) => match rx.recv_timeout(left) {
                        Ok(update) => update,
                        Err(RecvTimeoutError::Timeout) => {
                            // Budget spent: close first, then fire.
                            worker_state
                                .lock()
                                .expect("stopwatch state poisoned")
                                .deadline_updates = None;
                            cancel();
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    },
                    None => match rx.recv() {
                        Ok(update) => update,
                        Err(_) => return,
                    },
                };
                armed = update;
            }
        });

        Stopwatch { timeout, state }
    }

    /// Paused -> running: starts counting and arms the deadline for whatever
    /// budget is left.
    pub fn resume(&self) {
        let mut state = self.state.lock().expect("stopwatch state poisoned");
        state.last_resume = Some(Instant::now());
        let left = self.timeout.saturating_sub(state.total);
        if let Some(tx) = &state.deadline_updates {
            let _ = tx.send(Some(left));
        }
    }

    /// Running -> paused: adds the elapsed slice and disarms the deadline.
    pub fn pause(&self) {
        let mut state = self.state.lock().expect("stopwatch state poisoned");
        if let Some(tx) = &state.deadline_updates {
            let _ = tx.send(None);
        }
        if let Some(at) = state.last_resume.take() {
            state.total += at.elapsed();
        }
    }

    /// Disarms permanently and releases the worker. Idempotent.
    pub fn close(&self) {
        self.state
            .lock()
            .expect("stopwatch state poisoned")
            .deadline_updates = None;
    }
}

/// Creates a cancellation token and stopwatch bound together.
///
/// When the stopwatch budget is spent, the returned token is cancelled with
/// `cause`. When the token is cancelled from anywhere (including through its
/// parent), the stopwatch is closed.
pub fn stopwatch_context(
    parent: &CancelToken,
    timeout: Duration,
    cause: Cause,
) -> (CancelToken, Arc<Stopwatch>) {
    let token = parent.child();

    let on_expiry = token.clone();
    let stopwatch = Arc::new(Stopwatch::new(timeout, move || on_expiry.cancel(cause)));

    let closer = stopwatch.clone();
    token.on_cancel(move |_| closer.close());

    (token, stopwatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn flag_stopwatch(timeout: Duration) -> (Stopwatch, Arc<AtomicBool>) {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let sw = Stopwatch::new(timeout, move || flag.store(true, Ordering::SeqCst));
        (sw, fired)
    }

    #[test]
    fn close_suppresses_firing() {
        let (sw, fired) = flag_stopwatch(Duration::from_millis(50));
        sw.close();
        sw.resume();
        std::thread::sleep(Duration::from_millis(120));
        sw.pause();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn close_is_idempotent() {
        let (sw, fired) = flag_stopwatch(Duration::from_millis(50));
        sw.close();
        sw.close();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn under_budget_slices_never_fire() {
        let (sw, fired) = flag_stopwatch(Duration::from_millis(200));
        for _ in 0..20 {
            sw.resume();
            std::thread::sleep(Duration::from_millis(1));
            sw.pause();
        }
        // Paused: plenty of wall-clock time may pass without charge.
        std::thread::sleep(Duration::from_millis(250));
        assert!(!fired.load(Ordering::SeqCst));
        sw.close();
    }

    #[test]
    fn accumulated_budget_fires() {
        let (sw, fired) = flag_stopwatch(Duration::from_millis(60));
        for _ in 0..5 {
            sw.resume();
            std::thread::sleep(Duration::from_millis(5));
            sw.pause();
        }
        sw.resume();
        std::thread::sleep(Duration::from_millis(120));
        sw.pause();
        assert!(fired.load(Ordering::SeqCst));
        sw.close();
    }

    #[test]
    fn held_resume_fires_near_deadline() {
        let (sw, fired) = flag_stopwatch(Duration::from_millis(40));
        sw.resume();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!fired.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(80));
        assert!(fired.load(Ordering::SeqCst));
        sw.pause();
    }

    #[test]
    fn pause_after_expiry_does_not_panic() {
        let (sw, fired) = flag_stopwatch(Duration::from_millis(20));
        sw.resume();
        std::thread::sleep(Duration::from_millis(80));
        // Worker already fired and auto-closed; this must be a no-op.
        sw.pause();
        sw.resume();
        sw.pause();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn context_cancels_with_cause() {
        let parent = CancelToken::new();
        let (token, sw) =
            stopwatch_context(&parent, Duration::from_millis(30), Cause::TimeoutSlave);

        sw.resume();
        let cause = token.wait_timeout(Duration::from_secs(5));
        sw.pause();
        assert_eq!(cause, Some(Cause::TimeoutSlave));
    }

    #[test]
    fn parent_cancel_closes_stopwatch() {
        let parent = CancelToken::new();
        let (token, sw) =
            stopwatch_context(&parent, Duration::from_millis(30), Cause::TimeoutMaster);

        parent.cancel(Cause::Closed);
        assert_eq!(token.cause(), Some(Cause::Closed));

        // The stopwatch is closed: holding it past its budget changes nothing.
        sw.resume();
        std::thread::sleep(Duration::from_millis(80));
        sw.pause();
        assert_eq!(token.cause(), Some(Cause::Closed));
    }
}
