//! Rescheduleable one-shot timer
//!
//! A dedicated thread sleeps until the armed deadline and invokes the
//! callback exactly once per generation. Re-arming or cancelling bumps the
//! generation, which invalidates any sleep or fire still in flight. The
//! callback may ask to be retried when it cannot make progress yet (it
//! takes the engine lock with try-lock to avoid deadlocking against a
//! caller blocked on a condition variable).

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

const RETRY_DELAY: Duration = Duration::from_millis(1);

/// What the fire callback wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FireOutcome {
    Done,
    /// Could not run yet, fire again shortly with the same generation
    Retry,
}

struct TimerState {
    deadline: Option<Instant>,
    generation: u32,
    running: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Arming handle, held inside the engine state
#[derive(Clone)]
pub(crate) struct TimerControl {
    shared: Arc<TimerShared>,
}

impl TimerControl {
    /// Arm the timer, cancelling any earlier deadline; returns the
    /// generation the fire callback will observe
    pub fn arm_until(&self, deadline: Instant) -> u32 {
        let mut state = self.shared.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.deadline = Some(deadline);
        self.shared.cv.notify_one();
        state.generation
    }

    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.deadline = None;
        self.shared.cv.notify_one();
    }
}

pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn spawn(mut callback: impl FnMut(u32) -> FireOutcome + Send + 'static) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadline: None,
                generation: 0,
                running: true,
            }),
            cv: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || loop {
            let fired_generation;
            {
                let mut state = thread_shared.state.lock();
                loop {
                    if !state.running {
                        return;
                    }
                    match state.deadline {
                        None => thread_shared.cv.wait(&mut state),
                        Some(deadline) => {
                            if Instant::now() >= deadline {
                                break;
                            }
                            let _ = thread_shared.cv.wait_until(&mut state, deadline);
                        }
                    }
                }
                fired_generation = state.generation;
                state.deadline = None;
            }

            if callback(fired_generation) == FireOutcome::Retry {
                let mut state = thread_shared.state.lock();
                if state.running && state.generation == fired_generation && state.deadline.is_none()
                {
                    state.deadline = Some(Instant::now() + RETRY_DELAY);
                }
            }
        });
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn control(&self) -> TimerControl {
        TimerControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.generation = state.generation.wrapping_add(1);
            state.deadline = None;
        }
        self.shared.cv.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fires_once_with_generation() {
        let (tx, rx) = mpsc::channel();
        let mut timer = Timer::spawn(move |generation| {
            let _ = tx.send(generation);
            FireOutcome::Done
        });

        let generation = timer.control().arm_until(Instant::now() + Duration::from_millis(20));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(generation));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        timer.stop();
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let (tx, rx) = mpsc::channel();
        let mut timer = Timer::spawn(move |generation| {
            let _ = tx.send(generation);
            FireOutcome::Done
        });

        let control = timer.control();
        control.arm_until(Instant::now() + Duration::from_millis(50));
        control.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        timer.stop();
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let (tx, rx) = mpsc::channel();
        let mut timer = Timer::spawn(move |generation| {
            let _ = tx.send(generation);
            FireOutcome::Done
        });

        let control = timer.control();
        control.arm_until(Instant::now() + Duration::from_secs(60));
        let generation = control.arm_until(Instant::now() + Duration::from_millis(20));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(generation));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        timer.stop();
    }

    #[test]
    fn test_retry_refires_same_generation() {
        let (tx, rx) = mpsc::channel();
        let mut first = true;
        let mut timer = Timer::spawn(move |generation| {
            let _ = tx.send(generation);
            if first {
                first = false;
                FireOutcome::Retry
            } else {
                FireOutcome::Done
            }
        });

        let generation = timer.control().arm_until(Instant::now() + Duration::from_millis(10));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(generation));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(generation));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        timer.stop();
    }
}
