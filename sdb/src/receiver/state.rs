//! Receiver state shared between the controller and the background task.
//!
//! ```text
//!            start()               deinit / fatal error
//!   Ready ────────────> Sampling ─────────────────────> Exiting
//!     ^                    │                              ^
//!     └────── stop() ──────┘                              │
//!     └───────────────────────────────────────────────────┘
//! ```
//!
//! The state itself is a single atomic byte. A mutex/condvar pair next to
//! it lets the task park while `Ready` and be woken by the next transition
//! instead of polling.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Sub-state of the background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReceiverState {
    /// Task is idle; no I/O is performed.
    Ready = 0,
    /// Task waits for the slot under the cursor and delivers buffers.
    Sampling = 1,
    /// Task is terminating or has terminated.
    Exiting = 2,
}

impl ReceiverState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Sampling,
            _ => Self::Exiting,
        }
    }
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Sampling => write!(f, "sampling"),
            Self::Exiting => write!(f, "exiting"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell {
    state: AtomicU8,
    /// Bumped on every transition into `Sampling`.
    generation: AtomicU64,
    park: Mutex<()>,
    wake: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ReceiverState::Ready as u8),
            generation: AtomicU64::new(0),
            park: Mutex::new(()),
            wake: Condvar::new(),
        }
    }
}

impl StateCell {
    pub(crate) fn load(&self) -> ReceiverState {
        ReceiverState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Unconditionally moves to `to` and wakes a parked task.
    pub(crate) fn store(&self, to: ReceiverState) {
        self.state.store(to as u8, Ordering::Release);
        self.notify();
    }

    /// Moves `from → to` if the state is still `from`.
    ///
    /// Returns the state observed when the transition did not apply.
    pub(crate) fn transition(
        &self,
        from: ReceiverState,
        to: ReceiverState,
    ) -> Result<(), ReceiverState> {
        if to == ReceiverState::Sampling && self.load() == from {
            // Published before the state so the task never samples with a
            // stale generation. Only the controller enters Sampling.
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| self.notify())
            .map_err(ReceiverState::from_u8)
    }

    /// Parks the calling thread while the state is `Ready`, for at most `timeout`.
    pub(crate) fn park_while_ready(&self, timeout: Duration) {
        let guard = self.park.lock().unwrap_or_else(PoisonError::into_inner);
        if self.load() == ReceiverState::Ready {
            let _ = self
                .wake
                .wait_timeout(guard, timeout)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn notify(&self) {
        // Taking the lock orders this wakeup after any in-progress state check
        // in `park_while_ready`, so the wakeup cannot be lost.
        drop(self.park.lock().unwrap_or_else(PoisonError::into_inner));
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn transitions_follow_the_state_machine() {
        let cell = StateCell::default();
        assert_eq!(cell.load(), ReceiverState::Ready);

        cell.transition(ReceiverState::Ready, ReceiverState::Sampling).unwrap();
        assert_eq!(cell.load(), ReceiverState::Sampling);
        assert_eq!(cell.generation(), 1);

        assert_eq!(
            cell.transition(ReceiverState::Ready, ReceiverState::Sampling),
            Err(ReceiverState::Sampling)
        );

        cell.store(ReceiverState::Exiting);
        assert_eq!(
            cell.transition(ReceiverState::Sampling, ReceiverState::Ready),
            Err(ReceiverState::Exiting)
        );
    }

    #[test]
    fn park_returns_early_on_transition() {
        let cell = Arc::new(StateCell::default());
        let waker = Arc::clone(&cell);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.store(ReceiverState::Exiting);
        });

        let started = Instant::now();
        cell.park_while_ready(Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(cell.load(), ReceiverState::Exiting);
        handle.join().unwrap();
    }

    #[test]
    fn park_does_not_block_outside_ready() {
        let cell = StateCell::default();
        cell.store(ReceiverState::Sampling);
        let started = Instant::now();
        cell.park_while_ready(Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
