//! The receiver thread's loop.
//!
//! ```text
//! loop:
//!   Exiting  → return
//!   Ready    → park until the next transition (bounded by idle_poll)
//!   Sampling → wait(cursor slot, wait_slice)
//!                timed out        → count silence, loop
//!                signaled         → state still Sampling? else loop
//!                drain            → Closed is fatal
//!                filled_size      → failure is fatal
//!                0                → empty cycle
//!                n > 0            → totals += n, estimate, handler(bytes[..n])
//!              cursor = (cursor + 1) % count
//! ```
//!
//! Waits are sliced so that `stop()` and `deinit_receiver()` are observed
//! within one `wait_slice` rather than one `notify_timeout`. Only the slot
//! under the cursor is awaited; a signal on any other slot stays pending
//! until the cursor reaches it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::ReceiverConfig;
use crate::device::{DeviceChannel, Notification, NotifyError, SlotIndex, Wakeup};
use crate::pool::Pool;
use crate::topology::{CpuConfig, pin_to_core};
use crate::trace::{debug, error, info, trace, warn};

use super::ReceiverError;
use super::callback::CallbackRegistry;
use super::state::{ReceiverState, StateCell};
use super::stats::{Counters, estimate_decoded_size};

/// State the controller and the receiver thread both reach.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) counters: Counters,
    /// Held by the thread from its last state check until the handler returns.
    cycle: Mutex<()>,
}

impl Shared {
    /// Blocks until no cycle is being delivered.
    pub(crate) fn wait_for_cycle(&self) {
        drop(self.cycle.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// What the thread hands back on exit: the pool for teardown, and why it stopped.
pub(crate) struct TaskExit<C: DeviceChannel> {
    pub(crate) pool: Pool<C>,
    pub(crate) result: Result<(), ReceiverError>,
}

#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    idle_poll: Duration,
    notify_timeout: Duration,
    wait_slice: Duration,
    callback_budget: Option<Duration>,
    cpu: CpuConfig,
}

impl From<&ReceiverConfig> for TaskSettings {
    fn from(config: &ReceiverConfig) -> Self {
        Self {
            // Zero waits would spin.
            idle_poll: config.idle_poll.max(Duration::from_millis(1)),
            notify_timeout: config.notify_timeout,
            // Never wait longer than the timeout.
            wait_slice: config
                .wait_slice
                .max(Duration::from_millis(1))
                .min(config.notify_timeout.max(Duration::from_millis(1))),
            callback_budget: config.callback_budget,
            cpu: config.cpu,
        }
    }
}

/// Outcome of one pass through the loop body.
enum Step {
    Continue,
    Exit,
}

pub(crate) struct ReceiverTask<C: DeviceChannel> {
    pool: Pool<C>,
    shared: Arc<Shared>,
    settings: TaskSettings,
    cursor: SlotIndex,
    generation: u64,
    silent_for: Duration,
}

impl<C: DeviceChannel> ReceiverTask<C> {
    pub(crate) fn new(pool: Pool<C>, shared: Arc<Shared>, settings: TaskSettings) -> Self {
        let generation = shared.state.generation();
        Self {
            pool,
            shared,
            settings,
            cursor: SlotIndex::new(0),
            generation,
            silent_for: Duration::ZERO,
        }
    }

    /// Runs until `Exiting` is observed or a fatal error occurs.
    pub(crate) fn run(mut self) -> TaskExit<C> {
        if let Some(core) = self.settings.cpu.resolve() {
            if pin_to_core(core) {
                debug!(core, "receiver thread pinned");
            } else {
                warn!(core, "failed to pin receiver thread");
            }
        }

        info!(
            count = self.pool.count(),
            region_size = self.pool.region_size(),
            "receiver thread started"
        );

        let result = loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Exit) => break Ok(()),
                Err(e) => {
                    error!(slot = %self.cursor, error = %e, "receiver thread failed");
                    self.shared.state.store(ReceiverState::Exiting);
                    break Err(e);
                }
            }
        };

        info!("receiver thread exiting");
        TaskExit {
            pool: self.pool,
            result,
        }
    }

    fn step(&mut self) -> Result<Step, ReceiverError> {
        match self.shared.state.load() {
            ReceiverState::Exiting => Ok(Step::Exit),
            ReceiverState::Ready => {
                self.shared.state.park_while_ready(self.settings.idle_poll);
                Ok(Step::Continue)
            }
            ReceiverState::Sampling => {
                self.sync_generation();
                self.sample()?;
                Ok(Step::Continue)
            }
        }
    }

    /// Restarts from slot 0 after every `start()`.
    fn sync_generation(&mut self) {
        let generation = self.shared.state.generation();
        if generation != self.generation {
            self.generation = generation;
            self.cursor = SlotIndex::new(0);
            self.silent_for = Duration::ZERO;
            self.shared.counters.set_cursor(0);
            debug!(generation, "sampling started");
        }
    }

    fn sample(&mut self) -> Result<(), ReceiverError> {
        let slot_index = self.cursor;
        let Some(slot) = self.pool.slot(slot_index) else {
            // The cursor is always reduced modulo the pool size.
            unreachable!("cursor {slot_index} outside pool of {}", self.pool.count());
        };

        let wake = slot
            .event()
            .wait(self.settings.wait_slice)
            .map_err(|e| notify_error(slot_index, e))?;

        if wake == Wakeup::TimedOut {
            self.silent_for += self.settings.wait_slice;
            if self.silent_for >= self.settings.notify_timeout {
                debug!(
                    slot = %slot_index,
                    timeout_ms = self.settings.notify_timeout.as_millis() as u64,
                    "no buffer data within timeout"
                );
                self.shared.counters.timed_out();
                self.silent_for = Duration::ZERO;
            }
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let _cycle = shared.cycle.lock().unwrap_or_else(PoisonError::into_inner);

        // stop(), a restart or deinit raced with the signal; leave it pending.
        if shared.state.load() != ReceiverState::Sampling
            || shared.state.generation() != self.generation
        {
            return Ok(());
        }

        let _pending = slot
            .event()
            .drain()
            .map_err(|e| notify_error(slot_index, e))?;
        trace!(slot = %slot_index, pending = _pending, "notification drained");

        let filled = self.pool.channel().filled_size(slot_index)?;
        if filled == 0 {
            debug!(slot = %slot_index, "slot is empty");
            self.shared.counters.empty();
        } else {
            self.deliver(slot_index, filled)?;
        }

        self.advance();
        Ok(())
    }

    fn deliver(&self, slot_index: SlotIndex, filled: u32) -> Result<(), ReceiverError> {
        let Some(slot) = self.pool.slot(slot_index) else {
            unreachable!("cursor {slot_index} outside pool of {}", self.pool.count());
        };

        let mut len = filled as usize;
        if len > slot.region_len() {
            warn!(
                slot = %slot_index,
                filled,
                region_len = slot.region_len(),
                "filled size exceeds region, clamping"
            );
            len = slot.region_len();
        }

        debug!(slot = %slot_index, filled = len, "buffer ready");
        let decoded = slot.with_filled(len, estimate_decoded_size);
        self.shared.counters.add_payload(len as u64, decoded);

        let Some(handler) = self.shared.callbacks.current() else {
            let _e = ReceiverError::NoCallbackRegistered { slot: slot_index };
            warn!(error = %_e, "cycle dropped");
            self.shared.counters.dropped();
            return Ok(());
        };

        let started = minstant::Instant::now();
        let _ack = catch_unwind(AssertUnwindSafe(|| {
            slot.with_filled(len, |bytes| handler.on_buffer_ready(bytes))
        }))
        .map_err(|_| ReceiverError::TaskPanicked)?;
        let elapsed = started.elapsed();

        trace!(slot = %slot_index, ack = _ack, elapsed_us = elapsed.as_micros() as u64, "handler returned");
        if let Some(budget) = self.settings.callback_budget
            && elapsed > budget
        {
            warn!(
                slot = %slot_index,
                elapsed_us = elapsed.as_micros() as u64,
                budget_us = budget.as_micros() as u64,
                "buffer-ready handler exceeded its budget"
            );
        }

        self.shared.counters.delivered();
        Ok(())
    }

    fn advance(&mut self) {
        self.cursor = self.cursor.next(self.pool.count());
        self.silent_for = Duration::ZERO;
        self.shared.counters.set_cursor(self.cursor.into());
    }
}

fn notify_error(slot: SlotIndex, e: NotifyError) -> ReceiverError {
    match e {
        NotifyError::Closed => ReceiverError::ChannelClosedUnexpectedly { slot },
        source @ NotifyError::Os(_) => ReceiverError::Notify { slot, source },
    }
}
