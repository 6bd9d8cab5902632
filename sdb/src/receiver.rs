//! Lifecycle controller: owns the pool and the receiver thread.
//!
//! # Lifecycle
//!
//! ```text
//! Receiver::new(config)
//!   │ init(channel, region_size, count)   pool created, no thread yet
//!   │   (init_device(..) opens /dev/rpmsg-sdb first)
//!   │ init_receiver()                     thread spawned, state = Ready
//!   │ start() / stop()                    Ready ⇄ Sampling, repeatable
//!   │ deinit_receiver()                   state = Exiting, join, pool destroyed
//!   ▼
//! (init again to reuse the receiver)
//! ```
//!
//! The pool moves into the receiver thread on `init_receiver()` and comes back
//! through the thread's join handle, so it is destroyed only after the thread
//! can no longer touch it.
//!
//! # Threading
//!
//! All methods are meant to be called from one controlling thread. The
//! receiver thread reads the state, the handler registry and the counters;
//! it never calls back into the controller.

pub mod callback;
pub mod state;
pub mod stats;
mod task;

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::config::{CounterPolicy, ReceiverConfig};
use crate::device::rpmsg::RpmsgSdb;
use crate::device::{DeviceChannel, DeviceError, NotifyError, SlotIndex};
use crate::pool::Pool;
use crate::trace::{debug, info, warn};

use callback::{BufferReady, RegistryError};
use state::ReceiverState;
use stats::Stats;
use task::{ReceiverTask, Shared, TaskExit, TaskSettings};

/// Errors returned by receiver operations, or carried out of the receiver
/// thread and returned by [`Receiver::deinit_receiver`].
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// The device channel failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A handler registration precondition failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Waiting on or draining a slot's handle failed.
    #[error("notification for slot {slot} failed: {source}")]
    Notify { slot: SlotIndex, source: NotifyError },
    /// The pool geometry is unusable.
    #[error("invalid pool: {count} regions of {region_size} bytes")]
    InvalidPool { region_size: usize, count: u32 },
    /// `init_receiver` was called without a pool.
    #[error("receiver is not initialized; call init first")]
    NotInitialized,
    /// `init` was called while a pool or thread already exists.
    #[error("receiver is already initialized")]
    AlreadyInitialized,
    /// `init_receiver` was called while the thread is running.
    #[error("receiver thread already spawned")]
    TaskAlreadySpawned,
    /// `deinit_receiver` was called with no thread running.
    #[error("receiver thread not spawned")]
    TaskNotSpawned,
    /// The OS refused to spawn the receiver thread.
    #[error("failed to spawn receiver thread: {0}")]
    TaskSpawnFailed(#[source] io::Error),
    /// The receiver thread or the handler panicked.
    #[error("receiver thread panicked")]
    TaskPanicked,
    /// The far side closed a slot's handle; the receiver thread has stopped.
    #[error("channel closed unexpectedly on slot {slot}")]
    ChannelClosedUnexpectedly { slot: SlotIndex },
    /// A non-empty cycle arrived with no handler registered; its data was dropped.
    #[error("no buffer-ready handler registered; cycle on slot {slot} dropped")]
    NoCallbackRegistered { slot: SlotIndex },
}

/// Receives filled regions from the coprocessor on a background thread.
///
/// `C` is the device channel; it defaults to the real [`RpmsgSdb`] device.
/// Use [`LoopbackDevice`](crate::device::loopback::LoopbackDevice) to run
/// without one.
///
/// Dropping a `Receiver` with a running thread stops and joins it.
pub struct Receiver<C: DeviceChannel = RpmsgSdb> {
    config: ReceiverConfig,
    shared: Arc<Shared>,
    pool: Option<Pool<C>>,
    task: Option<JoinHandle<TaskExit<C>>>,
}

impl<C: DeviceChannel> Receiver<C> {
    /// Creates an uninitialized receiver.
    #[must_use]
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            pool: None,
            task: None,
        }
    }

    /// The configuration this receiver was built with.
    #[must_use]
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Creates the buffer pool over `channel`.
    ///
    /// Does not start the receiver thread.
    ///
    /// # Errors
    ///
    /// - [`ReceiverError::AlreadyInitialized`] if a pool or thread exists
    /// - any error from [`Pool::create`]; nothing is left mapped on failure
    pub fn init(&mut self, channel: C, region_size: usize, count: u32) -> crate::Result<()> {
        if self.pool.is_some() || self.task.is_some() {
            return Err(ReceiverError::AlreadyInitialized);
        }

        self.pool = Some(Pool::create(channel, region_size, count)?);
        info!(count, region_size, "receiver initialized");
        Ok(())
    }

    /// Whether a pool exists, either held here or owned by the thread.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.pool.is_some() || self.task.is_some()
    }

    /// Spawns the receiver thread in the `Ready` state.
    ///
    /// # Errors
    ///
    /// - [`ReceiverError::TaskAlreadySpawned`] if the thread is running
    /// - [`ReceiverError::NotInitialized`] if there is no pool
    /// - [`ReceiverError::TaskSpawnFailed`] if the OS refuses the thread; the
    ///   pool is destroyed in that case and `init` must be called again
    pub fn init_receiver(&mut self) -> crate::Result<()> {
        if self.task.is_some() {
            return Err(ReceiverError::TaskAlreadySpawned);
        }
        let pool = self.pool.take().ok_or(ReceiverError::NotInitialized)?;

        self.shared.state.store(ReceiverState::Ready);
        self.shared.counters.set_cursor(0);

        let task = ReceiverTask::new(pool, Arc::clone(&self.shared), TaskSettings::from(&self.config));

        debug!(name = %self.config.thread_name, "spawning receiver thread");
        let handle = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || task.run())
            .map_err(|e| {
                warn!(error = %e, "failed to spawn receiver thread");
                ReceiverError::TaskSpawnFailed(e)
            })?;

        self.task = Some(handle);
        info!("receiver thread spawned");
        Ok(())
    }

    /// Starts sampling from slot 0.
    ///
    /// Does nothing unless the state is `Ready`. With
    /// [`CounterPolicy::ResetOnStart`] the byte totals are cleared first.
    pub fn start(&self) {
        let state = self.shared.state.load();
        if state != ReceiverState::Ready {
            debug!(%state, "start ignored");
            return;
        }

        if self.config.counters == CounterPolicy::ResetOnStart {
            self.shared.counters.reset_totals();
        }
        self.shared.counters.set_cursor(0);

        match self
            .shared
            .state
            .transition(ReceiverState::Ready, ReceiverState::Sampling)
        {
            Ok(()) => {
                info!("sampling started");
            }
            Err(_state) => {
                debug!(state = %_state, "start ignored");
            }
        }
    }

    /// Stops sampling; the thread goes back to `Ready`.
    ///
    /// Idempotent. If a cycle is being delivered, waits for the handler to
    /// return, so no handler call is in progress or starts once this returns.
    /// Must not be called from inside the handler.
    pub fn stop(&self) {
        match self
            .shared
            .state
            .transition(ReceiverState::Sampling, ReceiverState::Ready)
        {
            Ok(()) => {
                self.shared.wait_for_cycle();
                info!("sampling stopped");
            }
            Err(_state) => {
                debug!(state = %_state, "stop ignored");
            }
        }
    }

    /// Stops the receiver thread, joins it, and destroys the pool.
    ///
    /// All counters return to zero. Blocks for up to one `wait_slice` (plus any
    /// handler call in progress) while the thread notices `Exiting`.
    ///
    /// # Errors
    ///
    /// - [`ReceiverError::TaskNotSpawned`] if no thread is running
    /// - [`ReceiverError::TaskPanicked`] if the thread panicked
    /// - the fatal error that ended the thread early, if any; teardown has
    ///   still completed when it is returned
    pub fn deinit_receiver(&mut self) -> crate::Result<()> {
        let handle = self.task.take().ok_or(ReceiverError::TaskNotSpawned)?;

        info!("stopping receiver thread");
        self.shared.state.store(ReceiverState::Exiting);

        let joined = handle.join();
        self.shared.counters.reset();

        let exit = joined.map_err(|_| ReceiverError::TaskPanicked)?;
        drop(exit.pool);
        info!("receiver deinitialized");
        exit.result
    }

    /// Registers the buffer-ready handler.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] if a handler is present.
    pub fn register_callback(&self, handler: Arc<dyn BufferReady>) -> crate::Result<()> {
        self.shared.callbacks.register(handler)?;
        debug!("buffer-ready handler registered");
        Ok(())
    }

    /// Unregisters `handler`, matched by identity.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotRegistered`] if `handler` is not the registered one
    /// - [`RegistryError::BusyWhileSampling`] while sampling
    pub fn unregister_callback(&self, handler: &Arc<dyn BufferReady>) -> crate::Result<()> {
        self.shared
            .callbacks
            .unregister(handler, self.shared.state.load())?;
        debug!("buffer-ready handler unregistered");
        Ok(())
    }

    /// Current state of the receiver thread.
    #[must_use]
    pub fn state(&self) -> ReceiverState {
        self.shared.state.load()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }
}

impl Receiver<RpmsgSdb> {
    /// Opens the configured device and creates the pool over it.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Unavailable`] if the device cannot be opened, otherwise
    /// as [`init`](Self::init).
    pub fn init_device(&mut self, region_size: usize, count: u32) -> crate::Result<()> {
        if self.is_initialized() {
            return Err(ReceiverError::AlreadyInitialized);
        }
        let device = RpmsgSdb::open(&self.config.device_path)?;
        self.init(device, region_size, count)
    }
}

impl<C: DeviceChannel> Drop for Receiver<C> {
    fn drop(&mut self) {
        if self.task.is_some()
            && let Err(_e) = self.deinit_receiver()
        {
            warn!(error = %_e, "receiver dropped after a failure");
        }
    }
}

impl<C: DeviceChannel> std::fmt::Debug for Receiver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("state", &self.state())
            .field("initialized", &self.is_initialized())
            .field("spawned", &self.task.is_some())
            .finish_non_exhaustive()
    }
}
