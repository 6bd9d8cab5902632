//! Device channel: the boundary with the kernel side.
//!
//! The receiver consumes three things from the device, all through the
//! [`DeviceChannel`] trait:
//!
//! - **Notification handles**: one per slot, raised by the kernel when the
//!   coprocessor has filled that slot ([`Notification`]).
//! - **Control commands**: bind a handle to a slot index, and query how many
//!   bytes were written into a slot ([`ControlCommand`]).
//! - **Mapped regions**: one fixed-size shared mapping per slot
//!   ([`RegionMemory`]).
//!
//! Two implementations ship with the crate:
//!
//! - [`rpmsg::RpmsgSdb`] talks to `/dev/rpmsg-sdb` with eventfds, ioctls and
//!   `mmap`.
//! - [`loopback::LoopbackDevice`] keeps everything in-process, with a
//!   [`loopback::Coprocessor`] handle standing in for the companion core.
//!
//! No implementation retries; every failure propagates to the caller.

pub mod eventfd;
pub mod loopback;
pub mod mapping;
pub mod rpmsg;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rustix::io::Errno;
use thiserror::Error;

/// Index of a slot in the buffer pool (`0..count`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// Creates a slot index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the index as `usize` for indexing the pool.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns the next index in round-robin order over `count` slots.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero. A [`Pool`](crate::pool::Pool) always has at
    /// least one slot.
    #[must_use]
    pub const fn next(self, count: u32) -> Self {
        Self((self.0 + 1) % count)
    }
}

impl From<u32> for SlotIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl From<SlotIndex> for u32 {
    fn from(index: SlotIndex) -> Self {
        index.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control commands understood by the kernel side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Bind a notification handle to a slot index.
    SetEventFd,
    /// Query the number of bytes written into a slot since the last query.
    GetDataSize,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetEventFd => write!(f, "SET_EFD"),
            Self::GetDataSize => write!(f, "GET_DATA_SIZE"),
        }
    }
}

/// Errors raised by a device channel.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device file could not be opened.
    #[error("device `{}` unavailable: {source}", path.display())]
    Unavailable { path: PathBuf, source: Errno },
    /// The kernel rejected a control command.
    #[error("control command {command} for slot {slot} failed: {source}")]
    ControlRequestFailed {
        command: ControlCommand,
        slot: SlotIndex,
        source: Errno,
    },
    /// The shared mapping for a slot could not be established.
    #[error("mapping {len} bytes for slot {slot} failed: {source}")]
    MappingFailed {
        slot: SlotIndex,
        len: usize,
        source: Errno,
    },
    /// A notification handle could not be created.
    #[error("creating notification handle for slot {slot} failed: {source}")]
    NotificationFailed { slot: SlotIndex, source: Errno },
}

/// Errors raised while waiting on or draining a notification handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// The far side closed the handle; no further signals can arrive.
    #[error("notification handle closed by the other side")]
    Closed,
    /// The wait or read failed with an errno.
    #[error("notification wait failed: {0}")]
    Os(Errno),
}

/// Outcome of a bounded wait on a notification handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The handle has at least one pending signal.
    Signaled,
    /// The timeout elapsed with no signal.
    TimedOut,
}

/// A per-slot completion signal raised by the kernel side.
pub trait Notification: Send + Sync + 'static {
    /// Blocks until the handle is signaled or `timeout` elapses.
    ///
    /// Does not consume the signal; call [`drain`](Self::drain) for that.
    fn wait(&self, timeout: Duration) -> Result<Wakeup, NotifyError>;

    /// Consumes all pending signals and returns how many were pending.
    ///
    /// Returns [`NotifyError::Closed`] if the other side has closed the handle.
    fn drain(&self) -> Result<u64, NotifyError>;
}

/// A fixed-size region of memory shared with the coprocessor.
///
/// # Safety
///
/// `as_ptr()` must point to `len()` bytes that stay mapped and readable until
/// the value is dropped, and the pointer must not change in between.
pub unsafe trait RegionMemory: Send + 'static {
    /// Start of the region.
    fn as_ptr(&self) -> *const u8;
    /// Size of the region in bytes.
    fn len(&self) -> usize;
    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A kernel-mediated channel to the coprocessor's shared buffers.
///
/// The pool calls these in a fixed order per slot: [`create_event`],
/// [`register_event`], [`map_region`]. Implementations that hand out the next
/// physical buffer on each `map_region` call rely on that order.
///
/// [`create_event`]: Self::create_event
/// [`register_event`]: Self::register_event
/// [`map_region`]: Self::map_region
pub trait DeviceChannel: Send + 'static {
    /// Notification handle type.
    type Event: Notification;
    /// Mapped region type.
    type Region: RegionMemory;

    /// Creates a fresh notification handle for `slot`.
    fn create_event(&self, slot: SlotIndex) -> Result<Self::Event, DeviceError>;

    /// Binds `event` to `slot` on the kernel side.
    fn register_event(&self, slot: SlotIndex, event: &Self::Event) -> Result<(), DeviceError>;

    /// Returns how many bytes the kernel side wrote into `slot` since the last query.
    fn filled_size(&self, slot: SlotIndex) -> Result<u32, DeviceError>;

    /// Maps the next region of `len` bytes, to be used as `slot`.
    fn map_region(&self, slot: SlotIndex, len: usize) -> Result<Self::Region, DeviceError>;
}
