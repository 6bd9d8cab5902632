//! The `/dev/rpmsg-sdb` character device.
//!
//! # Protocol
//!
//! ```text
//! per slot i, in order:
//!   eventfd(0)                           → efd[i]
//!   ioctl(SET_EFD, { i, efd[i] })        bind efd[i] to buffer i
//!   mmap(fd, len, SHARED, offset 0)      kernel hands out buffer i
//!
//! per cycle:
//!   poll(efd[i]) → read(efd[i])
//!   ioctl(GET_DATA_SIZE, { i, 0 })       → { i, filled }
//! ```
//!
//! Both ioctls live in group `'R'`. The kernel module declares their size
//! field from a *pointer* to the payload struct, so the opcodes encode
//! `size_of::<*mut T>()` rather than `size_of::<T>()`; the opcodes below
//! reproduce that exactly.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::fs::{Mode, OFlags, open};
use rustix::io::Errno;
use rustix::ioctl::{Opcode, Setter, Updater, ioctl, opcode};

use super::eventfd::EventFd;
use super::mapping::Mapping;
use super::{ControlCommand, DeviceChannel, DeviceError, SlotIndex};
use crate::KernelAbi;
use crate::trace::{debug, info};

/// Payload of `RPMSG_SDB_IOCTL_SET_EFD`.
#[derive(Debug, Clone, Copy, KernelAbi)]
#[repr(C)]
pub struct SetEventFd {
    pub buffer_id: i32,
    pub event_fd: i32,
}

/// Payload of `RPMSG_SDB_IOCTL_GET_DATA_SIZE`; `size` is written by the kernel.
#[derive(Debug, Clone, Copy, KernelAbi)]
#[repr(C)]
pub struct GetDataSize {
    pub buffer_id: i32,
    pub size: u32,
}

/// `_IOW('R', 0x00, struct rpmsg_sdb_ioctl_set_efd *)`
pub const SET_EFD: Opcode = opcode::write::<*mut SetEventFd>(b'R', 0x00);

/// `_IOWR('R', 0x01, struct rpmsg_sdb_ioctl_get_data_size *)`
pub const GET_DATA_SIZE: Opcode = opcode::read_write::<*mut GetDataSize>(b'R', 0x01);

/// Process-wide claim on the device; at most one receiver maps its buffers.
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Wraps a payload for a write-only ioctl.
fn setter<const OP: Opcode, T: KernelAbi>(value: T) -> Setter<OP, T> {
    // SAFETY: `KernelAbi` guarantees a repr(C) integer-only layout matching
    // the kernel struct that OP's size field was computed for.
    unsafe { Setter::new(value) }
}

/// Wraps a payload for a read/write ioctl.
fn updater<const OP: Opcode, T: KernelAbi>(value: &mut T) -> Updater<'_, OP, T> {
    // SAFETY: as above; `KernelAbi` also makes every bit pattern the kernel
    // writes back a valid `T`.
    unsafe { Updater::new(value) }
}

/// An open, exclusively claimed `/dev/rpmsg-sdb`.
#[derive(Debug)]
pub struct RpmsgSdb {
    fd: OwnedFd,
    path: PathBuf,
}

impl RpmsgSdb {
    /// Opens the device read/write and claims it for this process.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Unavailable`] if the path cannot be opened, or with
    /// `EBUSY` if another `RpmsgSdb` is still alive in this process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();

        let fd = open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()).map_err(|source| {
            DeviceError::Unavailable {
                path: path.clone(),
                source,
            }
        })?;

        if CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::Unavailable {
                path,
                source: Errno::BUSY,
            });
        }

        info!(path = %path.display(), "rpmsg-sdb device opened");
        Ok(Self { fd, path })
    }

    /// The path this device was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RpmsgSdb {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "rpmsg-sdb device closed");
        CLAIMED.store(false, Ordering::Release);
    }
}

fn buffer_id(slot: SlotIndex) -> i32 {
    // Pools are far smaller than i32::MAX; saturate rather than wrap.
    i32::try_from(u32::from(slot)).unwrap_or(i32::MAX)
}

impl DeviceChannel for RpmsgSdb {
    type Event = EventFd;
    type Region = Mapping;

    fn create_event(&self, slot: SlotIndex) -> Result<EventFd, DeviceError> {
        EventFd::new().map_err(|source| DeviceError::NotificationFailed { slot, source })
    }

    fn register_event(&self, slot: SlotIndex, event: &EventFd) -> Result<(), DeviceError> {
        let payload = SetEventFd {
            buffer_id: buffer_id(slot),
            event_fd: event.as_raw_fd(),
        };

        // SAFETY: SET_EFD is the driver's opcode for exactly this payload.
        unsafe { ioctl(&self.fd, setter::<SET_EFD, _>(payload)) }.map_err(|source| {
            DeviceError::ControlRequestFailed {
                command: ControlCommand::SetEventFd,
                slot,
                source,
            }
        })?;

        debug!(slot = %slot, event_fd = payload.event_fd, "eventfd bound");
        Ok(())
    }

    fn filled_size(&self, slot: SlotIndex) -> Result<u32, DeviceError> {
        let mut query = GetDataSize {
            buffer_id: buffer_id(slot),
            size: 0,
        };

        // SAFETY: GET_DATA_SIZE is the driver's opcode for exactly this payload.
        unsafe { ioctl(&self.fd, updater::<GET_DATA_SIZE, _>(&mut query)) }.map_err(
            |source| DeviceError::ControlRequestFailed {
                command: ControlCommand::GetDataSize,
                slot,
                source,
            },
        )?;

        Ok(query.size)
    }

    fn map_region(&self, slot: SlotIndex, len: usize) -> Result<Mapping, DeviceError> {
        Mapping::of_device(&self.fd, len)
            .map_err(|source| DeviceError::MappingFailed { slot, len, source })
    }
}
