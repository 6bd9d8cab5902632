//! In-process device channel for host development and tests.
//!
//! [`LoopbackDevice`] implements [`DeviceChannel`] without a kernel module:
//! regions are anonymous shared mappings and notification handles are
//! software counters. A [`Coprocessor`] handle plays the companion core,
//! filling regions and raising their events.
//!
//! ```text
//! Coprocessor                  LoopbackDevice                Receiver
//!     │ fill(slot, bytes) ───────> region[slot], filled[slot]
//!     │ signal(slot) ────────────> event[slot] ───────wait──────>│
//!     │                                       <──filled_size()───│
//!     │                                       ───region bytes───>│ callback
//! ```
//!
//! Resource accounting ([`live_events`](LoopbackDevice::live_events),
//! [`live_regions`](LoopbackDevice::live_regions),
//! [`registered`](LoopbackDevice::registered)) tracks every handle and mapping
//! handed out, so tests can assert that teardown and failed pool creation
//! leak nothing. [`FaultPlan`] fails a chosen step of pool creation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rustix::io::Errno;

use super::mapping::Mapping;
use super::{
    ControlCommand, DeviceChannel, DeviceError, Notification, NotifyError, RegionMemory,
    SlotIndex, Wakeup,
};
use crate::trace::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which step of the device protocol should fail, and for which slot.
///
/// Pool creation performs three steps per slot (create event, register
/// event, map region), so step `3 * i + k` is step `k` of slot `i`; see
/// [`FaultPlan::at_step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail `create_event` for this slot.
    pub create_event: Option<SlotIndex>,
    /// Fail `register_event` for this slot.
    pub register_event: Option<SlotIndex>,
    /// Fail `map_region` for this slot.
    pub map_region: Option<SlotIndex>,
    /// Fail `filled_size` for this slot.
    pub filled_size: Option<SlotIndex>,
}

impl FaultPlan {
    /// No faults.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            create_event: None,
            register_event: None,
            map_region: None,
            filled_size: None,
        }
    }

    /// Fails the `step`-th pool creation step (0-based, three per slot).
    #[must_use]
    pub const fn at_step(step: u32) -> Self {
        let slot = Some(SlotIndex::new(step / 3));
        match step % 3 {
            0 => Self {
                create_event: slot,
                ..Self::none()
            },
            1 => Self {
                register_event: slot,
                ..Self::none()
            },
            _ => Self {
                map_region: slot,
                ..Self::none()
            },
        }
    }

    /// Fails every filled-size query for `slot`.
    #[must_use]
    pub const fn filled_size_at(slot: SlotIndex) -> Self {
        Self {
            filled_size: Some(slot),
            ..Self::none()
        }
    }
}

#[derive(Debug, Default)]
struct Accounting {
    channels: AtomicUsize,
    events: AtomicUsize,
    regions: AtomicUsize,
}

#[derive(Debug, Default)]
struct EventState {
    pending: u64,
    closed: bool,
}

#[derive(Debug)]
struct EventCell {
    state: Mutex<EventState>,
    cond: Condvar,
    accounting: Arc<Accounting>,
}

impl EventCell {
    fn raise(&self) {
        lock(&self.state).pending += 1;
        self.cond.notify_all();
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }
}

impl Drop for EventCell {
    fn drop(&mut self) {
        self.accounting.events.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Software notification handle returned by [`LoopbackDevice`].
#[derive(Debug)]
pub struct LoopbackEvent(Arc<EventCell>);

impl Notification for LoopbackEvent {
    fn wait(&self, timeout: Duration) -> Result<Wakeup, NotifyError> {
        let state = lock(&self.0.state);
        let (state, _) = self
            .0
            .cond
            .wait_timeout_while(state, timeout, |s| s.pending == 0 && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        // A closed handle reads as "ready"; the drain that follows reports it.
        if state.pending > 0 || state.closed {
            Ok(Wakeup::Signaled)
        } else {
            Ok(Wakeup::TimedOut)
        }
    }

    fn drain(&self) -> Result<u64, NotifyError> {
        let mut state = lock(&self.0.state);
        if state.closed {
            return Err(NotifyError::Closed);
        }
        Ok(std::mem::take(&mut state.pending))
    }
}

#[derive(Debug)]
struct RegionCell {
    mapping: Mapping,
    accounting: Arc<Accounting>,
}

impl Drop for RegionCell {
    fn drop(&mut self) {
        self.accounting.regions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Anonymous shared mapping returned by [`LoopbackDevice`].
#[derive(Debug)]
pub struct LoopbackRegion(Arc<RegionCell>);

// SAFETY: the inner `Mapping` upholds the contract and the `Arc` keeps it
// mapped at least as long as this handle.
unsafe impl RegionMemory for LoopbackRegion {
    fn as_ptr(&self) -> *const u8 {
        self.0.mapping.as_ptr()
    }

    fn len(&self) -> usize {
        self.0.mapping.len()
    }
}

#[derive(Debug, Default)]
struct SlotRecord {
    event: Weak<EventCell>,
    region: Weak<RegionCell>,
    filled: u32,
}

#[derive(Debug, Default)]
struct Shared {
    slots: Mutex<Vec<SlotRecord>>,
    faults: Mutex<FaultPlan>,
    accounting: Arc<Accounting>,
}

impl Shared {
    fn with_slot<R>(&self, slot: SlotIndex, f: impl FnOnce(&mut SlotRecord) -> R) -> R {
        let mut slots = lock(&self.slots);
        let i = slot.as_usize();
        if slots.len() <= i {
            slots.resize_with(i + 1, SlotRecord::default);
        }
        f(&mut slots[i])
    }

    fn faults(&self) -> FaultPlan {
        *lock(&self.faults)
    }
}

/// In-process [`DeviceChannel`].
///
/// Dropping the device closes the channel; [`Coprocessor::live_channels`]
/// observes it.
#[derive(Debug)]
pub struct LoopbackDevice {
    shared: Arc<Shared>,
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.shared.accounting.channels.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LoopbackDevice {
    /// Creates a device with no faults.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        shared.accounting.channels.fetch_add(1, Ordering::AcqRel);
        Self { shared }
    }

    /// Creates a device that fails according to `plan`.
    #[must_use]
    pub fn with_faults(plan: FaultPlan) -> Self {
        let device = Self::new();
        device.set_faults(plan);
        device
    }

    /// Replaces the active fault plan.
    pub fn set_faults(&self, plan: FaultPlan) {
        *lock(&self.shared.faults) = plan;
    }

    /// Returns a handle that drives this device from the coprocessor side.
    ///
    /// The handle stays valid after the device is moved into a pool.
    #[must_use]
    pub fn coprocessor(&self) -> Coprocessor {
        Coprocessor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of notification handles created and not yet closed.
    #[must_use]
    pub fn live_events(&self) -> usize {
        self.coprocessor().live_events()
    }

    /// Number of regions mapped and not yet unmapped.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.coprocessor().live_regions()
    }

    /// Number of slots bound to a live notification handle.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.coprocessor().registered()
    }
}

impl DeviceChannel for LoopbackDevice {
    type Event = LoopbackEvent;
    type Region = LoopbackRegion;

    fn create_event(&self, slot: SlotIndex) -> Result<LoopbackEvent, DeviceError> {
        if self.shared.faults().create_event == Some(slot) {
            return Err(DeviceError::NotificationFailed {
                slot,
                source: Errno::MFILE,
            });
        }

        let accounting = Arc::clone(&self.shared.accounting);
        accounting.events.fetch_add(1, Ordering::AcqRel);
        Ok(LoopbackEvent(Arc::new(EventCell {
            state: Mutex::new(EventState::default()),
            cond: Condvar::new(),
            accounting,
        })))
    }

    fn register_event(&self, slot: SlotIndex, event: &LoopbackEvent) -> Result<(), DeviceError> {
        if self.shared.faults().register_event == Some(slot) {
            return Err(DeviceError::ControlRequestFailed {
                command: ControlCommand::SetEventFd,
                slot,
                source: Errno::INVAL,
            });
        }

        self.shared
            .with_slot(slot, |rec| rec.event = Arc::downgrade(&event.0));
        trace!(slot = %slot, "loopback event bound");
        Ok(())
    }

    fn filled_size(&self, slot: SlotIndex) -> Result<u32, DeviceError> {
        if self.shared.faults().filled_size == Some(slot) {
            return Err(DeviceError::ControlRequestFailed {
                command: ControlCommand::GetDataSize,
                slot,
                source: Errno::IO,
            });
        }

        Ok(self
            .shared
            .with_slot(slot, |rec| std::mem::take(&mut rec.filled)))
    }

    fn map_region(&self, slot: SlotIndex, len: usize) -> Result<LoopbackRegion, DeviceError> {
        if self.shared.faults().map_region == Some(slot) {
            return Err(DeviceError::MappingFailed {
                slot,
                len,
                source: Errno::NOMEM,
            });
        }

        let mapping = Mapping::anonymous(len)
            .map_err(|source| DeviceError::MappingFailed { slot, len, source })?;

        let accounting = Arc::clone(&self.shared.accounting);
        accounting.regions.fetch_add(1, Ordering::AcqRel);
        let cell = Arc::new(RegionCell {
            mapping,
            accounting,
        });

        self.shared
            .with_slot(slot, |rec| rec.region = Arc::downgrade(&cell));
        Ok(LoopbackRegion(cell))
    }
}

/// The companion core's side of a [`LoopbackDevice`].
#[derive(Debug, Clone)]
pub struct Coprocessor {
    shared: Arc<Shared>,
}

impl Coprocessor {
    /// Writes `bytes` at the start of `slot`'s region and records the filled
    /// size for the next query.
    ///
    /// Returns the number of bytes written (truncated to the region length),
    /// or `None` if `slot` has no live region.
    ///
    /// # Safety
    ///
    /// The receiver must not be reading `slot` while this runs: only fill a
    /// slot that has not been signaled since its last delivery.
    pub unsafe fn fill(&self, slot: SlotIndex, bytes: &[u8]) -> Option<usize> {
        let region = self.shared.with_slot(slot, |rec| rec.region.upgrade())?;
        // SAFETY: the caller guarantees no concurrent reader of this slot.
        let written = unsafe { region.mapping.write_at_start(bytes) };
        let filled = u32::try_from(written).unwrap_or(u32::MAX);
        self.shared.with_slot(slot, |rec| rec.filled = filled);
        Some(written)
    }

    /// Records a filled size without touching the region.
    ///
    /// Lets tests report sizes the region cannot hold.
    pub fn set_filled(&self, slot: SlotIndex, size: u32) {
        self.shared.with_slot(slot, |rec| rec.filled = size);
    }

    /// Raises `slot`'s notification handle.
    ///
    /// Returns `false` if no live handle is bound to `slot`.
    pub fn signal(&self, slot: SlotIndex) -> bool {
        match self.shared.with_slot(slot, |rec| rec.event.upgrade()) {
            Some(event) => {
                event.raise();
                true
            }
            None => false,
        }
    }

    /// Fills `slot` and raises its handle.
    ///
    /// # Safety
    ///
    /// Same contract as [`fill`](Self::fill).
    pub unsafe fn deliver(&self, slot: SlotIndex, bytes: &[u8]) -> bool {
        // SAFETY: forwarded to the caller.
        unsafe { self.fill(slot, bytes) }.is_some() && self.signal(slot)
    }

    /// Closes `slot`'s handle from the far side.
    ///
    /// Returns `false` if no live handle is bound to `slot`.
    pub fn close_event(&self, slot: SlotIndex) -> bool {
        match self.shared.with_slot(slot, |rec| rec.event.upgrade()) {
            Some(event) => {
                event.close();
                true
            }
            None => false,
        }
    }

    /// 1 while the device is open, 0 once it has been dropped.
    #[must_use]
    pub fn live_channels(&self) -> usize {
        self.shared.accounting.channels.load(Ordering::Acquire)
    }

    /// Number of notification handles created and not yet closed.
    #[must_use]
    pub fn live_events(&self) -> usize {
        self.shared.accounting.events.load(Ordering::Acquire)
    }

    /// Number of regions mapped and not yet unmapped.
    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.shared.accounting.regions.load(Ordering::Acquire)
    }

    /// Number of slots bound to a live notification handle.
    #[must_use]
    pub fn registered(&self) -> usize {
        lock(&self.shared.slots)
            .iter()
            .filter(|rec| rec.event.strong_count() > 0)
            .count()
    }
}
