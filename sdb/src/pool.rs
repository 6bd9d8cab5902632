//! Buffer pool: the set of shared regions and their notification handles.
//!
//! # Lifecycle
//!
//! ```text
//! Pool::create(channel, region_size, count)
//!   for slot in 0..count:
//!     create_event(slot) → register_event(slot) → map_region(slot)
//!   any failure → already-built slots and the channel drop → Err
//!
//! drop(pool)
//!   every region unmapped, every handle closed, then the channel closed
//! ```
//!
//! A pool is all-or-nothing: callers only ever see a pool with exactly
//! `count` fully set-up slots. Teardown is plain `Drop`; field order makes
//! the slots go before the channel that backs them.

use crate::device::{DeviceChannel, DeviceError, RegionMemory, SlotIndex};
use crate::receiver::ReceiverError;
use crate::trace::{debug, info, warn};

/// One pool entry: a mapped region and the handle that announces it is full.
///
/// Fields drop in declaration order, so the region is unmapped before its
/// handle is closed.
pub struct BufferSlot<C: DeviceChannel> {
    index: SlotIndex,
    region: C::Region,
    event: C::Event,
}

impl<C: DeviceChannel> BufferSlot<C> {
    /// Position of this slot in the pool.
    #[must_use]
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// The slot's notification handle.
    #[must_use]
    pub fn event(&self) -> &C::Event {
        &self.event
    }

    /// Size of the mapped region in bytes.
    #[must_use]
    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    /// Runs `f` over the first `len` bytes of the region.
    ///
    /// `len` is clamped to the region size. The slice cannot outlive `f`, so
    /// kernel-shared memory never escapes into caller data structures.
    pub fn with_filled<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let len = len.min(self.region.len());
        // SAFETY: `RegionMemory` guarantees `len()` readable bytes at
        // `as_ptr()` until the region drops, which cannot happen while
        // `&self` is borrowed. The coprocessor does not write a slot between
        // signaling it and the next registration cycle.
        let bytes = unsafe { std::slice::from_raw_parts(self.region.as_ptr(), len) };
        f(bytes)
    }
}

/// A fixed set of equally sized [`BufferSlot`]s bound to one channel.
pub struct Pool<C: DeviceChannel> {
    // Declared before `channel` so every slot is torn down first.
    slots: Vec<BufferSlot<C>>,
    region_size: usize,
    channel: C,
}

impl<C: DeviceChannel> Pool<C> {
    /// Creates `count` slots of `region_size` bytes each over `channel`.
    ///
    /// Slots are set up in index order; for each one the handle is created,
    /// bound to the slot index, and then the region is mapped.
    ///
    /// # Errors
    ///
    /// - [`ReceiverError::InvalidPool`] if `region_size` or `count` is zero
    /// - [`ReceiverError::Device`] for the first device step that fails
    ///
    /// On error nothing stays mapped or open, including `channel`.
    pub fn create(channel: C, region_size: usize, count: u32) -> Result<Self, ReceiverError> {
        if region_size == 0 || count == 0 {
            return Err(ReceiverError::InvalidPool { region_size, count });
        }

        let mut slots = Vec::with_capacity(count as usize);
        for i in 0..count {
            let index = SlotIndex::new(i);
            match Self::create_slot(&channel, index, region_size) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    warn!(
                        slot = %index,
                        built = slots.len(),
                        error = %e,
                        "pool creation failed, unwinding"
                    );
                    // `slots` and `channel` drop here.
                    return Err(e.into());
                }
            }
        }

        info!(count, region_size, "buffer pool created");
        Ok(Self {
            slots,
            region_size,
            channel,
        })
    }

    fn create_slot(
        channel: &C,
        index: SlotIndex,
        region_size: usize,
    ) -> Result<BufferSlot<C>, DeviceError> {
        let event = channel.create_event(index)?;
        channel.register_event(index, &event)?;
        let region = channel.map_region(index, region_size)?;
        debug!(slot = %index, len = region.len(), "slot ready");

        Ok(BufferSlot {
            index,
            region,
            event,
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn count(&self) -> u32 {
        // Built from a u32 count in `create`.
        self.slots.len() as u32
    }

    /// Requested size of every region.
    #[must_use]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// The channel backing this pool.
    #[must_use]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Slot at `index`, if in range.
    #[must_use]
    pub fn slot(&self, index: SlotIndex) -> Option<&BufferSlot<C>> {
        self.slots.get(index.as_usize())
    }

    /// All slots in index order.
    pub fn slots(&self) -> impl Iterator<Item = &BufferSlot<C>> {
        self.slots.iter()
    }
}

impl<C: DeviceChannel> Drop for Pool<C> {
    fn drop(&mut self) {
        debug!(count = self.slots.len(), "destroying buffer pool");
        self.slots.clear();
        info!("buffer pool destroyed");
    }
}

impl<C: DeviceChannel> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("count", &self.slots.len())
            .field("region_size", &self.region_size)
            .finish_non_exhaustive()
    }
}
