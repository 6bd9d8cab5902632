//! Buffer-ready handler and its single-slot registry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::state::ReceiverState;

/// Receives each filled region, on the receiver thread.
///
/// `buffer` is exactly the filled part of the slot; its length is the filled
/// size reported by the device. The slice is only valid for the duration of
/// the call. The handler runs synchronously: while it runs no further slot is
/// received, so keep it short.
///
/// The return value is an acknowledgement code; the receiver logs it and
/// otherwise ignores it.
///
/// Closures implement this trait:
///
/// ```
/// use std::sync::Arc;
/// use sdb::BufferReady;
///
/// let handler: Arc<dyn BufferReady> = Arc::new(|buf: &[u8]| buf.len() as u32);
/// assert_eq!(handler.on_buffer_ready(&[1, 2, 3]), 3);
/// ```
pub trait BufferReady: Send + Sync {
    /// Called once per non-empty cycle with the filled bytes.
    fn on_buffer_ready(&self, buffer: &[u8]) -> u32;
}

impl<F> BufferReady for F
where
    F: Fn(&[u8]) -> u32 + Send + Sync,
{
    fn on_buffer_ready(&self, buffer: &[u8]) -> u32 {
        self(buffer)
    }
}

/// Precondition failures of handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A handler is already registered.
    #[error("a buffer-ready handler is already registered")]
    AlreadyRegistered,
    /// The handler is not the one currently registered.
    #[error("handler is not the registered buffer-ready handler")]
    NotRegistered,
    /// The handler cannot change while sampling.
    #[error("cannot unregister the buffer-ready handler while sampling")]
    BusyWhileSampling,
}

/// Holds at most one handler.
///
/// The receiver thread takes a clone of the `Arc` per cycle, so an
/// unregistered handler stays alive until any in-flight call returns.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    slot: Mutex<Option<Arc<dyn BufferReady>>>,
}

impl CallbackRegistry {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn BufferReady>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, handler: Arc<dyn BufferReady>) -> Result<(), RegistryError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(RegistryError::AlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    pub(crate) fn unregister(
        &self,
        handler: &Arc<dyn BufferReady>,
        state: ReceiverState,
    ) -> Result<(), RegistryError> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(current) if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(handler)) => {}
            _ => return Err(RegistryError::NotRegistered),
        }
        if state == ReceiverState::Sampling {
            return Err(RegistryError::BusyWhileSampling);
        }
        *slot = None;
        Ok(())
    }

    pub(crate) fn current(&self) -> Option<Arc<dyn BufferReady>> {
        self.slot().clone()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.slot().is_some()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("registered", &self.is_registered())
            .finish()
    }
}
