//! User-space receiver for rpmsg shared data buffers.
//!
//! A companion coprocessor fills fixed-size regions of kernel-shared memory
//! with compressed samples and raises a per-region eventfd. This crate maps
//! those regions, waits for them in round-robin order on a background thread,
//! and hands each filled region to a registered [`BufferReady`] handler.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sdb::{BufferReady, Receiver, ReceiverConfig};
//!
//! let mut receiver: Receiver = Receiver::new(ReceiverConfig::default());
//! receiver.init_device(4096, 3)?;
//!
//! let handler: Arc<dyn BufferReady> = Arc::new(|buf: &[u8]| buf.len() as u32);
//! receiver.register_callback(Arc::clone(&handler))?;
//!
//! receiver.init_receiver()?;
//! receiver.start();
//! // ... buffers arrive on the receiver thread ...
//! receiver.stop();
//! receiver.deinit_receiver()?;
//! receiver.unregister_callback(&handler)?;
//! # Ok::<(), sdb::ReceiverError>(())
//! ```

// Allow the crate to reference itself as ::sdb for derive macro usage
extern crate self as sdb;

pub mod abi;
pub mod config;
pub mod device;
pub mod pool;
pub mod receiver;
pub mod remoteproc;
pub mod topology;
mod trace;

pub use trace::init_tracing;

#[doc(inline)]
pub use sdb_derive::KernelAbi;

#[doc(inline)]
pub use abi::KernelAbi;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use abi::KernelAbi as __KernelAbiPrivate;

pub use config::{CounterPolicy, ReceiverConfig};
pub use device::{DeviceChannel, DeviceError, Notification, NotifyError, SlotIndex, Wakeup};
pub use receiver::callback::{BufferReady, RegistryError};
pub use receiver::state::ReceiverState;
pub use receiver::stats::Stats;
pub use receiver::{Receiver, ReceiverError};

/// Result alias for receiver operations.
pub type Result<T> = std::result::Result<T, ReceiverError>;
