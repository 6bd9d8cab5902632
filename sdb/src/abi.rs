//! Marker trait for control-command payloads shared with the kernel.
//!
//! Control commands hand a pointer to a small struct to the rpmsg-sdb driver,
//! which copies it in (and for queries, back out) with `copy_from_user` /
//! `copy_to_user`. Only plain `repr(C)` aggregates of fixed-width integers
//! survive that trip with their meaning intact.
//!
//! ```
//! use sdb::KernelAbi;
//!
//! #[derive(Clone, Copy, KernelAbi)]
//! #[repr(C)]
//! struct SetEventFd {
//!     buffer_id: i32,
//!     event_fd: i32,
//! }
//! ```

/// Types whose bytes can be handed to the kernel as an ioctl payload.
///
/// # Safety
///
/// Implementers must guarantee:
///
/// | Property | Requirement |
/// |----------|-------------|
/// | **Layout** | `#[repr(C)]` or `#[repr(transparent)]`, identical to the kernel's struct |
/// | **Contents** | Only fixed-width integers or arrays of them; no pointers, no `bool` |
/// | **Validity** | Every bit pattern is a valid value, since the kernel may write any |
///
/// Use `#[derive(KernelAbi)]` rather than implementing this by hand; the
/// derive checks the first two rows at compile time:
///
/// ```compile_fail
/// # use sdb::KernelAbi;
/// #[derive(Clone, Copy, KernelAbi)]
/// struct MissingRepr {
///     buffer_id: i32,
/// }
/// ```
///
/// ```compile_fail
/// # use sdb::KernelAbi;
/// #[derive(Clone, Copy, KernelAbi)]
/// #[repr(C)]
/// struct CarriesPointer {
///     data: *const u8,
/// }
/// ```
pub unsafe trait KernelAbi: Copy + Send + 'static {}

macro_rules! impl_kernel_abi {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl KernelAbi for $t {}
        )*
    };
}

impl_kernel_abi! {
    i8, i16, i32, i64,
    u8, u16, u32, u64,
}

unsafe impl<T: KernelAbi, const N: usize> KernelAbi for [T; N] {}
