//! Sleeping synchronization primitives.
//!
//! All three primitives follow the same pattern: take the interrupt level
//! high, check a condition, and sleep on the primitive's own wait channel
//! until the condition holds, re-checking after every wakeup. Wakers always
//! mutate state first and wake second, both under the raised level.
//!
//! Each type is a handle: clones refer to the same kernel object, the way
//! several threads would share a pointer to it. `destroy` tears the object
//! down; any later operation through a surviving handle is a fatal error.
//!
//! Protocol violations (blocking in an interrupt handler, recursive
//! acquisition, releasing a lock held by someone else, ...) panic.

pub mod cv;
pub mod lock;
pub mod semaphore;

pub use cv::Cv;
pub use lock::Lock;
pub use semaphore::Semaphore;

use crate::error::KernelError;
use crate::memory::{HeapBlock, KString};
use crate::thread::SchedContext;

/// Heap storage for a primitive: the object itself, then its name.
///
/// If the name cannot be allocated the object allocation is released before
/// the error is returned.
pub(crate) fn allocate_named<C, T>(ctx: &C, name: &str) -> Result<(HeapBlock, KString), KernelError>
where
    C: SchedContext + ?Sized,
{
    let storage = ctx.heap().kmalloc(core::mem::size_of::<T>())?;
    let name = ctx.heap().kstrdup(name)?;
    Ok((storage, name))
}
