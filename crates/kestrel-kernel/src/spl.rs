//! Interrupt priority levels.
//!
//! On a single CPU the only way another thread of control can interleave with
//! a read-modify-write is an interrupt. Raising the level to [`Ipl::High`]
//! defers interrupts, which turns a short sequence into one atomic step.
//! [`SplGuard`] restores the previous level when dropped, including while
//! unwinding from a failed assertion.

use crate::thread::SchedContext;
use core::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, TryLockError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Ipl {
    /// Interrupts are delivered.
    #[default]
    Low,
    /// Interrupts are deferred until the level drops back to `Low`.
    High,
}

/// Raised interrupt level, restored on drop. Guards nest.
pub struct SplGuard<'a, C: SchedContext + ?Sized> {
    ctx: &'a C,
    previous: Ipl,
}

/// Raise the interrupt level to `High` for the lifetime of the returned guard.
pub fn splhigh<C: SchedContext + ?Sized>(ctx: &C) -> SplGuard<'_, C> {
    let previous = ctx.raise_ipl();
    SplGuard { ctx, previous }
}

impl<'a, C: SchedContext + ?Sized> SplGuard<'a, C> {
    /// Level that will be restored when this guard drops.
    pub fn previous(&self) -> Ipl {
        self.previous
    }
}

impl<'a, C: SchedContext + ?Sized> Drop for SplGuard<'a, C> {
    fn drop(&mut self) {
        self.ctx.restore_ipl(self.previous);
    }
}

/// State that may only be touched with the interrupt level raised.
///
/// Borrowing requires a live [`SplGuard`]. A second borrow while the first is
/// still alive means two kernel paths are interleaving on the same state and
/// is treated as a fatal error.
pub struct SplCell<T> {
    value: Mutex<T>,
}

impl<T> SplCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    pub fn borrow<'a, C: SchedContext + ?Sized>(
        &'a self,
        _spl: &'a SplGuard<'_, C>,
    ) -> SplRef<'a, T> {
        let guard = match self.value.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                panic!("SplCell: overlapping access to interrupt-protected state")
            }
        };
        SplRef { guard }
    }

    /// Exclusive access needs no guard: nothing else can reach the cell.
    pub fn get_mut(&mut self) -> &mut T {
        self.value
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn into_inner(self) -> T {
        self.value
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct SplRef<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<'a, T> Deref for SplRef<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for SplRef<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
