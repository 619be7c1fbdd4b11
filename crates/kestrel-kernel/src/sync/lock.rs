use super::allocate_named;
use crate::error::KernelError;
use crate::memory::{HeapBlock, KString};
use crate::spl::{splhigh, SplCell, SplGuard, SplRef};
use crate::thread::SchedContext;
use crate::types::{ThreadHandle, WaitChannel};
use log::{debug, trace, warn};
use std::sync::Arc;

struct LockState {
    // Held exactly when a holder is recorded.
    holder: Option<ThreadHandle>,
    destroyed: bool,
}

struct LockInner {
    name: KString,
    chan: WaitChannel,
    state: SplCell<LockState>,
    _storage: HeapBlock,
}

impl Drop for LockInner {
    fn drop(&mut self) {
        if !self.state.get_mut().destroyed && !std::thread::panicking() {
            warn!(
                "lock {} dropped without lock_destroy; {} is never retired",
                self.name, self.chan
            );
        }
    }
}

/// Sleeping mutual-exclusion lock with an owner.
///
/// Only the thread that acquired the lock may release it, and a thread may
/// not acquire a lock it already holds. Both rules are enforced with panics.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub fn create<C: SchedContext + ?Sized>(ctx: &C, name: &str) -> Result<Self, KernelError> {
        let (storage, name) = allocate_named::<C, LockInner>(ctx, name)?;
        let chan = ctx.create_channel();
        debug!("lock_create: {} on {}", name, chan);

        Ok(Self {
            inner: Arc::new(LockInner {
                name,
                chan,
                state: SplCell::new(LockState {
                    holder: None,
                    destroyed: false,
                }),
                _storage: storage,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn live_state<'a, C: SchedContext + ?Sized>(
        &'a self,
        spl: &'a SplGuard<'_, C>,
        op: &str,
    ) -> SplRef<'a, LockState> {
        let state = self.inner.state.borrow(spl);
        assert!(
            !state.destroyed,
            "{}: lock {} has been destroyed",
            op, self.inner.name
        );
        state
    }

    /// Thread currently holding the lock. Diagnostic only.
    pub fn holder<C: SchedContext + ?Sized>(&self, ctx: &C) -> Option<ThreadHandle> {
        let spl = splhigh(ctx);
        let holder = self.live_state(&spl, "lock_holder").holder;
        holder
    }

    /// Whether the calling thread holds the lock.
    pub fn is_held_by_caller<C: SchedContext + ?Sized>(&self, ctx: &C) -> bool {
        self.holder(ctx) == Some(ctx.current_thread())
    }

    /// Tear the lock down.
    ///
    /// A lock that is still held is released without waking anyone; this is
    /// tolerated but logged.
    ///
    /// # Panics
    ///
    /// If any thread is asleep waiting for the lock.
    pub fn destroy<C: SchedContext + ?Sized>(self, ctx: &C) {
        let spl = splhigh(ctx);
        let previous_holder = {
            let mut state = self.live_state(&spl, "lock_destroy");
            assert!(
                !ctx.has_sleepers(self.inner.chan),
                "lock_destroy: threads still asleep on lock {}",
                self.inner.name
            );
            state.destroyed = true;
            state.holder.take()
        };
        ctx.retire_channel(self.inner.chan);
        drop(spl);

        if let Some(holder) = previous_holder {
            warn!(
                "lock_destroy: lock {} destroyed while held by {}",
                self.inner.name, holder
            );
        }
        debug!("lock_destroy: {}", self.inner.name);
    }

    /// Wait until the lock is free, then take it.
    ///
    /// # Panics
    ///
    /// In interrupt context, or if the caller already holds the lock.
    pub fn acquire<C: SchedContext + ?Sized>(&self, ctx: &C) {
        assert!(
            !ctx.in_interrupt(),
            "lock_acquire: lock {} used in interrupt context",
            self.inner.name
        );
        let me = ctx.current_thread();

        let spl = splhigh(ctx);
        loop {
            {
                let mut state = self.live_state(&spl, "lock_acquire");
                let holder = state.holder;
                match holder {
                    None => {
                        state.holder = Some(me);
                        break;
                    }
                    Some(holder) if holder == me => panic!(
                        "lock_acquire: {} already holds lock {}",
                        me, self.inner.name
                    ),
                    Some(holder) => {
                        trace!(
                            "lock_acquire: {} waits for {} held by {}",
                            me,
                            self.inner.name,
                            holder
                        );
                    }
                }
            }
            // Another thread may grab the lock between our wakeup and our
            // turn on the CPU; the loop re-checks.
            ctx.sleep(self.inner.chan);
        }
    }

    /// Give the lock up and wake every thread waiting for it.
    ///
    /// # Panics
    ///
    /// If the lock is not held, or is held by another thread.
    pub fn release<C: SchedContext + ?Sized>(&self, ctx: &C) {
        let me = ctx.current_thread();
        let spl = splhigh(ctx);
        self.release_locked(&spl, me);
        ctx.wakeup_all(self.inner.chan);
    }

    fn release_locked<C: SchedContext + ?Sized>(&self, spl: &SplGuard<'_, C>, me: ThreadHandle) {
        let mut state = self.live_state(spl, "lock_release");
        let holder = state.holder;
        match holder {
            Some(holder) if holder == me => state.holder = None,
            Some(holder) => panic!(
                "lock_release: {} releasing lock {} held by {}",
                me, self.inner.name, holder
            ),
            None => panic!(
                "lock_release: {} releasing lock {} which is not held",
                me, self.inner.name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kernel, KernelConfig};

    fn kernel() -> Kernel {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::boot(KernelConfig::default())
    }

    #[test]
    fn holder_tracks_acquire_and_release() {
        let kernel = kernel();
        let observed = kernel
            .run(|ctx| {
                let lock = Lock::create(ctx, "l").unwrap();
                let before = lock.is_held_by_caller(ctx);
                lock.acquire(ctx);
                let during = (lock.is_held_by_caller(ctx), lock.holder(ctx));
                lock.release(ctx);
                let after = lock.is_held_by_caller(ctx);
                lock.destroy(ctx);
                (before, during, after, ctx.current_thread())
            })
            .unwrap();
        let (before, during, after, me) = observed;
        assert!(!before);
        assert_eq!(during, (true, Some(me)));
        assert!(!after);
    }

    #[test]
    fn destroying_a_held_lock_is_tolerated() {
        let kernel = kernel();
        kernel
            .run(|ctx| {
                let lock = Lock::create(ctx, "held").unwrap();
                lock.acquire(ctx);
                lock.destroy(ctx);
            })
            .unwrap();
        assert_eq!(kernel.heap().in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "already holds lock")]
    fn recursive_acquire_is_fatal() {
        let _ = kernel().run(|ctx| {
            let lock = Lock::create(ctx, "twice").unwrap();
            lock.acquire(ctx);
            lock.acquire(ctx);
        });
    }

    #[test]
    #[should_panic(expected = "which is not held")]
    fn releasing_an_unheld_lock_is_fatal() {
        let _ = kernel().run(|ctx| {
            let lock = Lock::create(ctx, "free").unwrap();
            lock.release(ctx);
        });
    }

    #[test]
    #[should_panic(expected = "held by")]
    fn releasing_a_lock_held_by_another_thread_is_fatal() {
        let _ = kernel().run(|ctx| {
            let lock = Lock::create(ctx, "theirs").unwrap();
            let holder = lock.clone();
            ctx.thread_fork("holder", move |ctx| {
                holder.acquire(ctx);
                ctx.thread_yield();
                holder.release(ctx);
            })
            .unwrap();
            ctx.thread_yield();
            assert!(!lock.is_held_by_caller(ctx));
            lock.release(ctx);
        });
    }

    #[test]
    #[should_panic(expected = "used in interrupt context")]
    fn acquire_from_an_interrupt_handler_is_fatal() {
        let _ = kernel().run(|ctx| {
            let lock = Lock::create(ctx, "irq").unwrap();
            ctx.interrupt(move |ctx| lock.acquire(ctx));
        });
    }
}
