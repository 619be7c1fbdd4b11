use super::allocate_named;
use super::Lock;
use crate::error::KernelError;
use crate::memory::{HeapBlock, KString};
use crate::spl::{splhigh, SplCell, SplGuard};
use crate::thread::SchedContext;
use crate::types::WaitChannel;
use log::{debug, trace, warn};
use std::sync::Arc;

struct CvInner {
    name: KString,
    chan: WaitChannel,
    destroyed: SplCell<bool>,
    _storage: HeapBlock,
}

impl Drop for CvInner {
    fn drop(&mut self) {
        if !*self.destroyed.get_mut() && !std::thread::panicking() {
            warn!(
                "cv {} dropped without cv_destroy; {} is never retired",
                self.name, self.chan
            );
        }
    }
}

/// Mesa-style condition variable.
///
/// `signal` and `broadcast` only wake waiters; the caller keeps the lock. A
/// woken waiter competes for the lock like any other thread, so it must
/// re-check its condition when `wait` returns.
#[derive(Clone)]
pub struct Cv {
    inner: Arc<CvInner>,
}

impl Cv {
    pub fn create<C: SchedContext + ?Sized>(ctx: &C, name: &str) -> Result<Self, KernelError> {
        let (storage, name) = allocate_named::<C, CvInner>(ctx, name)?;
        let chan = ctx.create_channel();
        debug!("cv_create: {} on {}", name, chan);

        Ok(Self {
            inner: Arc::new(CvInner {
                name,
                chan,
                destroyed: SplCell::new(false),
                _storage: storage,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn assert_live<C: SchedContext + ?Sized>(&self, spl: &SplGuard<'_, C>, op: &str) {
        assert!(
            !*self.inner.destroyed.borrow(spl),
            "{}: cv {} has been destroyed",
            op,
            self.inner.name
        );
    }

    fn assert_holds<C: SchedContext + ?Sized>(&self, ctx: &C, lock: &Lock, op: &str) {
        assert!(
            lock.is_held_by_caller(ctx),
            "{}: {} does not hold lock {} (cv {})",
            op,
            ctx.current_thread(),
            lock.name(),
            self.inner.name
        );
    }

    /// # Panics
    ///
    /// If any thread is still waiting on the cv.
    pub fn destroy<C: SchedContext + ?Sized>(self, ctx: &C) {
        let spl = splhigh(ctx);
        self.assert_live(&spl, "cv_destroy");
        assert!(
            !ctx.has_sleepers(self.inner.chan),
            "cv_destroy: threads still waiting on cv {}",
            self.inner.name
        );
        *self.inner.destroyed.borrow(&spl) = true;
        ctx.retire_channel(self.inner.chan);
        drop(spl);
        debug!("cv_destroy: {}", self.inner.name);
    }

    /// Release `lock`, sleep until signalled, and take `lock` back.
    ///
    /// Releasing the lock and going to sleep happen with interrupts deferred,
    /// so a signal sent by the next lock holder always finds this thread on
    /// the channel. Returns with `lock` held.
    ///
    /// # Panics
    ///
    /// In interrupt context, or if the caller does not hold `lock`.
    pub fn wait<C: SchedContext + ?Sized>(&self, ctx: &C, lock: &Lock) {
        assert!(
            !ctx.in_interrupt(),
            "cv_wait: cv {} used in interrupt context",
            self.inner.name
        );
        self.assert_holds(ctx, lock, "cv_wait");

        let spl = splhigh(ctx);
        self.assert_live(&spl, "cv_wait");
        lock.release(ctx);
        trace!(
            "cv_wait: {} waits on {}",
            ctx.current_thread(),
            self.inner.name
        );
        ctx.sleep(self.inner.chan);
        drop(spl);

        lock.acquire(ctx);
    }

    /// Wake the longest waiter, if any. The caller keeps `lock`.
    ///
    /// # Panics
    ///
    /// If the caller does not hold `lock`.
    pub fn signal<C: SchedContext + ?Sized>(&self, ctx: &C, lock: &Lock) {
        self.assert_holds(ctx, lock, "cv_signal");
        let spl = splhigh(ctx);
        self.assert_live(&spl, "cv_signal");
        ctx.wakeup_one(self.inner.chan);
    }

    /// Wake every waiter. The caller keeps `lock`.
    ///
    /// # Panics
    ///
    /// If the caller does not hold `lock`.
    pub fn broadcast<C: SchedContext + ?Sized>(&self, ctx: &C, lock: &Lock) {
        self.assert_holds(ctx, lock, "cv_broadcast");
        let spl = splhigh(ctx);
        self.assert_live(&spl, "cv_broadcast");
        ctx.wakeup_all(self.inner.chan);
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
    fn signal_without_waiters_is_a_no_op() {
        let kernel = kernel();
        kernel
            .run(|ctx| {
                let lock = Lock::create(ctx, "l").unwrap();
                let cv = Cv::create(ctx, "cv").unwrap();
                lock.acquire(ctx);
                cv.signal(ctx, &lock);
                cv.broadcast(ctx, &lock);
                assert!(lock.is_held_by_caller(ctx));
                lock.release(ctx);
                cv.destroy(ctx);
                lock.destroy(ctx);
            })
            .unwrap();
        assert_eq!(kernel.heap().in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "does not hold lock")]
    fn wait_without_the_lock_is_fatal() {
        let _ = kernel().run(|ctx| {
            let lock = Lock::create(ctx, "l").unwrap();
            let cv = Cv::create(ctx, "cv").unwrap();
            cv.wait(ctx, &lock);
        });
    }

    #[test]
    #[should_panic(expected = "cv_signal")]
    fn signal_while_another_thread_holds_the_lock_is_fatal() {
        let _ = kernel().run(|ctx| {
            let lock = Lock::create(ctx, "l").unwrap();
            let cv = Cv::create(ctx, "cv").unwrap();
            let holder = lock.clone();
            ctx.thread_fork("holder", move |ctx| {
                holder.acquire(ctx);
                ctx.thread_yield();
                holder.release(ctx);
            })
            .unwrap();
            ctx.thread_yield();
            cv.signal(ctx, &lock);
        });
    }
}
