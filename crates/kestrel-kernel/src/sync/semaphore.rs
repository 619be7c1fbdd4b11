use super::allocate_named;
use crate::error::KernelError;
use crate::memory::{HeapBlock, KString};
use crate::spl::{splhigh, SplCell, SplGuard};
use crate::thread::SchedContext;
use crate::types::WaitChannel;
use log::{debug, trace, warn};
use std::sync::Arc;

struct SemState {
    count: u32,
    destroyed: bool,
}

struct SemInner {
    name: KString,
    chan: WaitChannel,
    state: SplCell<SemState>,
    _storage: HeapBlock,
}

impl Drop for SemInner {
    fn drop(&mut self) {
        if !self.state.get_mut().destroyed && !std::thread::panicking() {
            warn!(
                "semaphore {} dropped without sem_destroy; {} is never retired",
                self.name, self.chan
            );
        }
    }
}

/// Counting semaphore.
///
/// `down` ("P") waits for the count to become positive and decrements it;
/// `up` ("V") increments it. The count is never negative.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemInner>,
}

impl Semaphore {
    pub fn create<C: SchedContext + ?Sized>(
        ctx: &C,
        name: &str,
        initial_count: u32,
    ) -> Result<Self, KernelError> {
        let (storage, name) = allocate_named::<C, SemInner>(ctx, name)?;
        let chan = ctx.create_channel();
        debug!("sem_create: {} count={} on {}", name, initial_count, chan);

        Ok(Self {
            inner: Arc::new(SemInner {
                name,
                chan,
                state: SplCell::new(SemState {
                    count: initial_count,
                    destroyed: false,
                }),
                _storage: storage,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn live_count<C: SchedContext + ?Sized>(&self, spl: &SplGuard<'_, C>, op: &str) -> u32 {
        let state = self.inner.state.borrow(spl);
        assert!(
            !state.destroyed,
            "{}: semaphore {} has been destroyed",
            op, self.inner.name
        );
        state.count
    }

    /// Current count. Diagnostic only: it may be stale as soon as the
    /// caller sleeps or yields.
    pub fn count<C: SchedContext + ?Sized>(&self, ctx: &C) -> u32 {
        let spl = splhigh(ctx);
        self.live_count(&spl, "sem_count")
    }

    /// Tear the semaphore down.
    ///
    /// # Panics
    ///
    /// If any thread is asleep on it.
    pub fn destroy<C: SchedContext + ?Sized>(self, ctx: &C) {
        let spl = splhigh(ctx);
        self.live_count(&spl, "sem_destroy");
        assert!(
            !ctx.has_sleepers(self.inner.chan),
            "sem_destroy: threads still asleep on semaphore {}",
            self.inner.name
        );
        self.inner.state.borrow(&spl).destroyed = true;
        ctx.retire_channel(self.inner.chan);
        drop(spl);
        debug!("sem_destroy: {}", self.inner.name);
    }

    /// P: wait until the count is positive, then take one unit.
    ///
    /// # Panics
    ///
    /// In interrupt context, even when the count is already positive.
    pub fn down<C: SchedContext + ?Sized>(&self, ctx: &C) {
        assert!(
            !ctx.in_interrupt(),
            "sem P: semaphore {} used in interrupt context",
            self.inner.name
        );

        let spl = splhigh(ctx);
        // Wakeups go to every sleeper, so whoever runs first may already have
        // taken the unit this thread was woken for.
        while self.live_count(&spl, "sem P") == 0 {
            trace!("sem P: {} waits on {}", self.inner.name, self.inner.chan);
            ctx.sleep(self.inner.chan);
        }

        let mut state = self.inner.state.borrow(&spl);
        assert!(state.count > 0);
        state.count -= 1;
    }

    /// V: give back one unit and wake every sleeper.
    pub fn up<C: SchedContext + ?Sized>(&self, ctx: &C) {
        let spl = splhigh(ctx);
        {
            let mut state = self.inner.state.borrow(&spl);
            assert!(
                !state.destroyed,
                "sem V: semaphore {} has been destroyed",
                self.inner.name
            );
            state.count = match state.count.checked_add(1) {
                Some(count) => count,
                None => panic!("sem V: count overflow on semaphore {}", self.inner.name),
            };
        }
        ctx.wakeup_all(self.inner.chan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kernel, KernelConfig};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn down_and_up_adjust_the_count() {
        init_logger();
        let kernel = Kernel::boot(KernelConfig::default());
        let counts = kernel
            .run(|ctx| {
                let sem = Semaphore::create(ctx, "count", 2).unwrap();
                sem.down(ctx);
                sem.down(ctx);
                let drained = sem.count(ctx);
                sem.up(ctx);
                let after_up = sem.count(ctx);
                sem.destroy(ctx);
                (drained, after_up)
            })
            .unwrap();
        assert_eq!(counts, (0, 1));
        assert_eq!(kernel.heap().in_use(), 0);
    }

    #[test]
    fn name_allocation_failure_releases_the_object() {
        init_logger();
        let kernel = Kernel::boot(KernelConfig::default());
        let heap = kernel.heap().clone();
        heap.fail_after(1);
        let created = kernel
            .run(|ctx| Semaphore::create(ctx, "doomed", 0).is_ok())
            .unwrap();
        assert!(!created);
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "has been destroyed")]
    fn up_through_a_surviving_handle_is_fatal() {
        let kernel = Kernel::boot(KernelConfig::default());
        let _ = kernel.run(|ctx| {
            let sem = Semaphore::create(ctx, "gone", 0).unwrap();
            let other = sem.clone();
            sem.destroy(ctx);
            other.up(ctx);
        });
    }
}
