//! In-kernel synchronization self-tests.
//!
//! Each test forks worker threads that hammer one primitive and checks the
//! invariants the primitive is supposed to protect. Workers yield inside their
//! critical sections so a broken primitive actually gets interleaved.

use crate::cpu::Context;
use crate::error::KernelError;
use crate::sync::{Cv, Lock, Semaphore};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const BUFFER_SLOTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchParams {
    pub threads: usize,
    pub iterations: usize,
}

impl Default for SynchParams {
    fn default() -> Self {
        Self {
            threads: 8,
            iterations: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchReport {
    pub test: &'static str,
    pub threads: usize,
    pub operations: u64,
}

fn check(test: &'static str, ok: bool, reason: impl FnOnce() -> String) -> Result<(), KernelError> {
    if ok {
        Ok(())
    } else {
        Err(KernelError::TestFailed {
            test,
            reason: reason(),
        })
    }
}

/// Wait for `count` workers that each `up` the `done` semaphore on exit.
fn join_workers(ctx: &Context, done: &Semaphore, count: usize) {
    for _ in 0..count {
        done.down(ctx);
    }
}

/// Fail up front if the thread table cannot hold `wanted` more threads.
///
/// A test that ran out of threads halfway would leave its workers waiting
/// on partners that were never forked.
fn reserve_threads(ctx: &Context, test: &'static str, wanted: usize) -> Result<(), KernelError> {
    let available = ctx.threads_available();
    if wanted > available {
        warn!(
            "{} test needs {} threads, {} available",
            test, wanted, available
        );
        return Err(KernelError::ThreadLimit(ctx.max_threads()));
    }
    Ok(())
}

/// Primitives a test created, destroyed together once the test is over.
#[derive(Default)]
struct Teardown {
    sems: Vec<Semaphore>,
    locks: Vec<Lock>,
    cvs: Vec<Cv>,
}

impl Teardown {
    fn semaphore(&mut self, ctx: &Context, name: &str, count: u32) -> Result<Semaphore, KernelError> {
        let sem = Semaphore::create(ctx, name, count)?;
        self.sems.push(sem.clone());
        Ok(sem)
    }

    fn lock(&mut self, ctx: &Context, name: &str) -> Result<Lock, KernelError> {
        let lock = Lock::create(ctx, name)?;
        self.locks.push(lock.clone());
        Ok(lock)
    }

    fn cv(&mut self, ctx: &Context, name: &str) -> Result<Cv, KernelError> {
        let cv = Cv::create(ctx, name)?;
        self.cvs.push(cv.clone());
        Ok(cv)
    }

    fn destroy_all(self, ctx: &Context) {
        for cv in self.cvs {
            cv.destroy(ctx);
        }
        for lock in self.locks {
            lock.destroy(ctx);
        }
        for sem in self.sems {
            sem.destroy(ctx);
        }
    }
}

/// Run `test` and destroy everything it created, whether it passed, failed a
/// check or could not create all of its primitives.
fn with_teardown<F>(ctx: &Context, test: F) -> Result<SynchReport, KernelError>
where
    F: FnOnce(&mut Teardown) -> Result<SynchReport, KernelError>,
{
    let mut created = Teardown::default();
    let result = test(&mut created);
    created.destroy_all(ctx);
    result
}

/// Semaphores as a gate (count 2) and as a mutex (count 1).
pub fn semaphore_test(ctx: &Context, params: SynchParams) -> Result<SynchReport, KernelError> {
    const TEST: &str = "semaphore";
    info!("Starting semaphore test: {:?}", params);
    reserve_threads(ctx, TEST, params.threads)?;

    with_teardown(ctx, |created| {
        let gate = created.semaphore(ctx, "sem-gate", 2)?;
        let mutex = created.semaphore(ctx, "sem-mutex", 1)?;
        let done = created.semaphore(ctx, "sem-done", 0)?;
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicU64::new(0));

        for n in 0..params.threads {
            let (w_gate, w_mutex, w_done) = (gate.clone(), mutex.clone(), done.clone());
            let (inside, violations, total) =
                (Arc::clone(&inside), Arc::clone(&violations), Arc::clone(&total));
            let forked = ctx.thread_fork(&format!("semtest-{}", n), move |ctx| {
                for _ in 0..params.iterations {
                    w_gate.down(ctx);
                    w_mutex.down(ctx);
                    if inside.fetch_add(1, Ordering::Relaxed) != 0 {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    ctx.thread_yield();
                    inside.fetch_sub(1, Ordering::Relaxed);
                    total.fetch_add(1, Ordering::Relaxed);
                    w_mutex.up(ctx);
                    w_gate.up(ctx);
                }
                w_done.up(ctx);
            });
            if let Err(e) = forked {
                join_workers(ctx, &done, n);
                return Err(e);
            }
        }
        join_workers(ctx, &done, params.threads);

        let expected = (params.threads * params.iterations) as u64;
        let operations = total.load(Ordering::Relaxed);
        let counts = (gate.count(ctx), mutex.count(ctx));
        check(TEST, violations.load(Ordering::Relaxed) == 0, || {
            format!("{} threads inside the mutex at once", violations.load(Ordering::Relaxed))
        })?;
        check(TEST, operations == expected, || {
            format!("{} of {} critical sections ran", operations, expected)
        })?;
        check(TEST, counts == (2, 1), || {
            format!("counts not restored: gate={} mutex={}", counts.0, counts.1)
        })?;

        info!("Semaphore test done");
        Ok(SynchReport {
            test: TEST,
            threads: params.threads,
            operations,
        })
    })
}

/// Lock-protected read-modify-write of three related values.
pub fn lock_test(ctx: &Context, params: SynchParams) -> Result<SynchReport, KernelError> {
    const TEST: &str = "lock";
    info!("Starting lock test: {:?}", params);
    reserve_threads(ctx, TEST, params.threads)?;

    with_teardown(ctx, |created| {
        let lock = created.lock(ctx, "testlock")?;
        let done = created.semaphore(ctx, "lock-done", 0)?;
        // value, value squared, value mod 3
        let vals = Arc::new([AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)]);
        let violations = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicU64::new(0));

        for n in 0..params.threads {
            let (w_lock, w_done) = (lock.clone(), done.clone());
            let (vals, violations, total) =
                (Arc::clone(&vals), Arc::clone(&violations), Arc::clone(&total));
            let forked = ctx.thread_fork(&format!("locktest-{}", n), move |ctx| {
                for i in 0..params.iterations {
                    let v = (n * params.iterations + i) as u64;
                    w_lock.acquire(ctx);
                    vals[0].store(v, Ordering::Relaxed);
                    ctx.thread_yield();
                    vals[1].store(v * v, Ordering::Relaxed);
                    ctx.thread_yield();
                    vals[2].store(v % 3, Ordering::Relaxed);

                    let seen = vals[0].load(Ordering::Relaxed);
                    if seen != v
                        || vals[1].load(Ordering::Relaxed) != seen * seen
                        || vals[2].load(Ordering::Relaxed) != seen % 3
                    {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    if !w_lock.is_held_by_caller(ctx) {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                    total.fetch_add(1, Ordering::Relaxed);
                    w_lock.release(ctx);
                }
                w_done.up(ctx);
            });
            if let Err(e) = forked {
                join_workers(ctx, &done, n);
                return Err(e);
            }
        }
        join_workers(ctx, &done, params.threads);

        let expected = (params.threads * params.iterations) as u64;
        let operations = total.load(Ordering::Relaxed);
        check(TEST, violations.load(Ordering::Relaxed) == 0, || {
            format!(
                "{} critical sections saw foreign writes",
                violations.load(Ordering::Relaxed)
            )
        })?;
        check(TEST, operations == expected, || {
            format!("{} of {} critical sections ran", operations, expected)
        })?;
        check(TEST, lock.holder(ctx).is_none(), || "lock left held".into())?;

        info!("Lock test done");
        Ok(SynchReport {
            test: TEST,
            threads: params.threads,
            operations,
        })
    })
}

struct BoundedBuffer {
    items: VecDeque<(usize, usize)>,
    consumed: Vec<(usize, usize)>,
}

fn with_buffer<R>(buffer: &Mutex<BoundedBuffer>, f: impl FnOnce(&mut BoundedBuffer) -> R) -> R {
    f(&mut buffer.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Producers and consumers over a bounded buffer, one lock and two cvs.
pub fn cv_test(ctx: &Context, params: SynchParams) -> Result<SynchReport, KernelError> {
    const TEST: &str = "cv";
    info!("Starting cv test: {:?}", params);

    let producers = (params.threads / 2).max(1);
    let consumers = params.threads.saturating_sub(producers).max(1);
    let total = producers * params.iterations;
    // Producers block on a full buffer until consumers exist, so every
    // thread must fit before the first one is forked.
    reserve_threads(ctx, TEST, producers + consumers)?;

    with_teardown(ctx, |created| {
        let lock = created.lock(ctx, "buffer-lock")?;
        let not_full = created.cv(ctx, "not-full")?;
        let not_empty = created.cv(ctx, "not-empty")?;
        let done = created.semaphore(ctx, "cv-done", 0)?;
        // Only touched while `lock` is held; the host mutex is never held
        // across a sleep or a yield.
        let buffer = Arc::new(Mutex::new(BoundedBuffer {
            items: VecDeque::with_capacity(BUFFER_SLOTS),
            consumed: Vec::with_capacity(total),
        }));

        for p in 0..producers {
            let (lock, not_full, not_empty, done) =
                (lock.clone(), not_full.clone(), not_empty.clone(), done.clone());
            let buffer = Arc::clone(&buffer);
            ctx.thread_fork(&format!("producer-{}", p), move |ctx| {
                for seq in 0..params.iterations {
                    lock.acquire(ctx);
                    while with_buffer(&buffer, |b| b.items.len() >= BUFFER_SLOTS) {
                        not_full.wait(ctx, &lock);
                    }
                    with_buffer(&buffer, |b| b.items.push_back((p, seq)));
                    not_empty.signal(ctx, &lock);
                    lock.release(ctx);
                    if seq % 3 == 0 {
                        ctx.thread_yield();
                    }
                }
                done.up(ctx);
            })?;
        }

        for c in 0..consumers {
            let (lock, not_full, not_empty, done) =
                (lock.clone(), not_full.clone(), not_empty.clone(), done.clone());
            let buffer = Arc::clone(&buffer);
            ctx.thread_fork(&format!("consumer-{}", c), move |ctx| {
                lock.acquire(ctx);
                loop {
                    let (item, finished) = with_buffer(&buffer, |b| {
                        let item = b.items.pop_front();
                        if let Some(item) = item {
                            b.consumed.push(item);
                        }
                        (item, b.consumed.len() >= total)
                    });
                    if finished {
                        break;
                    }
                    match item {
                        Some(_) => not_full.signal(ctx, &lock),
                        None => not_empty.wait(ctx, &lock),
                    }
                }
                // Whoever sees the end lets the other consumers out.
                not_empty.broadcast(ctx, &lock);
                lock.release(ctx);
                done.up(ctx);
            })?;
        }
        join_workers(ctx, &done, producers + consumers);

        let consumed = with_buffer(&buffer, |b| std::mem::take(&mut b.consumed));
        debug!("cv test consumed {} items", consumed.len());

        check(TEST, consumed.len() == total, || {
            format!("{} of {} items consumed", consumed.len(), total)
        })?;
        let mut next_seq = vec![0; producers];
        for &(p, seq) in &consumed {
            check(TEST, next_seq[p] == seq, || {
                format!("producer {} item {} consumed out of order", p, seq)
            })?;
            next_seq[p] += 1;
        }

        info!("CV test done");
        Ok(SynchReport {
            test: TEST,
            threads: producers + consumers,
            operations: total as u64,
        })
    })
}

pub fn run_all(ctx: &Context, params: SynchParams) -> Result<Vec<SynchReport>, KernelError> {
    Ok(vec![
        semaphore_test(ctx, params)?,
        lock_test(ctx, params)?,
        cv_test(ctx, params)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::scheduler::SchedPolicy;
    use crate::thread::SchedContext;
    use crate::{Kernel, KernelConfig};

    fn run(policy: SchedPolicy, params: SynchParams) -> Vec<SynchReport> {
        let _ = env_logger::builder().is_test(true).try_init();
        let kernel = Kernel::boot(KernelConfig {
            scheduler: policy,
            ..KernelConfig::default()
        });
        let reports = kernel
            .run(move |ctx| run_all(ctx, params))
            .unwrap()
            .unwrap();
        assert_eq!(kernel.heap().in_use(), 0);
        reports
    }

    #[test]
    fn all_tests_pass_under_every_policy() {
        let params = SynchParams {
            threads: 5,
            iterations: 12,
        };
        for policy in [
            SchedPolicy::Fifo,
            SchedPolicy::Lifo,
            SchedPolicy::Random { seed: 7 },
        ] {
            let reports = run(policy, params);
            let ops: Vec<_> = reports.iter().map(|r| (r.test, r.operations)).collect();
            assert_eq!(ops, vec![("semaphore", 60), ("lock", 60), ("cv", 24)]);
        }
    }

    #[test]
    fn single_thread_cv_test_still_has_a_consumer() {
        let reports = run(
            SchedPolicy::Fifo,
            SynchParams {
                threads: 1,
                iterations: 10,
            },
        );
        assert_eq!(reports[2].threads, 2);
        assert_eq!(reports[2].operations, 10);
    }

    type SelfTest = fn(&Context, SynchParams) -> Result<SynchReport, KernelError>;

    const SELF_TESTS: [SelfTest; 3] = [semaphore_test, lock_test, cv_test];

    fn boot(max_threads: usize) -> Kernel {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::boot(KernelConfig {
            max_threads,
            ..KernelConfig::default()
        })
    }

    #[test]
    fn more_threads_than_the_table_holds_is_a_thread_limit_error() {
        let kernel = boot(crate::DEFAULT_MAX_THREADS);
        let (results, live) = kernel
            .run(|ctx| {
                let params = SynchParams {
                    threads: 200,
                    iterations: 4,
                };
                let results: Vec<_> = SELF_TESTS.iter().map(|test| test(ctx, params)).collect();
                (results, ctx.live_channels())
            })
            .unwrap();

        for result in results {
            assert_eq!(
                result,
                Err(KernelError::ThreadLimit(crate::DEFAULT_MAX_THREADS))
            );
        }
        assert_eq!(live, 0);
        assert_eq!(kernel.heap().in_use(), 0);
    }

    #[test]
    fn thread_budget_counts_the_calling_thread() {
        let kernel = boot(4);
        let (fits, too_many, cv_fits) = kernel
            .run(|ctx| {
                let fits = semaphore_test(ctx, SynchParams { threads: 3, iterations: 2 });
                let too_many = lock_test(ctx, SynchParams { threads: 4, iterations: 2 });
                // One producer and two consumers.
                let cv_fits = cv_test(ctx, SynchParams { threads: 3, iterations: 2 });
                (fits, too_many, cv_fits)
            })
            .unwrap();

        assert_eq!(fits.map(|r| r.operations), Ok(6));
        assert_eq!(too_many, Err(KernelError::ThreadLimit(4)));
        assert_eq!(cv_fits.map(|r| r.threads), Ok(3));
    }

    #[test]
    fn failed_creation_destroys_what_was_already_created() {
        let kernel = boot(crate::DEFAULT_MAX_THREADS);
        let outcomes = kernel
            .run(|ctx| {
                // Every primitive takes two allocations: the object and its name.
                // The third allocation fails, after exactly one primitive exists.
                SELF_TESTS
                    .iter()
                    .map(|test| {
                        ctx.heap().fail_after(2);
                        let result = test(ctx, SynchParams::default());
                        ctx.heap().clear_failures();
                        (result, ctx.live_channels())
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap();

        for (result, live) in outcomes {
            assert!(matches!(result, Err(KernelError::OutOfMemory { .. })));
            assert_eq!(live, 0);
        }
        assert_eq!(kernel.heap().in_use(), 0);
    }
}
