use kestrel_kernel::synchtest::{self, SynchParams};
use kestrel_kernel::{Kernel, KernelConfig, SchedPolicy, Semaphore};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn boot(scheduler: SchedPolicy) -> Kernel {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::boot(KernelConfig {
        scheduler,
        ..KernelConfig::default()
    })
}

#[derive(Debug, Clone, Copy)]
enum SemOp {
    Down,
    Up,
}

fn sem_op() -> impl Strategy<Value = SemOp> {
    prop_oneof![Just(SemOp::Down), Just(SemOp::Up)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn count_tracks_initial_plus_ups_minus_downs(
        initial in 0u32..5,
        ops in prop::collection::vec(sem_op(), 0..48),
    ) {
        let kernel = boot(SchedPolicy::Fifo);
        let script = ops.clone();
        let observed = kernel
            .run(move |ctx| {
                let sem = Semaphore::create(ctx, "prop", initial).unwrap();
                let mut counts = Vec::with_capacity(script.len());
                for op in script {
                    match op {
                        // A lone thread would deadlock on an empty semaphore.
                        SemOp::Down if sem.count(ctx) == 0 => {}
                        SemOp::Down => sem.down(ctx),
                        SemOp::Up => sem.up(ctx),
                    }
                    counts.push(sem.count(ctx));
                }
                sem.destroy(ctx);
                counts
            })
            .unwrap();

        let mut expected = i64::from(initial);
        for (op, count) in ops.iter().zip(observed) {
            match op {
                SemOp::Down if expected == 0 => {}
                SemOp::Down => expected -= 1,
                SemOp::Up => expected += 1,
            }
            prop_assert!(expected >= 0);
            prop_assert_eq!(i64::from(count), expected);
        }
        prop_assert_eq!(kernel.heap().in_use(), 0);
    }

    #[test]
    fn one_up_lets_exactly_one_down_through(
        sleepers in 1usize..6,
        seed in any::<u64>(),
    ) {
        let kernel = boot(SchedPolicy::Random { seed });
        let (after_one, after_all, count) = kernel
            .run(move |ctx| {
                let sem = Semaphore::create(ctx, "gate", 0).unwrap();
                let done = Semaphore::create(ctx, "done", 0).unwrap();
                let passed = Arc::new(AtomicUsize::new(0));

                for n in 0..sleepers {
                    let (sem, done, passed) = (sem.clone(), done.clone(), Arc::clone(&passed));
                    ctx.thread_fork(&format!("sleeper-{}", n), move |ctx| {
                        sem.down(ctx);
                        passed.fetch_add(1, Ordering::Relaxed);
                        done.up(ctx);
                    })
                    .unwrap();
                }

                sem.up(ctx);
                done.down(ctx);
                let after_one = passed.load(Ordering::Relaxed);

                for _ in 1..sleepers {
                    sem.up(ctx);
                }
                for _ in 1..sleepers {
                    done.down(ctx);
                }
                let after_all = passed.load(Ordering::Relaxed);
                let count = sem.count(ctx);

                sem.destroy(ctx);
                done.destroy(ctx);
                (after_one, after_all, count)
            })
            .unwrap();

        prop_assert_eq!(after_one, 1);
        prop_assert_eq!(after_all, sleepers);
        prop_assert_eq!(count, 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn self_tests_pass_under_any_random_schedule(
        seed in any::<u64>(),
        threads in 1usize..6,
        iterations in 1usize..8,
    ) {
        let kernel = boot(SchedPolicy::Random { seed });
        let params = SynchParams { threads, iterations };
        let reports = kernel.run(move |ctx| synchtest::run_all(ctx, params)).unwrap();

        prop_assert!(reports.is_ok(), "{:?}", reports);
        prop_assert_eq!(kernel.heap().in_use(), 0);
    }
}
