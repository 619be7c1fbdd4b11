use crate::types::ThreadHandle;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

pub trait Scheduler: Send {
    /// Select next thread to run
    fn schedule(&mut self) -> Option<ThreadHandle>;

    /// Add thread to ready queue
    fn enqueue(&mut self, thread: ThreadHandle);

    /// Remove thread from ready queue (a thread whose start was abandoned)
    fn dequeue(&mut self, thread: ThreadHandle) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which ready thread runs next.
///
/// Correct synchronization code must not depend on the choice, so the
/// non-FIFO policies exist to shake out ordering assumptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Round robin: oldest ready thread first.
    #[default]
    Fifo,
    /// Most recently readied thread first.
    Lifo,
    /// Uniformly random ready thread, reproducible from the seed.
    Random { seed: u64 },
}

impl SchedPolicy {
    pub fn build(self) -> Box<dyn Scheduler> {
        match self {
            SchedPolicy::Fifo => Box::new(RoundRobinScheduler::new()),
            SchedPolicy::Lifo => Box::new(LifoScheduler::default()),
            SchedPolicy::Random { seed } => Box::new(RandomScheduler::new(seed)),
        }
    }
}

fn remove_from(queue: &mut VecDeque<ThreadHandle>, thread: ThreadHandle) -> bool {
    match queue.iter().position(|&h| h == thread) {
        Some(pos) => queue.remove(pos).is_some(),
        None => false,
    }
}

pub struct RoundRobinScheduler {
    ready_queue: VecDeque<ThreadHandle>,
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self {
            ready_queue: VecDeque::new(),
        }
    }
}

impl Scheduler for RoundRobinScheduler {
    fn schedule(&mut self) -> Option<ThreadHandle> {
        self.ready_queue.pop_front()
    }

    fn enqueue(&mut self, thread: ThreadHandle) {
        self.ready_queue.push_back(thread);
    }

    fn dequeue(&mut self, thread: ThreadHandle) -> bool {
        remove_from(&mut self.ready_queue, thread)
    }

    fn len(&self) -> usize {
        self.ready_queue.len()
    }
}

#[derive(Default)]
pub struct LifoScheduler {
    ready_stack: VecDeque<ThreadHandle>,
}

impl Scheduler for LifoScheduler {
    fn schedule(&mut self) -> Option<ThreadHandle> {
        self.ready_stack.pop_back()
    }

    fn enqueue(&mut self, thread: ThreadHandle) {
        self.ready_stack.push_back(thread);
    }

    fn dequeue(&mut self, thread: ThreadHandle) -> bool {
        remove_from(&mut self.ready_stack, thread)
    }

    fn len(&self) -> usize {
        self.ready_stack.len()
    }
}

pub struct RandomScheduler {
    ready: VecDeque<ThreadHandle>,
    rng: StdRng,
}

impl RandomScheduler {
    pub fn new(seed: u64) -> Self {
        Self {
            ready: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Scheduler for RandomScheduler {
    fn schedule(&mut self) -> Option<ThreadHandle> {
        if self.ready.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.ready.len());
        self.ready.swap_remove_back(pick)
    }

    fn enqueue(&mut self, thread: ThreadHandle) {
        self.ready.push_back(thread);
    }

    fn dequeue(&mut self, thread: ThreadHandle) -> bool {
        remove_from(&mut self.ready, thread)
    }

    fn len(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(ids: &[u32]) -> Vec<ThreadHandle> {
        ids.iter().filter_map(|&id| ThreadHandle::new(id)).collect()
    }

    fn drain(scheduler: &mut dyn Scheduler) -> Vec<u32> {
        std::iter::from_fn(|| scheduler.schedule())
            .map(|h| h.val())
            .collect()
    }

    #[test]
    fn fifo_and_lifo_orders() {
        let mut fifo = SchedPolicy::Fifo.build();
        let mut lifo = SchedPolicy::Lifo.build();
        for h in handles(&[1, 2, 3]) {
            fifo.enqueue(h);
            lifo.enqueue(h);
        }
        assert_eq!(drain(fifo.as_mut()), vec![1, 2, 3]);
        assert_eq!(drain(lifo.as_mut()), vec![3, 2, 1]);
    }

    #[test]
    fn random_is_a_reproducible_permutation() {
        let run = |seed| {
            let mut s = SchedPolicy::Random { seed }.build();
            for h in handles(&[1, 2, 3, 4, 5, 6]) {
                s.enqueue(h);
            }
            drain(s.as_mut())
        };
        let first = run(42);
        assert_eq!(first, run(42));
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn dequeue_removes_only_the_named_thread() {
        let mut s = RoundRobinScheduler::new();
        for h in handles(&[1, 2, 3]) {
            s.enqueue(h);
        }
        assert!(s.dequeue(handles(&[2])[0]));
        assert!(!s.dequeue(handles(&[9])[0]));
        assert_eq!(s.len(), 2);
        assert_eq!(drain(&mut s), vec![1, 3]);
    }
}
