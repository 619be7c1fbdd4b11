pub mod channel;
pub mod scheduler;
pub mod tcb;

use crate::error::KernelError;
use crate::memory::KernelHeap;
use crate::spl::Ipl;
use crate::types::{ThreadHandle, WaitChannel};
use channel::ChannelTable;
use log::trace;
use scheduler::Scheduler;
use std::collections::HashMap;
use tcb::{CpuFlags, ThreadControlBlock, ThreadState};

/// The services a synchronization primitive needs from the kernel it runs in.
///
/// Every primitive operation takes one of these explicitly instead of reaching
/// for a global "current thread" or interrupt level.
pub trait SchedContext {
    /// Identity of the running thread.
    fn current_thread(&self) -> ThreadHandle;

    /// True while an interrupt handler is running.
    fn in_interrupt(&self) -> bool;

    /// Raise the level to [`Ipl::High`] and return the level it replaced.
    fn raise_ipl(&self) -> Ipl;

    /// Put back a level returned by [`raise_ipl`](Self::raise_ipl).
    fn restore_ipl(&self, previous: Ipl);

    /// Block the calling thread until `chan` is woken.
    ///
    /// Must be called with the level raised and outside interrupt context;
    /// the level is still raised when the thread resumes.
    fn sleep(&self, chan: WaitChannel);

    /// Make the longest sleeper on `chan` runnable, if there is one.
    fn wakeup_one(&self, chan: WaitChannel);

    /// Make every sleeper on `chan` runnable.
    fn wakeup_all(&self, chan: WaitChannel);

    fn has_sleepers(&self, chan: WaitChannel) -> bool;

    fn create_channel(&self) -> WaitChannel;

    /// Retire `chan`; later use of the handle is a fatal error.
    fn retire_channel(&self, chan: WaitChannel);

    fn heap(&self) -> &KernelHeap;
}

/// Thread table, ready queue and wait channels of the single CPU.
///
/// This is bookkeeping only; parking and resuming the host threads that carry
/// kernel threads is done by the machine in `cpu`.
pub struct ThreadManager {
    pub threads: HashMap<ThreadHandle, ThreadControlBlock>,
    pub scheduler: Box<dyn Scheduler>,
    pub channels: ChannelTable,
    pub current_thread: Option<ThreadHandle>,
    pub cpu: CpuFlags,
    next_handle: u32,
    max_threads: usize,
}

impl ThreadManager {
    pub fn new(scheduler: Box<dyn Scheduler>, max_threads: usize) -> Self {
        Self {
            threads: HashMap::new(),
            scheduler,
            channels: ChannelTable::new(),
            current_thread: None,
            cpu: CpuFlags::default(),
            next_handle: 1,
            max_threads,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Threads that can still be created before the table is full.
    pub fn available(&self) -> usize {
        self.max_threads.saturating_sub(self.threads.len())
    }

    pub fn sleeping(&self) -> usize {
        self.threads
            .values()
            .filter(|tcb| matches!(tcb.state, ThreadState::Sleeping(_)))
            .count()
    }

    pub fn name_of(&self, handle: ThreadHandle) -> Option<&str> {
        self.threads.get(&handle).map(|tcb| tcb.name.as_str())
    }

    /// Register a new ready thread. Handles are never reused.
    pub fn create_thread(&mut self, name: &str) -> Result<ThreadHandle, KernelError> {
        if self.threads.len() >= self.max_threads {
            return Err(KernelError::ThreadLimit(self.max_threads));
        }
        let handle = ThreadHandle::new(self.next_handle).ok_or(KernelError::ThreadLimit(
            self.max_threads,
        ))?;
        self.next_handle += 1;

        self.threads
            .insert(handle, ThreadControlBlock::new(handle, name));
        self.scheduler.enqueue(handle);
        Ok(handle)
    }

    /// Forget a thread that never got to run.
    pub fn discard_thread(&mut self, handle: ThreadHandle) {
        self.scheduler.dequeue(handle);
        self.threads.remove(&handle);
    }

    fn save_current(&mut self, state: ThreadState) -> Option<ThreadHandle> {
        let current = self.current_thread.take()?;
        let cpu = self.cpu;
        if let Some(tcb) = self.threads.get_mut(&current) {
            tcb.state = state;
            tcb.context.save_from(&cpu);
        }
        Some(current)
    }

    /// Put the running thread to sleep on `chan`. `None` if `chan` is stale.
    pub fn sleep_current(&mut self, chan: WaitChannel) -> Option<()> {
        let current = self.current_thread?;
        self.channels.push_sleeper(chan, current)?;
        self.save_current(ThreadState::Sleeping(chan));
        Some(())
    }

    pub fn yield_current(&mut self) {
        if let Some(current) = self.save_current(ThreadState::Ready) {
            self.scheduler.enqueue(current);
        }
    }

    pub fn exit_current(&mut self) {
        if let Some(current) = self.current_thread.take() {
            self.threads.remove(&current);
        }
    }

    /// Pick the next ready thread and make it current.
    pub fn switch_next(&mut self) -> Option<ThreadHandle> {
        let next = self.scheduler.schedule()?;
        let tcb = self.threads.get_mut(&next)?;
        tcb.state = ThreadState::Running;
        tcb.context.restore_to(&mut self.cpu);
        self.current_thread = Some(next);
        Some(next)
    }

    fn make_ready(&mut self, handle: ThreadHandle) {
        if let Some(tcb) = self.threads.get_mut(&handle) {
            if matches!(tcb.state, ThreadState::Sleeping(_)) {
                tcb.state = ThreadState::Ready;
                self.scheduler.enqueue(handle);
            }
        }
    }

    /// Wake the longest sleeper on `chan`. `None` if `chan` is stale.
    pub fn wake_one(&mut self, chan: WaitChannel) -> Option<Option<ThreadHandle>> {
        let woken = self.channels.pop_sleeper(chan)?;
        if let Some(handle) = woken {
            trace!("wakeup_one {}: {}", chan, handle);
            self.make_ready(handle);
        }
        Some(woken)
    }

    /// Wake every sleeper on `chan`. `None` if `chan` is stale.
    pub fn wake_all(&mut self, chan: WaitChannel) -> Option<usize> {
        let sleepers = self.channels.take_sleepers(chan)?;
        let count = sleepers.len();
        for handle in sleepers {
            self.make_ready(handle);
        }
        if count > 0 {
            trace!("wakeup_all {}: {} thread(s)", chan, count);
        }
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::scheduler::SchedPolicy;
    use super::*;

    fn manager() -> ThreadManager {
        ThreadManager::new(SchedPolicy::Fifo.build(), 4)
    }

    #[test]
    fn sleeping_thread_keeps_its_level_until_woken() {
        let mut tm = manager();
        let a = tm.create_thread("a").unwrap();
        let b = tm.create_thread("b").unwrap();
        let chan = tm.channels.create();

        assert_eq!(tm.switch_next(), Some(a));
        tm.cpu.ipl = Ipl::High;
        tm.sleep_current(chan).unwrap();
        assert_eq!(tm.current_thread, None);

        assert_eq!(tm.switch_next(), Some(b));
        assert_eq!(tm.cpu.ipl, Ipl::Low);
        assert_eq!(tm.sleeping(), 1);

        assert_eq!(tm.wake_one(chan), Some(Some(a)));
        tm.yield_current();
        assert_eq!(tm.switch_next(), Some(a));
        assert_eq!(tm.cpu.ipl, Ipl::High);
        assert_eq!(tm.sleeping(), 0);
    }

    #[test]
    fn wake_all_readies_every_sleeper_once() {
        let mut tm = manager();
        let chan = tm.channels.create();
        for name in ["a", "b", "c"] {
            tm.create_thread(name).unwrap();
            tm.switch_next().unwrap();
            tm.sleep_current(chan).unwrap();
        }
        assert_eq!(tm.wake_all(chan), Some(3));
        assert_eq!(tm.wake_all(chan), Some(0));
        assert_eq!(tm.scheduler.len(), 3);
    }

    #[test]
    fn thread_limit_and_stale_channels() {
        let mut tm = manager();
        for i in 0..4 {
            tm.create_thread(&format!("t{}", i)).unwrap();
        }
        assert_eq!(tm.available(), 0);
        assert_eq!(tm.create_thread("extra"), Err(KernelError::ThreadLimit(4)));

        let chan = tm.channels.create();
        tm.channels.retire(chan).unwrap();
        tm.switch_next().unwrap();
        assert!(tm.sleep_current(chan).is_none());
        assert!(tm.wake_all(chan).is_none());
    }
}
