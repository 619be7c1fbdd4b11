//! The host-side uniprocessor.
//!
//! Every kernel thread is carried by a host thread, but only the thread that
//! currently owns the CPU runs; the others are parked on the `baton` condition
//! variable. Ownership only changes hands when the running thread sleeps,
//! yields or exits, which makes the machine single-core and non-preemptive.

use crate::error::KernelError;
use crate::memory::KernelHeap;
use crate::spl::Ipl;
use crate::thread::{SchedContext, ThreadManager};
use crate::types::{ThreadHandle, WaitChannel};
use core::marker::PhantomData;
use log::{debug, error, trace};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

pub(crate) type Interrupt = Box<dyn FnOnce(&Context) + Send>;

/// Unwind payload used to tear down parked threads after a kernel panic.
struct Halted;

pub(crate) struct MachineState {
    pub(crate) threads: ThreadManager,
    pending: VecDeque<Interrupt>,
    hosts: Vec<JoinHandle<()>>,
    halted: bool,
    panic: Option<Box<dyn Any + Send>>,
}

pub(crate) struct Machine {
    state: Mutex<MachineState>,
    baton: Condvar,
    heap: KernelHeap,
}

impl Machine {
    pub(crate) fn new(threads: ThreadManager, heap: KernelHeap) -> Self {
        Self {
            state: Mutex::new(MachineState {
                threads,
                pending: VecDeque::new(),
                hosts: Vec::new(),
                halted: false,
                panic: None,
            }),
            baton: Condvar::new(),
            heap,
        }
    }

    pub(crate) fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&'a self, st: MutexGuard<'a, MachineState>) -> MutexGuard<'a, MachineState> {
        self.baton.wait(st).unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a kernel thread and start the host thread that carries it.
    /// The new thread is ready but does not run until it is scheduled.
    pub(crate) fn spawn<F>(
        self: &Arc<Self>,
        st: &mut MachineState,
        name: &str,
        f: F,
    ) -> Result<ThreadHandle, KernelError>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let handle = st.threads.create_thread(name)?;
        let machine = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("kthread-{}-{}", handle.val(), name))
            .spawn(move || machine.thread_main(handle, f));

        match spawned {
            Ok(host) => {
                debug!("thread_fork: {} ({})", handle, name);
                st.hosts.push(host);
                Ok(handle)
            }
            Err(e) => {
                error!("thread_fork: cannot start host thread for {}: {}", name, e);
                st.threads.discard_thread(handle);
                Err(KernelError::ThreadLimit(st.threads.threads.len()))
            }
        }
    }

    fn thread_main<F>(self: Arc<Self>, me: ThreadHandle, f: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let ctx = Context::new(Arc::clone(&self), me);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let st = ctx.wait_turn(self.lock());
            let st = ctx.deliver_if_enabled(st);
            drop(st);
            f(&ctx);
            ctx.exit();
        }));

        if let Err(payload) = outcome {
            if !payload.is::<Halted>() {
                self.halt(payload);
            }
        }
    }

    fn halt(&self, payload: Box<dyn Any + Send>) {
        let mut st = self.lock();
        if !st.halted {
            error!("kernel panic: halting");
            st.halted = true;
            st.panic = Some(payload);
        }
        drop(st);
        self.baton.notify_all();
    }

    /// Start the first ready thread and wait for every kernel thread to exit.
    ///
    /// Resumes the original panic if a kernel thread hit a fatal error.
    pub(crate) fn run_until_idle(&self) {
        let mut st = self.lock();
        st.threads.switch_next();
        self.baton.notify_all();
        while !st.halted && !st.threads.is_empty() {
            st = self.wait(st);
        }
        let hosts = std::mem::take(&mut st.hosts);
        let payload = st.panic.take();
        drop(st);

        for host in hosts {
            // thread_main catches everything, a join error cannot carry news.
            let _ = host.join();
        }
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.lock().halted
    }
}

/// A kernel thread's view of the machine.
///
/// Handed to every kernel thread body and interrupt handler; it cannot leave
/// the host thread it was created on.
pub struct Context {
    machine: Arc<Machine>,
    me: ThreadHandle,
    _not_send: PhantomData<*const ()>,
}

impl Context {
    fn new(machine: Arc<Machine>, me: ThreadHandle) -> Self {
        Self {
            machine,
            me,
            _not_send: PhantomData,
        }
    }

    /// Start a new kernel thread. It runs once the scheduler picks it.
    pub fn thread_fork<F>(&self, name: &str, f: F) -> Result<ThreadHandle, KernelError>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let mut st = self.machine.lock();
        self.machine.spawn(&mut st, name, f)
    }

    /// Give up the CPU; the caller stays runnable.
    pub fn thread_yield(&self) {
        let mut st = self.machine.lock();
        if st.threads.cpu.in_interrupt {
            drop(st);
            panic!("thread_yield: called in interrupt context");
        }
        st.threads.yield_current();
        let st = self.switch_away(st);
        let st = self.wait_turn(st);
        drop(self.deliver_if_enabled(st));
    }

    /// Raise an interrupt on this CPU.
    ///
    /// The handler runs right away when the level is low, and is deferred
    /// until the level drops otherwise.
    pub fn interrupt<F>(&self, handler: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let mut st = self.machine.lock();
        st.pending.push_back(Box::new(handler));
        drop(self.deliver_if_enabled(st));
    }

    /// Threads that can still be forked before the thread table is full.
    pub fn threads_available(&self) -> usize {
        self.machine.lock().threads.available()
    }

    pub fn max_threads(&self) -> usize {
        self.machine.lock().threads.max_threads()
    }

    /// Wait channels issued and not yet retired. Diagnostic only.
    pub fn live_channels(&self) -> usize {
        self.machine.lock().threads.channels.live_count()
    }

    pub fn thread_name(&self) -> String {
        let st = self.machine.lock();
        st.threads
            .name_of(self.me)
            .map(str::to_owned)
            .unwrap_or_default()
    }

    fn exit(&self) {
        let mut st = self.machine.lock();
        debug!("thread_exit: {}", self.me);
        st.threads.exit_current();
        drop(self.switch_away(st));
    }

    /// Park until this thread owns the CPU again.
    fn wait_turn<'a>(
        &'a self,
        mut st: MutexGuard<'a, MachineState>,
    ) -> MutexGuard<'a, MachineState> {
        while !st.halted && st.threads.current_thread != Some(self.me) {
            st = self.machine.wait(st);
        }
        if st.halted {
            drop(st);
            panic::resume_unwind(Box::new(Halted));
        }
        st
    }

    /// Hand the CPU to the next ready thread. The caller has already been
    /// taken off the CPU (asleep, requeued or exited).
    fn switch_away<'a>(
        &'a self,
        mut st: MutexGuard<'a, MachineState>,
    ) -> MutexGuard<'a, MachineState> {
        loop {
            if let Some(next) = st.threads.switch_next() {
                if next != self.me {
                    trace!("switch {} -> {}", self.me, next);
                }
                self.machine.baton.notify_all();
                return st;
            }

            // Idle: nothing can run, but a deferred interrupt may wake someone.
            if let Some(irq) = st.pending.pop_front() {
                trace!("idle: delivering deferred interrupt");
                st = self.run_interrupt(st, irq);
                continue;
            }

            let sleeping = st.threads.sleeping();
            if sleeping > 0 {
                drop(st);
                panic!(
                    "deadlock: no runnable thread and {} thread(s) asleep",
                    sleeping
                );
            }

            // Last thread gone.
            self.machine.baton.notify_all();
            return st;
        }
    }

    fn run_interrupt<'a>(
        &'a self,
        mut st: MutexGuard<'a, MachineState>,
        irq: Interrupt,
    ) -> MutexGuard<'a, MachineState> {
        let saved = st.threads.cpu;
        st.threads.cpu.ipl = Ipl::High;
        st.threads.cpu.in_interrupt = true;
        drop(st);

        irq(self);

        let mut st = self.machine.lock();
        st.threads.cpu = saved;
        st
    }

    fn deliver_if_enabled<'a>(
        &'a self,
        mut st: MutexGuard<'a, MachineState>,
    ) -> MutexGuard<'a, MachineState> {
        while st.threads.cpu.ipl == Ipl::Low && !st.threads.cpu.in_interrupt && !st.halted {
            match st.pending.pop_front() {
                Some(irq) => st = self.run_interrupt(st, irq),
                None => break,
            }
        }
        st
    }
}

impl SchedContext for Context {
    fn current_thread(&self) -> ThreadHandle {
        self.me
    }

    fn in_interrupt(&self) -> bool {
        self.machine.lock().threads.cpu.in_interrupt
    }

    fn raise_ipl(&self) -> Ipl {
        let mut st = self.machine.lock();
        std::mem::replace(&mut st.threads.cpu.ipl, Ipl::High)
    }

    fn restore_ipl(&self, previous: Ipl) {
        let mut st = self.machine.lock();
        if st.halted {
            return;
        }
        st.threads.cpu.ipl = previous;
        if !thread::panicking() {
            drop(self.deliver_if_enabled(st));
        }
    }

    fn sleep(&self, chan: WaitChannel) {
        let mut st = self.machine.lock();
        let cpu = st.threads.cpu;
        if cpu.in_interrupt {
            drop(st);
            panic!("sleep on {}: called in interrupt context", chan);
        }
        if cpu.ipl != Ipl::High {
            drop(st);
            panic!("sleep on {}: interrupts not disabled", chan);
        }
        if st.threads.sleep_current(chan).is_none() {
            drop(st);
            panic!("sleep on {}: not a live wait channel", chan);
        }
        trace!("{} sleeps on {}", self.me, chan);

        let st = self.switch_away(st);
        drop(self.wait_turn(st));
    }

    fn wakeup_one(&self, chan: WaitChannel) {
        let mut st = self.machine.lock();
        if st.threads.wake_one(chan).is_none() {
            drop(st);
            panic!("wakeup on {}: not a live wait channel", chan);
        }
    }

    fn wakeup_all(&self, chan: WaitChannel) {
        let mut st = self.machine.lock();
        if st.threads.wake_all(chan).is_none() {
            drop(st);
            panic!("wakeup on {}: not a live wait channel", chan);
        }
    }

    fn has_sleepers(&self, chan: WaitChannel) -> bool {
        let count = self.machine.lock().threads.channels.sleeper_count(chan);
        match count {
            Some(count) => count > 0,
            None => panic!("has_sleepers on {}: not a live wait channel", chan),
        }
    }

    fn create_channel(&self) -> WaitChannel {
        self.machine.lock().threads.channels.create()
    }

    fn retire_channel(&self, chan: WaitChannel) {
        let mut st = self.machine.lock();
        let count = st.threads.channels.sleeper_count(chan);
        match count {
            Some(0) => {
                st.threads.channels.retire(chan);
            }
            Some(n) => {
                drop(st);
                panic!("retire {}: {} thread(s) still asleep on it", chan, n);
            }
            None => {
                drop(st);
                panic!("retire {}: not a live wait channel", chan);
            }
        }
    }

    fn heap(&self) -> &KernelHeap {
        self.machine.heap()
    }
}
