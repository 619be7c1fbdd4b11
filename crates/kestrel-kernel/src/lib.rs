pub mod cpu;
pub mod error;
pub mod memory;
pub mod spl;
pub mod sync;
pub mod synchtest;
pub mod thread;
pub mod types;

pub use crate::cpu::Context;
pub use crate::error::KernelError;
pub use crate::sync::{Cv, Lock, Semaphore};
pub use crate::thread::scheduler::SchedPolicy;
pub use crate::thread::SchedContext;

use crate::cpu::Machine;
use crate::memory::{KernelHeap, DEFAULT_HEAP_BYTES};
use crate::thread::ThreadManager;
use log::info;
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_MAX_THREADS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Kernel heap capacity in bytes.
    pub heap_bytes: usize,
    /// Maximum number of live kernel threads.
    pub max_threads: usize,
    pub scheduler: SchedPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            heap_bytes: DEFAULT_HEAP_BYTES,
            max_threads: DEFAULT_MAX_THREADS,
            scheduler: SchedPolicy::Fifo,
        }
    }
}

/// A booted single-CPU kernel.
pub struct Kernel {
    machine: Arc<Machine>,
    config: KernelConfig,
}

impl Kernel {
    pub fn boot(config: KernelConfig) -> Self {
        info!(
            "Booting kernel: heap={} bytes, max_threads={}, scheduler={:?}",
            config.heap_bytes, config.max_threads, config.scheduler
        );
        let threads = ThreadManager::new(config.scheduler.build(), config.max_threads);
        let heap = KernelHeap::new(config.heap_bytes);
        Self {
            machine: Arc::new(Machine::new(threads, heap)),
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn heap(&self) -> &KernelHeap {
        self.machine.heap()
    }

    /// Run `main` as the first kernel thread and return its result once every
    /// kernel thread, including the ones it forked, has exited.
    ///
    /// A fatal error in any kernel thread halts the machine and the panic is
    /// resumed here. A halted kernel cannot run again.
    pub fn run<F, R>(&self, main: F) -> Result<R, KernelError>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(!self.machine.is_halted(), "kernel has halted");

        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        {
            let mut st = self.machine.lock();
            assert!(st.threads.is_empty(), "kernel is already running");
            self.machine.spawn(&mut st, "main", move |ctx| {
                let value = main(ctx);
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
            })?;
        }

        self.machine.run_until_idle();

        let value = result.lock().unwrap_or_else(PoisonError::into_inner).take();
        match value {
            Some(value) => Ok(value),
            None => unreachable!("main thread exited without a result"),
        }
    }
}
