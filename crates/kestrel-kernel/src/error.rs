use thiserror::Error;

/// Recoverable kernel failures.
///
/// Protocol violations (blocking in an interrupt handler, releasing a lock
/// the caller does not hold, ...) are not represented here; they panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("out of kernel memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("thread limit reached ({0} threads)")]
    ThreadLimit(usize),

    #[error("self-test {test} failed: {reason}")]
    TestFailed { test: &'static str, reason: String },
}
