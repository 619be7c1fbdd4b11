use crate::error::KernelError;
use core::fmt;
use core::ops::Deref;
use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default heap size for a booted kernel (1 MiB).
pub const DEFAULT_HEAP_BYTES: usize = 1024 * 1024;

const NO_FAILURE: usize = usize::MAX;

#[derive(Debug)]
struct HeapStats {
    capacity: usize,
    in_use: AtomicUsize,
    // Allocations left before injected failures start; NO_FAILURE disables.
    fail_after: AtomicUsize,
}

/// Byte-accounted kernel heap.
///
/// The heap hands out [`HeapBlock`]s that give their bytes back when dropped,
/// so an object torn down halfway through construction cannot leak.
#[derive(Debug, Clone)]
pub struct KernelHeap {
    stats: Arc<HeapStats>,
}

impl KernelHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            stats: Arc::new(HeapStats {
                capacity,
                in_use: AtomicUsize::new(0),
                fail_after: AtomicUsize::new(NO_FAILURE),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.stats.capacity
    }

    pub fn in_use(&self) -> usize {
        self.stats.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_use())
    }

    /// Let the next `count` allocations through and fail every one after.
    pub fn fail_after(&self, count: usize) {
        self.stats.fail_after.store(count, Ordering::Release);
    }

    /// Stop injecting allocation failures.
    pub fn clear_failures(&self) {
        self.stats.fail_after.store(NO_FAILURE, Ordering::Release);
    }

    fn injected_failure(&self) -> bool {
        let previous =
            self.stats
                .fail_after
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
                    NO_FAILURE | 0 => None,
                    n => Some(n - 1),
                });
        matches!(previous, Err(0))
    }

    pub fn kmalloc(&self, size: usize) -> Result<HeapBlock, KernelError> {
        let out_of_memory = || KernelError::OutOfMemory {
            requested: size,
            available: self.available(),
        };

        if self.injected_failure() {
            trace!("kmalloc({}): injected failure", size);
            return Err(out_of_memory());
        }

        let capacity = self.stats.capacity;
        self.stats
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= capacity)
            })
            .map_err(|_| out_of_memory())?;

        trace!("kmalloc({}): {} bytes in use", size, self.in_use());
        Ok(HeapBlock {
            stats: Arc::clone(&self.stats),
            size,
        })
    }

    /// Copy `s` onto the heap, accounting for a terminating byte.
    pub fn kstrdup(&self, s: &str) -> Result<KString, KernelError> {
        let block = self.kmalloc(s.len() + 1)?;
        Ok(KString {
            text: s.into(),
            _block: block,
        })
    }
}

/// A live heap allocation. Dropping it frees the bytes.
#[derive(Debug)]
pub struct HeapBlock {
    stats: Arc<HeapStats>,
    size: usize,
}

impl HeapBlock {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        self.stats.in_use.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Heap-allocated, immutable kernel string.
pub struct KString {
    text: Box<str>,
    _block: HeapBlock,
}

impl Deref for KString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for KString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for KString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.text, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_return_their_bytes() {
        let heap = KernelHeap::new(64);
        let a = heap.kmalloc(40).unwrap();
        assert_eq!(heap.in_use(), 40);
        assert!(matches!(
            heap.kmalloc(40),
            Err(KernelError::OutOfMemory {
                requested: 40,
                available: 24
            })
        ));
        drop(a);
        assert_eq!(heap.in_use(), 0);
        assert!(heap.kmalloc(64).is_ok());
    }

    #[test]
    fn kstrdup_counts_the_terminator() {
        let heap = KernelHeap::new(16);
        let s = heap.kstrdup("hello").unwrap();
        assert_eq!(&*s, "hello");
        assert_eq!(heap.in_use(), 6);
        assert!(heap.kstrdup("0123456789").is_err());
        drop(s);
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn injected_failures_start_after_the_allowance() {
        let heap = KernelHeap::new(1024);
        heap.fail_after(2);
        let _a = heap.kmalloc(1).unwrap();
        let _b = heap.kmalloc(1).unwrap();
        assert!(heap.kmalloc(1).is_err());
        assert!(heap.kmalloc(1).is_err());
        heap.clear_failures();
        assert!(heap.kmalloc(1).is_ok());
    }
}
