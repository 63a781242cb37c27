//! Per-CPU identification
//!
//! Dataplane workers are pinned one-per-CPU and register their logical id
//! here; per-CPU state (hold counters, deferred-work queues) is indexed by
//! it. Threads that never register (e.g. the control thread) read id 0.

use std::cell::Cell;

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
}

/// Register the calling thread's logical CPU id.
pub fn set_current(id: usize) {
    CPU_ID.with(|c| c.set(id));
}

/// Logical CPU id of the calling thread.
#[inline(always)]
pub fn current() -> usize {
    CPU_ID.with(|c| c.get())
}

/// Number of CPUs available to the process.
pub fn count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cpu_is_zero() {
        assert_eq!(current(), 0);
    }

    #[test]
    fn test_set_current_is_thread_local() {
        set_current(3);
        assert_eq!(current(), 3);

        let other = std::thread::spawn(|| {
            assert_eq!(current(), 0);
            set_current(1);
            current()
        })
        .join()
        .unwrap();

        assert_eq!(other, 1);
        assert_eq!(current(), 3);
        set_current(0);
    }
}
