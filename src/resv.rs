//! Per-BO reservation objects.

use alloc::vec::Vec;

use spin::Mutex;

use crate::fence::{self, Fence, FenceResult};
use crate::osal::{Osal, TimeStamp};

/// How a fence in a reservation object uses the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResvUsage {
    Write,
    Read,
}

impl ResvUsage {
    /// The usage a waiter must consider: readers only wait for writers,
    /// writers wait for everybody.
    pub const fn rw(write: bool) -> Self {
        if write { ResvUsage::Read } else { ResvUsage::Write }
    }

    const fn includes(self, entry: ResvUsage) -> bool {
        match self {
            ResvUsage::Write => matches!(entry, ResvUsage::Write),
            ResvUsage::Read => true,
        }
    }
}

/// Container of the fences ordering producers and consumers of one BO.
#[derive(Default)]
pub struct Reservation {
    fences: Mutex<Vec<(Fence, ResvUsage)>>,
}

impl Reservation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `fence`, replacing an older fence of the same context and
    /// dropping entries that already signalled.
    pub fn add_fence(&self, fence: Fence, usage: ResvUsage) {
        let mut fences = self.fences.lock();
        fences.retain(|(f, _)| !f.is_signaled() && f.context() != fence.context());
        fences.push((fence, usage));
    }

    /// Fences a waiter with `usage` must wait for.
    ///
    /// Signalled fences are reported too, so their error stays visible.
    pub fn fences(&self, usage: ResvUsage) -> Vec<Fence> {
        self.fences
            .lock()
            .iter()
            .filter(|(_, entry)| usage.includes(*entry))
            .map(|(f, _)| f.clone())
            .collect()
    }

    pub fn test_signaled(&self, usage: ResvUsage) -> bool {
        self.fences(usage).iter().all(Fence::is_signaled)
    }

    pub fn wait_until(&self, usage: ResvUsage, osal: &dyn Osal, deadline_us: TimeStamp) -> FenceResult {
        let fences = self.fences(usage);
        fence::wait_all(&fences, osal, deadline_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::FenceContext;

    #[test]
    fn readers_wait_for_writers_only() {
        let resv = Reservation::new();
        let writer = FenceContext::new().create();
        let reader = FenceContext::new().create();
        resv.add_fence(writer.clone(), ResvUsage::Write);
        resv.add_fence(reader.clone(), ResvUsage::Read);

        let for_read = resv.fences(ResvUsage::rw(false));
        assert_eq!(for_read.len(), 1);
        assert!(for_read[0].ptr_eq(&writer));
        assert_eq!(resv.fences(ResvUsage::rw(true)).len(), 2);

        writer.signal().unwrap();
        assert!(resv.test_signaled(ResvUsage::Write));
        assert!(!resv.test_signaled(ResvUsage::Read));
    }

    #[test]
    fn same_context_fence_is_replaced() {
        let resv = Reservation::new();
        let ctx = FenceContext::new();
        let first = ctx.create();
        let second = ctx.create();
        resv.add_fence(first, ResvUsage::Write);
        resv.add_fence(second.clone(), ResvUsage::Write);

        let fences = resv.fences(ResvUsage::Read);
        assert_eq!(fences.len(), 1);
        assert!(fences[0].ptr_eq(&second));
    }
}
