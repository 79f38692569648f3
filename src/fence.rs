//! Single-shot completion fences.
//!
//! A [`Fence`] is identified by `(context, seqno)`. Each NPU core owns one
//! [`FenceContext`] and stamps every fence it produces with the next seqno of
//! that context.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::err::RocketError;
use crate::osal::{Osal, TimeStamp};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Outcome a fence is signalled with.
pub type FenceResult = Result<(), RocketError>;

type Callback = Box<dyn FnOnce(FenceResult) + Send>;

enum FenceState {
    Pending(Vec<Callback>),
    Signaled(FenceResult),
}

struct FenceInner {
    context: u64,
    seqno: u64,
    state: Mutex<FenceState>,
}

/// Reference-counted handle to a fence.
#[derive(Clone)]
pub struct Fence(Arc<FenceInner>);

impl Fence {
    fn new(context: u64, seqno: u64) -> Self {
        Self(Arc::new(FenceInner {
            context,
            seqno,
            state: Mutex::new(FenceState::Pending(Vec::new())),
        }))
    }

    pub fn context(&self) -> u64 {
        self.0.context
    }

    pub fn seqno(&self) -> u64 {
        self.0.seqno
    }

    pub fn is_signaled(&self) -> bool {
        matches!(*self.0.state.lock(), FenceState::Signaled(_))
    }

    /// `None` while pending, the signalled outcome afterwards.
    pub fn status(&self) -> Option<FenceResult> {
        match &*self.0.state.lock() {
            FenceState::Pending(_) => None,
            FenceState::Signaled(res) => Some(*res),
        }
    }

    pub fn error(&self) -> Option<RocketError> {
        self.status().and_then(|res| res.err())
    }

    pub fn signal(&self) -> Result<(), RocketError> {
        self.signal_result(Ok(()))
    }

    pub fn signal_error(&self, err: RocketError) -> Result<(), RocketError> {
        self.signal_result(Err(err))
    }

    /// Signals the fence and runs its callbacks outside the state lock.
    ///
    /// Signalling twice is refused with `InvalidArgument`.
    pub fn signal_result(&self, res: FenceResult) -> Result<(), RocketError> {
        let callbacks = {
            let mut state = self.0.state.lock();
            match &mut *state {
                FenceState::Signaled(_) => return Err(RocketError::InvalidArgument),
                FenceState::Pending(cbs) => {
                    let cbs = core::mem::take(cbs);
                    *state = FenceState::Signaled(res);
                    cbs
                }
            }
        };
        for cb in callbacks {
            cb(res);
        }
        Ok(())
    }

    /// Registers `cb` to run once the fence signals; runs it right away if it
    /// already has.
    pub fn on_signaled<F>(&self, cb: F)
    where
        F: FnOnce(FenceResult) + Send + 'static,
    {
        let res = {
            let mut state = self.0.state.lock();
            match &mut *state {
                FenceState::Pending(cbs) => {
                    cbs.push(Box::new(cb));
                    return;
                }
                FenceState::Signaled(res) => *res,
            }
        };
        cb(res);
    }

    /// Polls until the fence signals or `deadline_us` passes.
    ///
    /// A deadline already in the past turns this into a single test.
    pub fn wait_until(&self, osal: &dyn Osal, deadline_us: TimeStamp) -> FenceResult {
        wait_all(core::slice::from_ref(self), osal, deadline_us)?;
        self.status().unwrap_or(Ok(()))
    }

    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.0.context)
            .field("seqno", &self.0.seqno)
            .field("status", &self.status())
            .finish()
    }
}

/// Waits for every fence in `fences` to signal.
///
/// Returns `Busy` when nothing may be waited for and a fence is still pending,
/// `TimedOut` when the deadline passes first.
pub(crate) fn wait_all(fences: &[Fence], osal: &dyn Osal, deadline_us: TimeStamp) -> FenceResult {
    const POLL_INTERVAL_US: u32 = 100;

    let may_wait = osal.get_time_us() < deadline_us;
    loop {
        if fences.iter().all(Fence::is_signaled) {
            return Ok(());
        }
        if !may_wait {
            return Err(RocketError::Busy);
        }
        if osal.get_time_us() >= deadline_us {
            return Err(RocketError::TimedOut);
        }
        osal.udelay(POLL_INTERVAL_US);
    }
}

/// A fence timeline owned by one core.
pub struct FenceContext {
    context: u64,
    emit_seqno: AtomicU64,
}

impl FenceContext {
    pub fn new() -> Self {
        Self {
            context: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            emit_seqno: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    /// Seqno of the most recently created fence.
    pub fn emit_seqno(&self) -> u64 {
        self.emit_seqno.load(Ordering::Acquire)
    }

    pub fn create(&self) -> Fence {
        let seqno = self.emit_seqno.fetch_add(1, Ordering::AcqRel) + 1;
        Fence::new(self.context, seqno)
    }
}

impl Default for FenceContext {
    fn default() -> Self {
        Self::new()
    }
}
