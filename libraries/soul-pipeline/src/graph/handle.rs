//! State change handles
//!
//! A [`StateChangeHandle`] is the promise returned by a state request. The
//! runtime may answer immediately (the handle is created already resolved)
//! or later from its own thread through the paired [`StateChangeResolver`].
//! Callers can poll, block, block with a bound, or `.await` it; none of
//! these depend on an async executor.

use crate::error::{PipelineError, Result};
use crate::types::{GraphState, StateChangeReturn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Slot {
    result: Option<StateChangeReturn>,
    waker: Option<Waker>,
}

struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Shared {
    fn resolve(&self, result: StateChangeReturn) {
        let waker = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.result.is_some() {
                return;
            }
            slot.result = Some(result);
            slot.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Eventual result of a state change request
pub struct StateChangeHandle {
    target: GraphState,
    shared: Arc<Shared>,
}

/// Completes a pending [`StateChangeHandle`]
///
/// Dropping a resolver without calling [`resolve`](Self::resolve) resolves
/// the handle to `Failure`.
pub struct StateChangeResolver {
    target: GraphState,
    shared: Option<Arc<Shared>>,
}

impl StateChangeHandle {
    /// A handle that is already answered
    pub fn ready(target: GraphState, result: StateChangeReturn) -> Self {
        let handle = Self::new(target);
        handle.shared.resolve(result);
        handle
    }

    /// A handle answered later through the returned resolver
    pub fn pending(target: GraphState) -> (Self, StateChangeResolver) {
        let handle = Self::new(target);
        let resolver = StateChangeResolver {
            target,
            shared: Some(Arc::clone(&handle.shared)),
        };
        (handle, resolver)
    }

    fn new(target: GraphState) -> Self {
        Self {
            target,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// State this request asked for
    pub fn target(&self) -> GraphState {
        self.target
    }

    /// Non-blocking poll
    pub fn try_result(&self) -> Option<StateChangeReturn> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .result
    }

    pub fn is_resolved(&self) -> bool {
        self.try_result().is_some()
    }

    /// Block until the transition settles
    pub fn wait(self) -> StateChangeReturn {
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.result {
                return result;
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`
    ///
    /// Expiry is reported as `StateTransitionTimeout`; the handle stays
    /// usable and can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<StateChangeReturn> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.result {
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::StateTransitionTimeout(timeout));
            }
            slot = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl std::fmt::Debug for StateChangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateChangeHandle")
            .field("target", &self.target)
            .field("result", &self.try_result())
            .finish()
    }
}

impl Future for StateChangeHandle {
    type Output = StateChangeReturn;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.result {
            Some(result) => Poll::Ready(result),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl StateChangeResolver {
    pub fn target(&self) -> GraphState {
        self.target
    }

    pub fn resolve(mut self, result: StateChangeReturn) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(result);
        }
    }
}

impl Drop for StateChangeResolver {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(StateChangeReturn::Failure);
        }
    }
}
