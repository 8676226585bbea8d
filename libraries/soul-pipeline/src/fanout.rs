//! Buffer fan-out to external consumers
//!
//! [`BufferFanout`] hands every decoded frame to each registered
//! [`BufferConsumer`]. Registration is safe from any thread while frames
//! are being delivered on the streaming thread.
//!
//! # Guarantees
//!
//! - A delivery reaches exactly the consumers registered when it started.
//!   A consumer added during a delivery sees frames from the next one.
//! - Once `remove_consumer` returns, the consumer receives nothing more. If
//!   a delivery to it is in flight on another thread, removal waits for that
//!   single callback to return. Removing a consumer from inside its own
//!   callback does not wait.
//! - The registry lock is held only to swap or clone the snapshot, never
//!   across a consumer callback.
//!
//! Consumers are held weakly. A consumer dropped by its owner is skipped and
//! pruned on the next registry change.

use crate::types::{AudioFrame, PipelineId};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Receives decoded audio on the streaming thread
///
/// Implementations must return promptly and must not panic; the streaming
/// thread stalls for as long as a callback runs.
pub trait BufferConsumer: Send + Sync {
    fn consume(&self, pipeline: PipelineId, frame: &AudioFrame);
}

thread_local! {
    /// Slot currently being delivered to on this thread
    static DELIVERING: Cell<*const ConsumerSlot> = const { Cell::new(std::ptr::null()) };
}

struct ConsumerSlot {
    consumer: Weak<dyn BufferConsumer>,
    retired: AtomicBool,
    /// Held for the duration of one callback
    delivery: Mutex<()>,
}

impl ConsumerSlot {
    fn holds(&self, consumer: &Arc<dyn BufferConsumer>) -> bool {
        std::ptr::eq(
            self.consumer.as_ptr().cast::<()>(),
            Arc::as_ptr(consumer).cast::<()>(),
        )
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        let self_ptr: *const ConsumerSlot = self;
        let inside_own_callback = DELIVERING.with(|current| current.get() == self_ptr);
        if !inside_own_callback {
            // Waits out an in-flight callback on the streaming thread
            drop(self.delivery.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn deliver(&self, pipeline: PipelineId, frame: &AudioFrame) -> bool {
        if self.retired.load(Ordering::Acquire) {
            return false;
        }
        let Some(consumer) = self.consumer.upgrade() else {
            return false;
        };
        let _guard = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        if self.retired.load(Ordering::Acquire) {
            return false;
        }

        let self_ptr: *const ConsumerSlot = self;
        let previous = DELIVERING.with(|current| current.replace(self_ptr));
        consumer.consume(pipeline, frame);
        DELIVERING.with(|current| current.set(previous));
        true
    }
}

/// Registry of buffer consumers
pub struct BufferFanout {
    pipeline: PipelineId,
    slots: Mutex<Arc<[Arc<ConsumerSlot>]>>,
}

impl BufferFanout {
    pub fn new(pipeline: PipelineId) -> Self {
        Self {
            pipeline,
            slots: Mutex::new(Arc::from(Vec::new())),
        }
    }

    fn snapshot(&self) -> Arc<[Arc<ConsumerSlot>]> {
        Arc::clone(&self.slots.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Register a consumer; registering it twice is a no-op
    pub fn add_consumer(&self, consumer: &Arc<dyn BufferConsumer>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.iter().any(|slot| slot.holds(consumer)) {
            return;
        }
        let mut next: Vec<Arc<ConsumerSlot>> = slots
            .iter()
            .filter(|slot| slot.consumer.strong_count() > 0)
            .cloned()
            .collect();
        next.push(Arc::new(ConsumerSlot {
            consumer: Arc::downgrade(consumer),
            retired: AtomicBool::new(false),
            delivery: Mutex::new(()),
        }));
        *slots = Arc::from(next);
        tracing::debug!(pipeline = %self.pipeline, consumers = slots.len(), "Consumer added");
    }

    /// Unregister a consumer
    ///
    /// Returns `false` if it was not registered.
    pub fn remove_consumer(&self, consumer: &Arc<dyn BufferConsumer>) -> bool {
        let removed = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let (removed, kept): (Vec<_>, Vec<_>) =
                slots.iter().cloned().partition(|slot| slot.holds(consumer));
            *slots = Arc::from(kept);
            removed
        };
        for slot in &removed {
            slot.retire();
        }
        !removed.is_empty()
    }

    pub fn remove_all_consumers(&self) {
        let removed = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slots, Arc::from(Vec::new()))
        };
        for slot in removed.iter() {
            slot.retire();
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|slot| slot.consumer.strong_count() > 0)
            .count()
    }

    /// Deliver one frame to every registered consumer
    ///
    /// Called on the streaming thread. Returns how many consumers received it.
    pub fn deliver(&self, frame: &AudioFrame) -> usize {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .filter(|slot| slot.deliver(self.pipeline, frame))
            .count()
    }
}

impl std::fmt::Debug for BufferFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFanout")
            .field("pipeline", &self.pipeline)
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameFormat;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        frames: AtomicUsize,
    }

    impl BufferConsumer for Counter {
        fn consume(&self, _pipeline: PipelineId, _frame: &AudioFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0.0; 4], FrameFormat::new(44100, 2), Some(0))
    }

    #[test]
    fn delivers_to_registered_consumers_only() {
        let fanout = BufferFanout::new(PipelineId::next());
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let a_dyn: Arc<dyn BufferConsumer> = a.clone();
        let b_dyn: Arc<dyn BufferConsumer> = b.clone();

        fanout.add_consumer(&a_dyn);
        fanout.add_consumer(&a_dyn);
        assert_eq!(fanout.deliver(&frame()), 1);

        fanout.add_consumer(&b_dyn);
        assert_eq!(fanout.deliver(&frame()), 2);

        assert!(fanout.remove_consumer(&a_dyn));
        assert!(!fanout.remove_consumer(&a_dyn));
        assert_eq!(fanout.deliver(&frame()), 1);

        assert_eq!(a.frames.load(Ordering::SeqCst), 2);
        assert_eq!(b.frames.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_consumers_are_skipped() {
        let fanout = BufferFanout::new(PipelineId::next());
        let consumer: Arc<dyn BufferConsumer> = Arc::new(Counter::default());
        fanout.add_consumer(&consumer);
        drop(consumer);
        assert_eq!(fanout.deliver(&frame()), 0);
        assert_eq!(fanout.consumer_count(), 0);
    }

    struct SelfRemoving {
        fanout: Arc<BufferFanout>,
        me: Mutex<Option<Arc<dyn BufferConsumer>>>,
        frames: AtomicUsize,
    }

    impl BufferConsumer for SelfRemoving {
        fn consume(&self, _pipeline: PipelineId, _frame: &AudioFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = self.me.lock().unwrap().take() {
                self.fanout.remove_consumer(&me);
            }
        }
    }

    #[test]
    fn consumer_can_remove_itself_during_delivery() {
        let fanout = Arc::new(BufferFanout::new(PipelineId::next()));
        let consumer = Arc::new(SelfRemoving {
            fanout: Arc::clone(&fanout),
            me: Mutex::new(None),
            frames: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn BufferConsumer> = consumer.clone();
        *consumer.me.lock().unwrap() = Some(as_dyn.clone());
        fanout.add_consumer(&as_dyn);

        fanout.deliver(&frame());
        fanout.deliver(&frame());
        assert_eq!(consumer.frames.load(Ordering::SeqCst), 1);
    }

    struct Slow {
        entered: Barrier,
        in_callback: AtomicBool,
        after_removal: AtomicUsize,
        removed: AtomicBool,
    }

    impl BufferConsumer for Slow {
        fn consume(&self, _pipeline: PipelineId, _frame: &AudioFrame) {
            if self.removed.load(Ordering::SeqCst) {
                self.after_removal.fetch_add(1, Ordering::SeqCst);
            }
            if !self.in_callback.swap(true, Ordering::SeqCst) {
                self.entered.wait();
                thread::sleep(Duration::from_millis(30));
            }
        }
    }

    #[test]
    fn removal_waits_for_in_flight_delivery() {
        let fanout = Arc::new(BufferFanout::new(PipelineId::next()));
        let slow = Arc::new(Slow {
            entered: Barrier::new(2),
            in_callback: AtomicBool::new(false),
            after_removal: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
        });
        let as_dyn: Arc<dyn BufferConsumer> = slow.clone();
        fanout.add_consumer(&as_dyn);

        let streaming = {
            let fanout = Arc::clone(&fanout);
            thread::spawn(move || {
                for _ in 0..20 {
                    fanout.deliver(&frame());
                }
            })
        };

        slow.entered.wait();
        fanout.remove_consumer(&as_dyn);
        slow.removed.store(true, Ordering::SeqCst);
        streaming.join().unwrap();

        assert_eq!(slow.after_removal.load(Ordering::SeqCst), 0);
    }
}
