//! Per-transport outbound batching
//!
//! Items are appended to a front buffer from any thread. The first enqueue of a
//! burst opens a merge window; when it closes the front buffer is swapped into the
//! back buffer and the flush callback is handed the queue. The callback drains the
//! back buffer (possibly later, from another thread) and calls `signal_flushed`,
//! which reopens the cycle if more items arrived meanwhile.
//!
//! Overflowing the front buffer is fatal to the owning connection: a peer that
//! cannot drain `max_size` items is treated as unable to keep up.

use crate::error::{NetError, Result};
use crate::Packet;
use log::{trace, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Invoked with the queue once a batch is ready in the back buffer
pub type FlushCallback = Arc<dyn Fn(&Arc<SendQueue>) -> Result<()> + Send + Sync>;
/// Invoked once when the queue fails; used to take the owning connection down
pub type FatalCallback = Box<dyn Fn(&NetError) + Send + Sync>;

#[derive(Default)]
struct QueueState {
    front: VecDeque<Packet>,
    back: VecDeque<Packet>,
    /// A flush cycle is open: merge window running or batch in flight
    merging: bool,
    /// The pending timer must move the front buffer into the back buffer
    swap_pending: bool,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

pub struct SendQueue {
    label: &'static str,
    max_size: usize,
    merge_window: Duration,
    runtime: Handle,
    state: Mutex<QueueState>,
    on_flush: FlushCallback,
    on_fatal: FatalCallback,
}

impl SendQueue {
    pub fn new(
        label: &'static str,
        max_size: usize,
        merge_window: Duration,
        runtime: Handle,
        on_flush: FlushCallback,
        on_fatal: FatalCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            label,
            max_size,
            merge_window,
            runtime,
            state: Mutex::new(QueueState::default()),
            on_flush,
            on_fatal,
        })
    }

    /// Appends an item and makes sure a flush is scheduled
    pub fn enqueue(self: &Arc<Self>, packet: Packet) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(NetError::QueueDisposed);
            }
            if state.front.len() >= self.max_size {
                let err = NetError::QueueOverflow {
                    size: state.front.len(),
                    max: self.max_size,
                };
                drop(state);
                warn!("{} send queue overflow: {}", self.label, err);
                self.fail(&err);
                return Err(err);
            }
            state.front.push_back(packet);
        }
        self.flush();
        Ok(())
    }

    /// Opens a merge window unless one is already open
    pub fn flush(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.disposed || state.merging {
            return;
        }
        state.merging = true;
        state.swap_pending = true;
        self.arm_timer(&mut state, self.merge_window);
    }

    /// Postpones the in-flight batch by `delay`, optionally dropping its unreliable items
    pub fn delay_flush(self: &Arc<Self>, delay: Duration, drop_unreliable: bool) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        if drop_unreliable {
            state.back.retain(|packet| !packet.is_unreliable());
        }
        state.swap_pending = false;
        self.arm_timer(&mut state, delay);
    }

    /// Closes the current flush cycle; starts the next one if items are waiting
    pub fn signal_flushed(self: &Arc<Self>) {
        let more = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.back.clear();
            state.merging = false;
            !state.front.is_empty()
        };
        if more {
            self.flush();
        }
    }

    /// Drains the batch handed to the flush callback, in insertion order
    pub fn take_batch(&self) -> Vec<Packet> {
        self.state.lock().back.drain(..).collect()
    }

    /// Items handed to the flush callback and not yet taken
    pub fn in_flight(&self) -> usize {
        self.state.lock().back.len()
    }

    /// Discards every queued unreliable item, in flight or not
    pub fn drop_unreliable(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.front.len() + state.back.len();
        state.front.retain(|packet| !packet.is_unreliable());
        state.back.retain(|packet| !packet.is_unreliable());
        before - state.front.len() - state.back.len()
    }

    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.merging = false;
        state.swap_pending = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.front.clear();
        state.back.clear();
        trace!("{} send queue disposed", self.label);
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// True while a merge window is open or a batch is in flight
    pub fn is_flushing(&self) -> bool {
        self.state.lock().merging
    }

    pub fn has_pending_timer(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.front.len() + state.back.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn arm_timer(self: &Arc<Self>, state: &mut QueueState, delay: Duration) {
        if let Some(old) = state.timer.take() {
            old.abort();
        }
        let queue = Arc::downgrade(self);
        state.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.on_timer();
            }
        }));
    }

    fn on_timer(self: &Arc<Self>) {
        let ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.disposed {
                return;
            }
            state.timer = None;
            if state.swap_pending {
                state.swap_pending = false;
                if state.back.is_empty() {
                    std::mem::swap(&mut state.front, &mut state.back);
                } else {
                    let front = std::mem::take(&mut state.front);
                    state.back.extend(front);
                }
            }
            !state.back.is_empty()
        };

        if !ready {
            self.signal_flushed();
            return;
        }

        if let Err(err) = (self.on_flush)(self) {
            warn!("{} flush failed: {}", self.label, err);
            self.fail(&err);
        }
    }

    fn fail(&self, err: &NetError) {
        self.dispose();
        (self.on_fatal)(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataItem;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Batches = Arc<Mutex<Vec<Vec<Packet>>>>;

    struct Harness {
        queue: Arc<SendQueue>,
        batches: Batches,
        fatal: Arc<AtomicUsize>,
    }

    fn harness(max_size: usize, window: Duration) -> Harness {
        let batches: Batches = Arc::new(Mutex::new(Vec::new()));
        let fatal = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&batches);
        let fatal_count = Arc::clone(&fatal);
        let queue = SendQueue::new(
            "test",
            max_size,
            window,
            Handle::current(),
            Arc::new(move |queue: &Arc<SendQueue>| -> Result<()> {
                recorded.lock().push(queue.take_batch());
                queue.signal_flushed();
                Ok(())
            }),
            Box::new(move |_| {
                fatal_count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Harness {
            queue,
            batches,
            fatal,
        }
    }

    fn item(n: u8) -> Packet {
        Packet::Data(DataItem::reliable(0, vec![n]))
    }

    fn update(n: u8) -> Packet {
        Packet::Data(DataItem::update(0, vec![n]))
    }

    #[tokio::test]
    async fn test_burst_is_flushed_once_in_order() {
        let h = harness(3, Duration::from_millis(20));
        h.queue.enqueue(item(1)).unwrap();
        h.queue.enqueue(item(2)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = h.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![item(1), item(2)]);
        assert_eq!(h.fatal.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overflow_disposes_without_flushing() {
        let h = harness(3, Duration::from_millis(30));
        for n in 1..=3 {
            h.queue.enqueue(item(n)).unwrap();
        }
        let err = h.queue.enqueue(item(4)).unwrap_err();
        assert!(matches!(err, NetError::QueueOverflow { size: 3, max: 3 }));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.fatal.load(Ordering::SeqCst), 1);
        assert!(h.queue.is_disposed());
        assert!(h.batches.lock().is_empty());
        assert!(matches!(
            h.queue.enqueue(item(5)),
            Err(NetError::QueueDisposed)
        ));
    }

    #[tokio::test]
    async fn test_nothing_enqueued_means_no_flush() {
        let h = harness(3, Duration::from_millis(5));
        h.queue.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.batches.lock().is_empty());
        assert!(!h.queue.is_flushing());
    }

    #[tokio::test]
    async fn test_items_during_flight_trigger_follow_up() {
        let batches: Batches = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&batches);
        let queue = SendQueue::new(
            "test",
            16,
            Duration::from_millis(5),
            Handle::current(),
            Arc::new(move |queue: &Arc<SendQueue>| -> Result<()> {
                let batch = queue.take_batch();
                let first_cycle = recorded.lock().is_empty();
                recorded.lock().push(batch);
                if first_cycle {
                    // arrives after the cutoff of the in-flight batch
                    queue.enqueue(item(9))?;
                }
                queue.signal_flushed();
                Ok(())
            }),
            Box::new(|_| {}),
        );

        queue.enqueue(item(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![item(1)]);
        assert_eq!(batches[1], vec![item(9)]);
    }

    #[tokio::test]
    async fn test_delay_flush_drops_unreliable_items() {
        let batches: Batches = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&batches);
        let counter = Arc::clone(&calls);
        let queue = SendQueue::new(
            "test",
            16,
            Duration::from_millis(5),
            Handle::current(),
            Arc::new(move |queue: &Arc<SendQueue>| -> Result<()> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    queue.delay_flush(Duration::from_millis(5), true);
                    return Ok(());
                }
                recorded.lock().push(queue.take_batch());
                queue.signal_flushed();
                Ok(())
            }),
            Box::new(|_| {}),
        );

        queue.enqueue(update(1)).unwrap();
        queue.enqueue(item(2)).unwrap();
        queue.enqueue(update(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*batches.lock(), vec![vec![item(2)]]);
    }

    #[tokio::test]
    async fn test_delay_flush_of_only_unreliable_closes_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let queue = SendQueue::new(
            "test",
            16,
            Duration::from_millis(5),
            Handle::current(),
            Arc::new(move |queue: &Arc<SendQueue>| -> Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                queue.delay_flush(Duration::ZERO, true);
                Ok(())
            }),
            Box::new(|_| {}),
        );

        queue.enqueue(update(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!queue.is_flushing());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failing_callback_is_fatal() {
        let fatal = Arc::new(AtomicUsize::new(0));
        let fatal_count = Arc::clone(&fatal);
        let queue = SendQueue::new(
            "test",
            16,
            Duration::from_millis(5),
            Handle::current(),
            Arc::new(|_: &Arc<SendQueue>| -> Result<()> {
                Err(NetError::WorkerFailed("socket gone".into()))
            }),
            Box::new(move |_| {
                fatal_count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        queue.enqueue(item(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fatal.load(Ordering::SeqCst), 1);
        assert!(queue.is_disposed());
    }

    #[tokio::test]
    async fn test_dispose_cancels_timer() {
        let h = harness(8, Duration::from_millis(30));
        h.queue.enqueue(item(1)).unwrap();
        assert!(h.queue.has_pending_timer());

        h.queue.dispose();
        h.queue.dispose();
        assert!(!h.queue.has_pending_timer());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(h.batches.lock().is_empty());
        assert_eq!(h.fatal.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_unreliable_counts_removed_items() {
        let h = harness(8, Duration::from_secs(5));
        h.queue.enqueue(update(1)).unwrap();
        h.queue.enqueue(item(2)).unwrap();
        h.queue.enqueue(update(3)).unwrap();

        assert_eq!(h.queue.drop_unreliable(), 2);
        assert_eq!(h.queue.len(), 1);
        h.queue.dispose();
    }
}
