//! Bounded delivery queue
//!
//! The buffering primitive every adapter builds on. Producers `write` items
//! from the owning context; the queue hands them to the consumer handler in
//! order while demand is positive and keeps them otherwise. The return value
//! of `write` and the drain handler carry the backpressure signal back to the
//! producer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::streams::{Handler, VoidHandler};

/// Default number of buffered items before `write` reports pressure
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// Demand value meaning "flowing, no limit"
const UNBOUNDED: u64 = u64::MAX;

/// Context-confined FIFO with watermarks and pause / resume / fetch gating
///
/// `write` must be called from the owning context. `pause`, `resume` and
/// `fetch` may be called from anywhere; emission itself always happens on the
/// context, never concurrently.
pub struct InboundQueue<T> {
    context: Context,
    state: Arc<Mutex<QueueState<T>>>,
}

struct QueueState<T> {
    pending: VecDeque<T>,
    high_water_mark: usize,
    demand: u64,
    emitting: bool,
    overflow: bool,
    handler: Option<Handler<T>>,
    drain_handler: Option<VoidHandler>,
    empty_handler: Option<VoidHandler>,
}

impl<T> QueueState<T> {
    fn can_emit(&self) -> bool {
        self.demand > 0 && self.handler.is_some()
    }

    fn check_writable(&mut self) -> bool {
        if self.pending.len() <= self.high_water_mark {
            true
        } else {
            self.overflow = true;
            false
        }
    }

    fn low_water_mark(&self) -> usize {
        self.high_water_mark / 2
    }
}

impl<T> Clone for InboundQueue<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> InboundQueue<T> {
    /// Create a queue with the default high watermark
    pub fn new(context: Context) -> Self {
        Self::with_high_water_mark(context, DEFAULT_HIGH_WATER_MARK)
    }

    /// Create a queue reporting pressure above `high_water_mark` items
    pub fn with_high_water_mark(context: Context, high_water_mark: usize) -> Self {
        Self {
            context,
            state: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                high_water_mark: high_water_mark.max(1),
                demand: UNBOUNDED,
                emitting: false,
                overflow: false,
                handler: None,
                drain_handler: None,
                empty_handler: None,
            })),
        }
    }

    /// The context this queue emits on
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Enqueue an item and emit what current demand allows.
    ///
    /// Returns `false` when the producer should stop until the drain handler
    /// fires.
    pub fn write(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            state.pending.push_back(item);
            if state.emitting || !state.can_emit() {
                return state.check_writable();
            }
            state.emitting = true;
        }
        self.emit_pending()
    }

    /// Enqueue a whole page; returns `false` on pressure
    pub fn write_all<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
    {
        let mut writable = true;
        for item in items {
            writable = self.write(item);
        }
        writable
    }

    /// Set the consumer handler; a handler flushes what is buffered
    pub fn handler(&self, handler: Option<Handler<T>>) {
        let flush = {
            let mut state = self.state.lock();
            state.handler = handler;
            state.can_emit() && !state.pending.is_empty()
        };
        if flush {
            self.schedule_drain();
        }
    }

    /// Called once a full queue falls back to its low watermark
    pub fn drain_handler(&self, handler: Option<VoidHandler>) {
        self.state.lock().drain_handler = handler;
    }

    /// Called whenever a drain leaves the queue empty
    pub fn empty_handler(&self, handler: Option<VoidHandler>) {
        self.state.lock().empty_handler = handler;
    }

    /// Stop emission until `resume` or `fetch`
    pub fn pause(&self) {
        self.state.lock().demand = 0;
    }

    /// Emit without limit
    pub fn resume(&self) {
        self.fetch(UNBOUNDED);
    }

    /// Allow `amount` more items to be emitted
    pub fn fetch(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            state.demand = state.demand.saturating_add(amount);
        }
        self.schedule_drain();
    }

    /// Whether emission is currently gated
    pub fn is_paused(&self) -> bool {
        self.state.lock().demand == 0
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Whether a producer may keep writing
    pub fn is_writable(&self) -> bool {
        let state = self.state.lock();
        state.pending.len() <= state.high_water_mark
    }

    /// Drop every buffered item and all callbacks
    pub fn clear(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.handler = None;
            state.drain_handler = None;
            state.empty_handler = None;
            state.overflow = false;
            std::mem::take(&mut state.pending)
        };
        drop(dropped);
    }

    fn schedule_drain(&self) {
        let queue = self.clone();
        self.context.dispatch(move || queue.drain());
    }

    /// Emit while demand allows, then fire drain / empty callbacks
    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.emitting {
                return;
            }
            state.emitting = true;
        }
        self.emit_pending();

        let (drain, empty) = {
            let mut state = self.state.lock();
            let drain = if state.overflow && state.pending.len() <= state.low_water_mark() {
                state.overflow = false;
                state.drain_handler.clone()
            } else {
                None
            };
            let empty = if state.pending.is_empty() {
                state.empty_handler.clone()
            } else {
                None
            };
            (drain, empty)
        };
        if let Some(drain) = drain {
            drain();
        }
        if let Some(empty) = empty {
            empty();
        }
    }

    /// Caller must have set `emitting`; clears it before returning
    fn emit_pending(&self) -> bool {
        loop {
            let (handler, item) = {
                let mut state = self.state.lock();
                let handler = match state.handler.clone() {
                    Some(handler) if state.demand > 0 => handler,
                    _ => {
                        state.emitting = false;
                        return state.check_writable();
                    }
                };
                let Some(item) = state.pending.pop_front() else {
                    state.emitting = false;
                    return true;
                };
                if state.demand != UNBOUNDED {
                    state.demand -= 1;
                }
                (handler, item)
            };
            handler(item);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{handler, void_handler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Option<Handler<u32>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        (seen, handler(move |n| s.lock().push(n)))
    }

    #[tokio::test]
    async fn test_flowing_queue_delivers_in_order() {
        let ctx = Context::new();
        let queue = InboundQueue::new(ctx.clone());
        let (seen, h) = recorder();
        queue.handler(h);

        let q = queue.clone();
        let writable = ctx.call(move || q.write_all(0..100)).await.unwrap();

        assert!(writable);
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_no_handler_buffers_until_attached() {
        let ctx = Context::new();
        let queue = InboundQueue::new(ctx.clone());

        let q = queue.clone();
        ctx.call(move || q.write_all(0..5)).await.unwrap();
        assert_eq!(queue.len(), 5);

        let (seen, h) = recorder();
        queue.handler(h);
        ctx.call(|| ()).await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_paused_queue_delivers_nothing_and_signals_pressure() {
        let ctx = Context::new();
        let queue = InboundQueue::with_high_water_mark(ctx.clone(), 4);
        let (seen, h) = recorder();
        queue.handler(h);
        queue.pause();

        let q = queue.clone();
        let results = ctx
            .call(move || (0..6).map(|n| q.write(n)).collect::<Vec<_>>())
            .await
            .unwrap();

        assert!(seen.lock().is_empty());
        assert_eq!(results, vec![true, true, true, true, false, false]);
        assert!(!queue.is_writable());
    }

    #[tokio::test]
    async fn test_fetch_delivers_at_most_n() {
        let ctx = Context::new();
        let queue = InboundQueue::new(ctx.clone());
        let (seen, h) = recorder();
        queue.handler(h);
        queue.pause();

        let q = queue.clone();
        ctx.call(move || q.write_all(0..10)).await.unwrap();

        queue.fetch(3);
        ctx.call(|| ()).await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert!(queue.is_paused());

        queue.fetch(0);
        ctx.call(|| ()).await.unwrap();
        assert_eq!(seen.lock().len(), 3);

        queue.resume();
        ctx.call(|| ()).await.unwrap();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_drain_handler_fires_once_per_overflow() {
        let ctx = Context::new();
        let queue = InboundQueue::with_high_water_mark(ctx.clone(), 2);
        let (_seen, h) = recorder();
        queue.handler(h);
        queue.pause();

        let drains = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&drains);
        queue.drain_handler(void_handler(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        let q = queue.clone();
        assert!(!ctx.call(move || q.write_all(0..5)).await.unwrap());

        // Still above the low watermark: no drain yet
        queue.fetch(2);
        ctx.call(|| ()).await.unwrap();
        assert_eq!(drains.load(Ordering::SeqCst), 0);

        queue.fetch(2);
        ctx.call(|| ()).await.unwrap();
        assert_eq!(drains.load(Ordering::SeqCst), 1);

        queue.resume();
        ctx.call(|| ()).await.unwrap();
        assert_eq!(drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_from_handler_stops_emission() {
        let ctx = Context::new();
        let queue: InboundQueue<u32> = InboundQueue::new(ctx.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let q = queue.clone();
        queue.handler(handler(move |n| {
            s.lock().push(n);
            if n == 2 {
                q.pause();
            }
        }));

        let q = queue.clone();
        ctx.call(move || q.write_all(0..6)).await.unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(queue.len(), 3);

        let empties = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&empties);
        queue.empty_handler(void_handler(move || {
            e.fetch_add(1, Ordering::SeqCst);
        }));
        queue.resume();
        ctx.call(|| ()).await.unwrap();
        assert_eq!(*seen.lock(), (0..6).collect::<Vec<_>>());
        assert_eq!(empties.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_drops_items_and_handlers() {
        let ctx = Context::new();
        let queue = InboundQueue::new(ctx.clone());
        let (seen, h) = recorder();
        queue.pause();
        queue.handler(h);

        let q = queue.clone();
        ctx.call(move || q.write_all(0..3)).await.unwrap();
        queue.clear();
        queue.resume();
        ctx.call(|| ()).await.unwrap();

        assert!(seen.lock().is_empty());
        assert!(queue.is_empty());
    }
}
