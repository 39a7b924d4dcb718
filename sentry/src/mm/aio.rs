//! Asynchronous I/O contexts.
//!
//! Each context is one page of application-visible memory (the ring) plus
//! sentry-side bookkeeping: a cap on outstanding requests, a queue of
//! completions, and a notification channel that is closed exactly once,
//! when the context is dead and fully drained.

use super::{MemoryFile, SpecialMappable};
use crate::usage::MemoryKind;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// Size of the ring mapping backing a context. One zeroed page: the ring
/// header stays zero so user libraries never mistake it for a kernel-
/// managed ring and try to reap completions from it directly.
pub const AIO_RING_SIZE: u64 = crate::arch::PAGE_SIZE;

/// Outcome of a Prepare call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PrepareError {
    /// The context is at capacity.
    Again,
    /// The context died after the caller looked it up.
    Invalid,
}

/// A close-once notification channel, the wait half of request
/// completion.
pub struct NotifyChannel {
    state: Mutex<NotifyState>,
    cond: Condvar,
}

#[derive(Default)]
struct NotifyState {
    pending: u64,
    closed: bool,
}

impl NotifyChannel {
    fn new() -> Arc<NotifyChannel> {
        Arc::new(NotifyChannel {
            state: Mutex::new(NotifyState::default()),
            cond: Condvar::new(),
        })
    }

    fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending += 1;
        self.cond.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.closed, "notification channel closed twice");
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Blocks until a notification arrives or the channel closes.
    /// Returns false when the channel is closed and drained.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.pending > 0 {
                state.pending -= 1;
                return true;
            }
            if state.closed {
                return false;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Like wait, with a timeout. None means timed out.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.pending > 0 {
                state.pending -= 1;
                return Some(true);
            }
            if state.closed {
                return Some(false);
            }
            let (guard, result) = self.cond.wait_timeout(state, timeout).unwrap();
            state = guard;
            if result.timed_out() {
                return None;
            }
        }
    }
}

struct AioState {
    results: VecDeque<u64>,
    outstanding: u32,
    dead: bool,
    /// None once closed; WaitChannel then reports the context drained.
    request_ready: Option<Arc<NotifyChannel>>,
}

/// A single asynchronous I/O context.
pub struct AioContext {
    max_outstanding: u32,
    state: Mutex<AioState>,
}

impl AioContext {
    fn new(events: u32) -> Arc<AioContext> {
        Arc::new(AioContext {
            max_outstanding: events,
            state: Mutex::new(AioState {
                results: VecDeque::new(),
                outstanding: 0,
                dead: false,
                request_ready: Some(NotifyChannel::new()),
            }),
        })
    }

    /// Reserves one outstanding slot.
    pub fn prepare(&self) -> Result<(), PrepareError> {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return Err(PrepareError::Invalid);
        }
        if state.outstanding >= self.max_outstanding {
            return Err(PrepareError::Again);
        }
        state.outstanding += 1;
        Ok(())
    }

    /// Queues a completed request's data and notifies one waiter. The
    /// channel is guaranteed open here: outstanding is non-zero until the
    /// result is popped, and the channel only closes at zero.
    pub fn finish_request(&self, data: u64) {
        let state = self.state.lock().unwrap();
        assert!(
            state.outstanding > 0,
            "finish_request without a prepared slot"
        );
        let channel = state
            .request_ready
            .as_ref()
            .expect("channel closed with requests outstanding")
            .clone();
        let mut state = state;
        state.results.push_back(data);
        drop(state);
        channel.notify();
    }

    /// Pops a completed request without blocking.
    pub fn pop_request(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        let data = state.results.pop_front()?;
        if state.outstanding == 0 {
            panic!("AioContext outstanding is going negative");
        }
        state.outstanding -= 1;
        Self::check_for_done(&mut state);
        Some(data)
    }

    /// The notification channel, or None once the context is dead and
    /// drained.
    pub fn wait_channel(&self) -> Option<Arc<NotifyChannel>> {
        self.state.lock().unwrap().request_ready.clone()
    }

    pub fn dead(&self) -> bool {
        self.state.lock().unwrap().dead
    }

    /// Forgets a request that hasn't completed, undoing its Prepare.
    pub fn cancel_pending_request(&self) {
        let mut state = self.state.lock().unwrap();
        if state.outstanding == 0 {
            panic!("AioContext outstanding is going negative");
        }
        state.outstanding -= 1;
        Self::check_for_done(&mut state);
    }

    /// Drops all completed requests; pending requests are untouched.
    pub fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        if state.outstanding == 0 {
            return;
        }
        let completed = state.results.len() as u32;
        if state.outstanding < completed {
            panic!("AioContext outstanding is going negative");
        }
        state.outstanding -= completed;
        state.results.clear();
        Self::check_for_done(&mut state);
    }

    fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        state.dead = true;
        Self::check_for_done(&mut state);
    }

    fn check_for_done(state: &mut AioState) {
        if state.dead && state.outstanding == 0 {
            if let Some(channel) = state.request_ready.take() {
                channel.close();
            }
        }
    }
}

/// Creates and manages the AIO contexts of one address space, keyed by
/// the ring's user address.
#[derive(Default)]
pub struct AioManager {
    contexts: Mutex<HashMap<u64, Arc<AioContext>>>,
}

impl AioManager {
    /// Registers a context at `id`. False if the id is in use.
    pub fn new_context(&self, events: u32, id: u64) -> bool {
        let mut contexts = self.contexts.lock().unwrap();
        if contexts.contains_key(&id) {
            return false;
        }
        contexts.insert(id, AioContext::new(events));
        true
    }

    /// Destroys the context at `id`, returning it so the caller can
    /// drain stragglers. None if it does not exist.
    pub fn destroy_context(&self, id: u64) -> Option<Arc<AioContext>> {
        let mut contexts = self.contexts.lock().unwrap();
        let ctx = contexts.remove(&id)?;
        ctx.destroy();
        Some(ctx)
    }

    pub fn lookup_context(&self, id: u64) -> Option<Arc<AioContext>> {
        self.contexts.lock().unwrap().get(&id).cloned()
    }

    /// Moves a live context to a new ring address (mremap of the ring).
    pub fn remap_context(&self, old_id: u64, new_id: u64) -> bool {
        let mut contexts = self.contexts.lock().unwrap();
        match contexts.get(&old_id) {
            Some(ctx) if !ctx.dead() => {}
            _ => return false,
        }
        let ctx = contexts.remove(&old_id).unwrap();
        contexts.insert(new_id, ctx);
        true
    }

    pub fn ids(&self) -> Vec<u64> {
        self.contexts.lock().unwrap().keys().copied().collect()
    }

    /// Destroys every context; address-space teardown.
    pub fn destroy_all(&self) -> Vec<Arc<AioContext>> {
        let mut contexts = self.contexts.lock().unwrap();
        let all: Vec<Arc<AioContext>> = contexts.values().cloned().collect();
        contexts.clear();
        for ctx in &all {
            ctx.destroy();
        }
        all
    }
}

/// Allocates the one-page ring mapping for a new context.
pub fn new_ring_mappable(mf: Arc<MemoryFile>) -> Result<Arc<SpecialMappable>, super::MemoryError> {
    SpecialMappable::new(mf, AIO_RING_SIZE, MemoryKind::Anonymous, "[aio]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_enforced() {
        let ctx = AioContext::new(8);
        for _ in 0..8 {
            ctx.prepare().unwrap();
        }
        assert_eq!(ctx.prepare(), Err(PrepareError::Again));
        ctx.finish_request(1);
        assert_eq!(ctx.pop_request(), Some(1));
        ctx.prepare().unwrap();
    }

    #[test]
    fn dead_context_rejects_prepare() {
        let ctx = AioContext::new(8);
        ctx.destroy();
        assert_eq!(ctx.prepare(), Err(PrepareError::Invalid));
    }

    #[test]
    fn outstanding_accounting() {
        let ctx = AioContext::new(4);
        ctx.prepare().unwrap();
        ctx.prepare().unwrap();
        ctx.prepare().unwrap();
        ctx.finish_request(10);
        ctx.finish_request(11);
        assert_eq!(ctx.pop_request(), Some(10));
        ctx.cancel_pending_request();
        assert_eq!(ctx.pop_request(), Some(11));
        assert_eq!(ctx.pop_request(), None);
    }

    #[test]
    fn channel_closes_exactly_once_when_drained() {
        let ctx = AioContext::new(8);
        for _ in 0..7 {
            ctx.prepare().unwrap();
        }
        ctx.destroy();
        // Still 7 outstanding: the channel stays open for stragglers.
        let channel = ctx.wait_channel().expect("channel should remain open");
        assert!(!channel.is_closed());

        for i in 0..7 {
            ctx.finish_request(i);
        }
        ctx.drain();
        assert!(channel.is_closed());
        assert!(ctx.wait_channel().is_none());
        assert!(!channel.wait());
    }

    #[test]
    fn waiter_woken_by_completion() {
        let ctx = AioContext::new(1);
        ctx.prepare().unwrap();
        let channel = ctx.wait_channel().unwrap();
        let waiter = std::thread::spawn({
            let channel = Arc::clone(&channel);
            move || channel.wait()
        });
        ctx.finish_request(42);
        assert!(waiter.join().unwrap());
        assert_eq!(ctx.pop_request(), Some(42));
    }

    #[test]
    #[should_panic(expected = "outstanding is going negative")]
    fn cancel_without_prepare_panics() {
        let ctx = AioContext::new(1);
        ctx.cancel_pending_request();
    }

    #[test]
    fn manager_id_reuse_and_remap() {
        let manager = AioManager::default();
        assert!(manager.new_context(8, 0x1000));
        assert!(!manager.new_context(8, 0x1000));
        assert!(manager.remap_context(0x1000, 0x2000));
        assert!(manager.lookup_context(0x1000).is_none());
        assert!(manager.lookup_context(0x2000).is_some());

        let ctx = manager.destroy_context(0x2000).unwrap();
        assert!(ctx.dead());
        assert!(manager.destroy_context(0x2000).is_none());
        // A dead context cannot be remapped.
        assert!(!manager.remap_context(0x2000, 0x3000));
    }
}
