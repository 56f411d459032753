//! Fixed-size pool of event loops with round-robin assignment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crate::error::{NetError, Result};
use crate::runtime::event_loop::EventLoop;

/// Round-robin selector over a fixed set of loops.
///
/// Cloned into listener and acceptor tasks so they can hand new connections
/// to the next loop without going back through the pool.
#[derive(Clone, Debug)]
pub struct LoopSelector {
    loops: Arc<Vec<EventLoop>>,
    cursor: Arc<AtomicUsize>,
}

impl LoopSelector {
    fn new(loops: Vec<EventLoop>) -> Self {
        Self {
            loops: Arc::new(loops),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Next loop in rotation.
    pub fn next(&self) -> Option<EventLoop> {
        if self.loops.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Some(self.loops[index].clone())
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    fn stop_all(&self) {
        for event_loop in self.loops.iter() {
            event_loop.stop();
        }
    }
}

/// Owner of `n` event-loop threads.
///
/// `exit` stops the loops without joining; threads are joined by
/// `run(true)` or when the pool is dropped.
#[derive(Default)]
pub struct EventLoopPool {
    selector: RwLock<Option<LoopSelector>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl EventLoopPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `thread_count` loops.
    pub fn init(&self, thread_count: usize) -> Result<()> {
        if thread_count == 0 {
            return Err(NetError::config("thread count must be greater than zero"));
        }

        let mut selector = self.selector.write().unwrap_or_else(PoisonError::into_inner);
        if selector.is_some() {
            return Err(NetError::AlreadyInitialized);
        }

        let mut loops = Vec::with_capacity(thread_count);
        let mut threads = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            match EventLoop::start(index) {
                Ok((event_loop, thread)) => {
                    loops.push(event_loop);
                    threads.push(thread);
                }
                Err(e) => {
                    tracing::error!(loop_index = index, error = %e, "Failed to start event loop");
                    for event_loop in &loops {
                        event_loop.stop();
                    }
                    self.lock_threads().extend(threads);
                    return Err(NetError::Io(e));
                }
            }
        }

        self.lock_threads().extend(threads);
        *selector = Some(LoopSelector::new(loops));
        tracing::info!(thread_count, "Event loop pool started");
        Ok(())
    }

    /// Next loop in round-robin order, `None` before `init`.
    pub fn get(&self) -> Option<EventLoop> {
        self.selector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(LoopSelector::next)
    }

    /// Shareable selector over the current loops.
    pub fn selector(&self) -> Option<LoopSelector> {
        self.selector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn size(&self) -> usize {
        self.selector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, LoopSelector::len)
    }

    /// Stop every loop. Pending work on the loops is dropped.
    pub fn exit(&self) {
        let selector = self
            .selector
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(selector) = selector {
            selector.stop_all();
            tracing::info!(thread_count = selector.len(), "Event loop pool stopped");
        }
    }

    /// Join the loop threads when `blocking` is true.
    ///
    /// A loop thread calling this skips joining itself.
    pub fn run(&self, blocking: bool) {
        if !blocking {
            return;
        }
        let threads = std::mem::take(&mut *self.lock_threads());
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                tracing::error!("Event loop thread panicked");
            }
        }
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventLoopPool {
    fn drop(&mut self) {
        self.exit();
        self.run(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_zero_and_double_init() {
        let pool = EventLoopPool::new();
        assert!(matches!(pool.init(0), Err(NetError::Config { .. })));
        assert_eq!(pool.size(), 0);

        pool.init(2).unwrap();
        assert!(matches!(pool.init(2), Err(NetError::AlreadyInitialized)));
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn get_rotates_through_every_loop() {
        let pool = EventLoopPool::new();
        assert!(pool.get().is_none());
        pool.init(3).unwrap();

        let first: Vec<EventLoop> = (0..3).map(|_| pool.get().unwrap()).collect();
        assert_ne!(first[0], first[1]);
        assert_ne!(first[1], first[2]);
        assert_ne!(first[0], first[2]);
        assert_eq!(pool.get().unwrap(), first[0]);
    }

    #[test]
    fn exit_stops_loops_and_allows_reinit() {
        let pool = EventLoopPool::new();
        pool.init(2).unwrap();
        let event_loop = pool.get().unwrap();

        pool.exit();
        pool.exit();
        assert!(event_loop.is_stopped());
        assert_eq!(pool.size(), 0);
        pool.run(true);

        pool.init(1).unwrap();
        assert_eq!(pool.size(), 1);
    }
}
