//! A single event loop: one OS thread driving one single-threaded runtime.
//!
//! # Responsibilities
//! - Own the reactor that every socket assigned to this loop is registered with
//! - Accept work posted from any thread and run it on the loop thread
//! - Stop on request, dropping whatever work is still queued

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use tokio::runtime::{Builder, EnterGuard, Handle};
use tokio::sync::watch;
use tokio::task;

/// Cloneable handle to a running event loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

struct Inner {
    index: usize,
    handle: Handle,
    thread_id: ThreadId,
    stop_tx: watch::Sender<bool>,
}

impl EventLoop {
    /// Build the runtime and start the thread that drives it.
    pub(crate) fn start(index: usize) -> io::Result<(Self, JoinHandle<()>)> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let thread = thread::Builder::new()
            .name(format!("netloom-loop-{index}"))
            .spawn(move || {
                tracing::debug!(loop_index = index, "Event loop running");
                runtime.block_on(async {
                    let _ = stop_rx.wait_for(|stopped| *stopped).await;
                });
                // Queued and in-flight tasks are dropped here, on the loop thread.
                runtime.shutdown_background();
                tracing::debug!(loop_index = index, "Event loop stopped");
            })?;

        let event_loop = Self {
            inner: Arc::new(Inner {
                index,
                handle,
                thread_id: thread.thread().id(),
                stop_tx,
            }),
        };
        Ok((event_loop, thread))
    }

    /// Position of this loop inside its pool.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Run a future on the loop thread.
    pub fn spawn<F>(&self, future: F) -> task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Run a closure on the loop thread.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handle.spawn(async move { f() });
    }

    /// Enter the loop's runtime context from the current thread, so sockets
    /// converted from std types register with this loop's reactor.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.inner.handle.enter()
    }

    /// True when called from this loop's own thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    pub fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("index", &self.inner.index)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventLoop {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn posted_work_runs_on_loop_thread() {
        let (event_loop, thread) = EventLoop::start(0).unwrap();
        let (tx, rx) = mpsc::channel();
        let checked = event_loop.clone();
        event_loop.post(move || {
            tx.send(checked.is_current()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!event_loop.is_current());

        event_loop.stop();
        thread.join().unwrap();
        assert!(event_loop.is_stopped());
    }

    #[test]
    fn stop_drops_pending_work() {
        let (event_loop, thread) = EventLoop::start(1).unwrap();
        event_loop.stop();
        thread.join().unwrap();

        let (tx, rx) = mpsc::channel::<()>();
        event_loop.post(move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
