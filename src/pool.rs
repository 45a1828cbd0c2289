//! A pool spawning one worker thread per submitted task.
//!
//! Used for the per-socket workers, event loop threads and hostname lookup.

use std::fmt;
use std::thread::{self, JoinHandle};

/// Spawns tasks, each on its own worker thread.
#[derive(Clone, Debug, Default)]
pub struct ThreadPool {
    _priv: (),
}

impl ThreadPool {
    /// Creates a pool.
    pub fn new() -> ThreadPool {
        ThreadPool::default()
    }

    /// Runs `f` on a new worker thread.
    pub fn spawn<F>(&self, f: F) -> AsyncTask
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("evnet-worker".to_owned())
            .spawn(f)
            .expect("failed to spawn worker thread");
        AsyncTask {
            handle: Some(handle),
        }
    }
}

/// Handle to a spawned task. Joins the worker on drop unless detached.
pub struct AsyncTask {
    handle: Option<JoinHandle<()>>,
}

impl AsyncTask {
    /// Lets the worker run to completion on its own; the handle no longer
    /// joins on drop.
    pub fn detach(&mut self) {
        self.handle = None;
    }

    /// Whether the task has not been detached or joined yet.
    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for AsyncTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // A worker dropping the handle to itself must not self-join.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("attached", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadPool;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn join_on_drop() {
        let pool = ThreadPool::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let task = pool.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            flag.store(true, Ordering::SeqCst);
        });
        drop(task);
        assert!(done.load(Ordering::SeqCst));
    }
}
