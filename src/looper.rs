//! Serializing executor for session work (the "notification thread").
//!
//! All session state changes and embedder notifications run on a single
//! thread that drains posted jobs in FIFO order. Collaborators never
//! mutate session state directly; they post closures here instead.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named worker thread executing posted closures in posting order.
///
/// Dropping the looper (or calling [`LooperThread::stop`]) closes the
/// queue; jobs already posted still run before the thread exits.
pub struct LooperThread {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LooperThread {
    /// Spawn the looper thread.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                debug!(looper = %thread_name, "Looper queue closed, thread exiting");
            })
            .expect("failed to spawn looper thread");

        Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Post a job onto the looper.
    ///
    /// Jobs posted after `stop()` are dropped.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let tx = self.tx.lock().expect("looper sender lock poisoned");
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    warn!(looper = %self.name, "Posted job dropped, looper thread gone");
                }
            }
            None => {
                debug!(looper = %self.name, "Posted job dropped, looper stopped");
            }
        }
    }

    /// Close the queue and join the thread.
    ///
    /// Previously posted jobs run to completion first.
    pub fn stop(&self) {
        self.tx.lock().expect("looper sender lock poisoned").take();
        let handle = self.handle.lock().expect("looper handle lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// The looper's thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LooperThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LooperThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LooperThread").field("name", &self.name).finish()
    }
}
