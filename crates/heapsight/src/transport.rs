//! The channel between the client and a worker: string frames out, string
//! frames back.

use heapsight_worker::WorkerThread;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::RpcError;

pub trait WorkerTransport: Send + Sync {
    fn post_message(&self, frame: String) -> Result<(), RpcError>;

    /// Stops the worker. Frames posted afterwards fail.
    fn terminate(&self);
}

/// A worker running on its own OS thread.
pub struct ThreadWorker {
    thread: Mutex<WorkerThread>,
}

impl ThreadWorker {
    /// Spawns the thread. Frames the worker posts arrive on the returned
    /// receiver.
    pub fn spawn(name: &str) -> Result<(Self, mpsc::UnboundedReceiver<String>), RpcError> {
        let (frames, received) = mpsc::unbounded_channel();
        let thread = WorkerThread::spawn(name, move |frame| {
            let _ = frames.send(frame);
        })
        .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok((
            Self {
                thread: Mutex::new(thread),
            },
            received,
        ))
    }
}

impl WorkerTransport for ThreadWorker {
    fn post_message(&self, frame: String) -> Result<(), RpcError> {
        self.thread
            .lock()
            .post(frame)
            .map_err(|_| RpcError::WorkerTerminated)
    }

    fn terminate(&self) {
        self.thread.lock().terminate();
    }
}
