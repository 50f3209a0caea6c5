// SPDX-License-Identifier: GPL-3.0-only

//! Command-driven worker threads
//!
//! Each worker owns a command channel carrying start, stop and "do next job"
//! messages. Start and stop can be sent synchronously: the sender blocks
//! until the handler has run. "Do next job" signals are coalesced, so any
//! number of signals raised before the worker picks one up produce a single
//! pass.

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

/// Command delivered to a worker's handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Start,
    Stop,
    DoNextJob,
}

enum Message {
    Cmd(Cmd, Option<Sender<()>>),
    Exit,
}

/// Handle to a running worker thread
pub struct CmdThread {
    name: String,
    sender: Sender<Message>,
    job_pending: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
}

impl CmdThread {
    /// Spawn a worker that feeds every command to `handler`
    pub fn launch<F>(name: &str, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(Cmd) + Send + 'static,
    {
        let (sender, receiver) = unbounded::<Message>();
        let job_pending = Arc::new(AtomicBool::new(false));
        let pending = Arc::clone(&job_pending);
        let thread_name = name.to_string();

        info!(name = %name, "Launching worker thread");
        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&thread_name, receiver, pending, &mut handler))?;
        let thread_id = Some(thread_handle.thread().id());

        Ok(Self {
            name: name.to_string(),
            sender,
            job_pending,
            thread_handle: Mutex::new(Some(thread_handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a command without waiting
    pub fn send(&self, cmd: Cmd) {
        if cmd == Cmd::DoNextJob {
            self.do_next_job();
            return;
        }
        if self.sender.send(Message::Cmd(cmd, None)).is_err() {
            warn!(name = %self.name, ?cmd, "Worker gone, command dropped");
        }
    }

    /// Queue a command and wait until the handler has processed it
    ///
    /// Called from the worker itself the command runs asynchronously, since
    /// waiting would never return.
    pub fn send_sync(&self, cmd: Cmd) {
        if self.is_current() {
            warn!(name = %self.name, ?cmd, "Synchronous command from the worker itself");
            self.send(cmd);
            return;
        }
        let (done_tx, done_rx) = bounded(1);
        if self.sender.send(Message::Cmd(cmd, Some(done_tx))).is_err() {
            warn!(name = %self.name, ?cmd, "Worker gone, command dropped");
            return;
        }
        if done_rx.recv().is_err() {
            warn!(name = %self.name, ?cmd, "Worker exited before acknowledging");
        }
    }

    /// Ask for one more pass over the job queues
    pub fn do_next_job(&self) {
        if self.job_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        if self
            .sender
            .send(Message::Cmd(Cmd::DoNextJob, None))
            .is_err()
        {
            self.job_pending.store(false, Ordering::SeqCst);
            debug!(name = %self.name, "Worker gone, next-job signal dropped");
        }
    }

    /// Whether the caller is running on this worker
    pub fn is_current(&self) -> bool {
        self.thread_id == Some(thread::current().id())
    }

    /// Stop the loop and wait for the thread to finish
    pub fn exit(&self) {
        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.sender.send(Message::Exit);
            if self.is_current() {
                // The loop exits after the current command; nobody joins it
                return;
            }
            debug!(name = %self.name, "Waiting for worker thread to finish");
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Worker thread panicked: {:?}", e);
            } else {
                debug!(name = %self.name, "Worker thread finished");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CmdThread {
    fn drop(&mut self) {
        if self.thread_handle.get_mut().is_some() {
            debug!(name = %self.name, "CmdThread dropped, stopping worker");
            self.exit();
        }
    }
}

impl std::fmt::Debug for CmdThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdThread")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run(
    name: &str,
    receiver: Receiver<Message>,
    job_pending: Arc<AtomicBool>,
    handler: &mut dyn FnMut(Cmd),
) {
    debug!(name = %name, "Worker thread started");
    for message in receiver.iter() {
        match message {
            Message::Cmd(cmd, ack) => {
                if cmd == Cmd::DoNextJob {
                    // Signals raised from here on get their own pass
                    job_pending.store(false, Ordering::SeqCst);
                }
                handler(cmd);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Message::Exit => break,
        }
    }
    info!(name = %name, "Worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_sync_command_runs_before_return() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let worker = CmdThread::launch("test-sync", move |cmd| {
            thread::sleep(Duration::from_millis(20));
            seen_clone.lock().push(cmd);
        })
        .unwrap();

        worker.send_sync(Cmd::Start);
        assert_eq!(*seen.lock(), vec![Cmd::Start]);
        worker.send_sync(Cmd::Stop);
        assert_eq!(*seen.lock(), vec![Cmd::Start, Cmd::Stop]);
        worker.exit();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_next_job_signals_coalesce() {
        let passes = Arc::new(AtomicU32::new(0));
        let passes_clone = Arc::clone(&passes);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let worker = CmdThread::launch("test-coalesce", move |cmd| match cmd {
            Cmd::Start => {
                let _ = gate_rx.recv();
            }
            Cmd::DoNextJob => {
                passes_clone.fetch_add(1, Ordering::SeqCst);
            }
            Cmd::Stop => {}
        })
        .unwrap();

        // Worker is parked in the start handler while the signals pile up
        worker.send(Cmd::Start);
        for _ in 0..10 {
            worker.do_next_job();
        }
        gate_tx.send(()).unwrap();
        worker.send_sync(Cmd::Stop);
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        worker.do_next_job();
        worker.send_sync(Cmd::Stop);
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        worker.exit();
    }

    #[test]
    fn test_drop_joins_worker() {
        let worker = CmdThread::launch("test-drop", |_| {}).unwrap();
        assert!(worker.is_running());
        drop(worker);
    }
}
