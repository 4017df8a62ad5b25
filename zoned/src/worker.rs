/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A small thread pool for work that must not block the RPC dispatcher:
//! create, destroy, start, shutdown. Tasks report back through a
//! completion channel paired with an eventfd, which the main loop has
//! registered with its event poll.

use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use tracing::warn;

use zoned_ipc::PeerId;

use crate::Result;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// What a finished task wants sent back to the requester.
pub struct Completion {
    pub peer: PeerId,
    pub msg_id: u64,
    pub result: Result<Vec<u8>>,
}

/// Hands completions from worker threads to the main loop and pokes its
/// event poll awake.
#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::Sender<Completion>,
    wakeup: Arc<EventFd>,
}

impl CompletionSender {
    pub fn send(&self, completion: Completion) {
        if self.tx.send(completion).is_err() {
            warn!("completion channel closed; reply dropped");
            return;
        }
        if let Err(e) = self.wakeup.write(1) {
            warn!("cannot wake the main loop: {e}");
        }
    }

    /// Serialize a handler result the way the main loop expects it.
    pub fn complete<T: serde::Serialize>(&self, peer: PeerId, msg_id: u64, result: Result<T>) {
        let result = result
            .and_then(|value| serde_json::to_vec(&value).map_err(|e| crate::Error::internal(e)));
        self.send(Completion {
            peer,
            msg_id,
            result,
        });
    }
}

pub struct WorkerPool {
    tx: Option<mpsc::Sender<Task>>,
    threads: Vec<JoinHandle<()>>,
    completions: mpsc::Receiver<Completion>,
    completion_tx: CompletionSender,
    wakeup: Arc<EventFd>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let mut threads = Vec::with_capacity(size);
        for n in 0..size {
            let rx = Arc::clone(&task_rx);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("zoned-worker-{n}"))
                    .spawn(move || loop {
                        let task = {
                            let guard = rx.lock().expect("worker queue poisoned");
                            guard.recv()
                        };
                        match task {
                            Ok(task) => task(),
                            Err(_) => break,
                        }
                    })
                    .map_err(crate::Error::Io)?,
            );
        }

        let wakeup = Arc::new(
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| crate::Error::internal(e))?,
        );
        let (completion_tx, completions) = mpsc::channel();
        Ok(Self {
            tx: Some(task_tx),
            threads,
            completions,
            completion_tx: CompletionSender {
                tx: completion_tx,
                wakeup: Arc::clone(&wakeup),
            },
            wakeup,
        })
    }

    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(task)).is_err() {
                warn!("worker pool is gone; task dropped");
            }
        }
    }

    pub fn completion_sender(&self) -> CompletionSender {
        self.completion_tx.clone()
    }

    /// Fd to register with the event poll; readable when completions are
    /// waiting.
    pub fn wakeup_fd(&self) -> BorrowedFd<'_> {
        self.wakeup.as_fd()
    }

    pub fn wakeup_raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.wakeup.as_fd().as_raw_fd()
    }

    /// Drain everything that finished since the last poll.
    pub fn drain_completions(&self) -> Vec<Completion> {
        let _ = self.wakeup.read();
        let mut out = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            out.push(completion);
        }
        out
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops; then wait for them.
        self.tx.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn tasks_run_and_complete() {
        let pool = WorkerPool::new(2).unwrap();
        let sender = pool.completion_sender();
        let peer = PeerId::from_uuid(uuid::Uuid::nil());
        pool.submit(move || {
            sender.send(Completion {
                peer,
                msg_id: 42,
                result: Ok(b"done".to_vec()),
            });
        });

        let mut drained = Vec::new();
        for _ in 0..100 {
            drained = pool.drain_completions();
            if !drained.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].msg_id, 42);
        assert_eq!(drained[0].result.as_ref().unwrap(), b"done");
    }

    #[test]
    fn drop_joins_idle_workers() {
        let pool = WorkerPool::new(4).unwrap();
        drop(pool);
    }
}
