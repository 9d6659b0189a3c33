// Copyright 2025 Tailwater Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Worker pool between the transformer and the producer client.
//!
//! All workers share one input channel and forward into the single produce
//! channel consumed by [`Client::produce`](crate::producer::Client::produce).
//! A worker exits when the pool is closed, when its input closes, or in
//! replay mode after a period without messages. The replay idle clock only
//! runs once the pool has received its first message, so a slow first batch
//! does not end the run. With more than one worker, messages for different
//! keys may be reordered.

use crate::message::Message;
use crate::metrics;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// When workers give up waiting for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Workers wait for input indefinitely
    #[default]
    Watch,

    /// Workers exit after `idle_timeout` without a message
    Replay {
        /// Inactivity before a worker exits
        idle_timeout: Duration,
    },
}

/// How a [`Dispatcher::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEnd {
    /// The input closed and every message was forwarded
    Drained,

    /// The pool was closed or cancelled
    Stopped,

    /// The produce channel closed before the input
    OutputClosed,

    /// Every worker idled out while the input was still open
    Idle,

    /// Every worker panicked
    Failed,
}

impl DispatchEnd {
    // Drained wins: once the input closed, nothing was left behind.
    const fn rank(self) -> u8 {
        match self {
            Self::Drained => 4,
            Self::Stopped => 3,
            Self::OutputClosed => 2,
            Self::Idle => 1,
            Self::Failed => 0,
        }
    }
}

/// Running-worker bookkeeping shared by the pool and its workers.
#[derive(Debug, Default)]
struct Running {
    count: AtomicUsize,
    idle: Notify,
    started: AtomicBool,
}

/// Decrements the running count when a worker ends, even by panic.
struct RunningGuard(Arc<Running>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let previous = self.0.count.fetch_sub(1, Ordering::SeqCst);
        metrics::set_workers_running(previous - 1);
        if previous == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Fixed-size worker pool.
#[derive(Debug)]
pub struct Dispatcher {
    workers: usize,
    mode: DispatchMode,
    stop: CancellationToken,
    running: Arc<Running>,
}

impl Dispatcher {
    /// Creates a pool of `workers` (minimum 1) stopped by `cancel` or
    /// [`close`](Self::close).
    pub fn new(workers: usize, mode: DispatchMode, cancel: &CancellationToken) -> Self {
        Self {
            workers: workers.max(1),
            mode,
            stop: cancel.child_token(),
            running: Arc::new(Running::default()),
        }
    }

    /// Runs the workers until all of them have exited.
    ///
    /// `output` is dropped once the last worker exits, which closes the
    /// produce channel. Anything but [`DispatchEnd::Drained`] or
    /// [`DispatchEnd::Stopped`] means the input was abandoned.
    #[instrument(skip_all, fields(workers = self.workers, mode = ?self.mode))]
    pub async fn run(
        &self,
        input: mpsc::Receiver<Message>,
        output: mpsc::Sender<Message>,
    ) -> DispatchEnd {
        let input = Arc::new(Mutex::new(input));
        let mut workers = JoinSet::new();

        for id in 0..self.workers {
            let previous = self.running.count.fetch_add(1, Ordering::SeqCst);
            metrics::set_workers_running(previous + 1);

            let guard = RunningGuard(self.running.clone());
            workers.spawn(worker(
                id,
                self.mode,
                input.clone(),
                output.clone(),
                self.stop.clone(),
                guard,
            ));
        }
        drop(output);
        info!("Dispatcher started");

        let mut end = DispatchEnd::Failed;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(exit) if exit.rank() > end.rank() => end = exit,
                Ok(_) => {}
                Err(e) => error!(error = %e, "Dispatcher worker panicked"),
            }
        }

        match end {
            DispatchEnd::Drained | DispatchEnd::Stopped => info!(?end, "Dispatcher stopped"),
            _ => warn!(?end, "Dispatcher stopped before its input was drained"),
        }
        end
    }

    /// Releases every running worker and returns how many there were.
    ///
    /// Does not wait for them to exit. A pool with no running workers is left
    /// untouched and 0 is returned.
    pub fn close(&self) -> usize {
        let running = self.running();
        if running == 0 {
            return 0;
        }
        self.stop.cancel();
        running
    }

    /// Number of workers currently running.
    pub fn running(&self) -> usize {
        self.running.count.load(Ordering::SeqCst)
    }

    /// Waits until no worker is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.running.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.running() == 0 {
                return;
            }
            idle.await;
        }
    }
}

async fn worker(
    id: usize,
    mode: DispatchMode,
    input: Arc<Mutex<mpsc::Receiver<Message>>>,
    output: mpsc::Sender<Message>,
    stop: CancellationToken,
    guard: RunningGuard,
) -> DispatchEnd {
    debug!(worker = id, "Worker started");

    let exit = loop {
        let received = async { input.lock().await.recv().await };

        let next = match mode {
            DispatchMode::Watch => tokio::select! {
                biased;
                () = stop.cancelled() => break DispatchEnd::Stopped,
                message = received => message,
            },
            DispatchMode::Replay { idle_timeout } => tokio::select! {
                biased;
                () = stop.cancelled() => break DispatchEnd::Stopped,
                message = tokio::time::timeout(idle_timeout, received) => match message {
                    Ok(message) => message,
                    Err(_) if !guard.0.started.load(Ordering::SeqCst) => continue,
                    Err(_) => {
                        info!(worker = id, ?idle_timeout, "Worker idle, exiting");
                        break DispatchEnd::Idle;
                    }
                },
            },
        };

        let Some(message) = next else {
            debug!(worker = id, "Input closed");
            break DispatchEnd::Drained;
        };
        guard.0.started.store(true, Ordering::SeqCst);

        tokio::select! {
            biased;
            () = stop.cancelled() => break DispatchEnd::Stopped,
            sent = output.send(message) => {
                if sent.is_err() {
                    debug!(worker = id, "Produce channel closed");
                    break DispatchEnd::OutputClosed;
                }
            }
        }
    };

    debug!(worker = id, ?exit, "Worker stopped");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(count: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(count.max(1));
        for i in 0..count {
            tx.try_send(Message::new("items", format!("k{i}"), "v"))
                .unwrap();
        }
        rx
    }

    #[test]
    fn test_close_without_running_workers_is_noop() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(4, DispatchMode::Watch, &cancel);

        assert_eq!(dispatcher.close(), 0);
        assert_eq!(dispatcher.close(), 0);
        assert_eq!(dispatcher.running(), 0);
        assert!(!dispatcher.stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_workers_drain_input_then_exit() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(3, DispatchMode::Watch, &cancel);
        let (output, mut produced) = mpsc::channel(16);

        assert_eq!(dispatcher.run(messages(5), output).await, DispatchEnd::Drained);

        let mut keys = Vec::new();
        while let Some(message) = produced.recv().await {
            keys.push(message.key_lossy().into_owned());
        }
        keys.sort();
        assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4"]);
        assert_eq!(dispatcher.running(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_running_workers() {
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(2, DispatchMode::Watch, &cancel));
        let (_input_tx, input) = mpsc::channel(1);
        let (output, _produced) = mpsc::channel(1);

        let pool = dispatcher.clone();
        let run = tokio::spawn(async move { pool.run(input, output).await });

        while dispatcher.running() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.close(), 2);

        dispatcher.wait_idle().await;
        assert_eq!(run.await.unwrap(), DispatchEnd::Stopped);
        assert_eq!(dispatcher.running(), 0);
        assert_eq!(dispatcher.close(), 0);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_workers_exit_when_idle() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            2,
            DispatchMode::Replay {
                idle_timeout: Duration::from_secs(10),
            },
            &cancel,
        );
        let (input_tx, input) = mpsc::channel(1);
        input_tx
            .try_send(Message::new("items", "k0", "v"))
            .unwrap();
        let (output, mut produced) = mpsc::channel(1);

        assert_eq!(dispatcher.run(input, output).await, DispatchEnd::Idle);

        assert_eq!(dispatcher.running(), 0);
        assert_eq!(produced.recv().await.unwrap().key, b"k0".to_vec());
        assert!(produced.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_idle_clock_starts_with_first_message() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            2,
            DispatchMode::Replay {
                idle_timeout: Duration::from_secs(1),
            },
            &cancel,
        );
        let (input_tx, input) = mpsc::channel(1);
        let (output, mut produced) = mpsc::channel(4);

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            input_tx
                .send(Message::new("items", "k0", "v"))
                .await
                .unwrap();
        });

        assert_eq!(dispatcher.run(input, output).await, DispatchEnd::Drained);
        late.await.unwrap();

        assert_eq!(produced.recv().await.unwrap().key, b"k0".to_vec());
        assert!(produced.recv().await.is_none());
    }
}
