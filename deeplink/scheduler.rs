/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! "Run this on a later turn" capability injected into the dispatch path.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub trait Scheduler: Send + Sync {
    /// Runs `task` after the current call stack has unwound. Implementations
    /// must never poll `task` from inside this call.
    fn schedule(&self, task: BoxFuture<'static, ()>);
}

/// Runs scheduled work on a tokio runtime, one task at a time in the order it
/// was scheduled, on any runtime flavor.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    tasks: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl TokioScheduler {
    /// Spawns the driver task on `handle`; it exits once every clone of the
    /// scheduler is dropped.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        let (tasks, mut queued) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        drop(handle.spawn(async move {
            while let Some(task) = queued.recv().await {
                task.await;
            }
        }));
        Self { tasks }
    }

    /// Scheduler for the runtime driving the caller, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        if self.tasks.send(task).is_err() {
            log::error!("scheduler runtime has shut down; dropping scheduled task");
        }
    }
}

/// Parks tasks until the owner calls [`ManualScheduler::run_pending`].
///
/// Suits hosts that pump their own event loop: call `run_pending` once per
/// loop iteration.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Runs parked tasks to completion in the order they were scheduled,
    /// including tasks scheduled while running. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                return ran;
            }
            for task in batch {
                pollster::block_on(task);
                ran += 1;
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        self.tasks.lock().push(task);
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
