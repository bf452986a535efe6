// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
mod shutdown;
pub mod time;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use serde::{Deserialize, Serialize};
pub use tokio::select;

pub use self::shutdown::{Shutdown, ShutdownNotifier};
use crate::metrics::{EXECUTOR_PARK_TOTAL, EXECUTOR_SPAWN_TOTAL, EXECUTOR_UNPARK_TOTAL};

#[derive(Debug, Clone, Copy)]
pub enum TaskPriority {
    /// Long-lived service loops: consumer, reaper.
    High,
    /// Engine runs of admitted actions.
    Middle,
    /// Housekeeping such as history truncation.
    Low,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub num_threads: Option<usize>,
    pub event_interval: Option<u32>,
    pub global_event_interval: Option<u32>,
}

/// A handle that awaits the result of a task.
///
/// Dropping a [`JoinHandle`] will detach the task, meaning that there is no longer
/// a handle to the task and no way to `join` on it. Awaiting a handle whose task
/// panicked or was aborted panics as well.
#[derive(Debug)]
pub struct JoinHandle<T> {
    inner: tokio::task::JoinHandle<T>,
}

pub struct ExecutorOwner {
    runtime: tokio::runtime::Runtime,
}

/// An execution service.
#[derive(Clone)]
pub struct Executor
where
    Self: Send + Sync,
{
    handle: tokio::runtime::Handle,
}

impl ExecutorOwner {
    /// New executor and setup the underlying threads, scheduler.
    pub fn new(num_threads: usize) -> Self {
        Self::with_config(ExecutorConfig {
            num_threads: Some(num_threads),
            ..Default::default()
        })
    }

    pub fn with_config(cfg: ExecutorConfig) -> Self {
        use tokio::runtime::Builder;
        let runtime = Builder::new_multi_thread()
            .worker_threads(cfg.num_threads.unwrap_or(2).max(1))
            .enable_all()
            .event_interval(cfg.event_interval.unwrap_or(61))
            .global_queue_interval(cfg.global_event_interval.unwrap_or(64))
            .on_thread_park(|| {
                EXECUTOR_PARK_TOTAL.inc();
            })
            .on_thread_unpark(|| {
                EXECUTOR_UNPARK_TOTAL.inc();
            })
            .build()
            .expect("build tokio runtime");
        ExecutorOwner { runtime }
    }

    pub fn executor(&self) -> Executor {
        Executor {
            handle: self.runtime.handle().clone(),
        }
    }
}

impl Executor {
    /// Spawns a task.
    ///
    /// [`tag`]: a hint used to group related tasks, such as the operation id of an action.
    /// [`priority`]: specify the task priority.
    pub fn spawn<F, T>(
        &self,
        tag: Option<u64>,
        priority: TaskPriority,
        future: F,
    ) -> JoinHandle<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let _ = tag;
        match priority {
            TaskPriority::High => EXECUTOR_SPAWN_TOTAL.high.inc(),
            TaskPriority::Middle => EXECUTOR_SPAWN_TOTAL.middle.inc(),
            TaskPriority::Low => EXECUTOR_SPAWN_TOTAL.low.inc(),
        }
        let inner = self.handle.spawn(future);
        JoinHandle { inner }
    }

    /// Runs a future to completion on the executor. This is the executor's entry point.
    pub fn block_on<F, T>(&self, future: F) -> T
    where
        F: Future<Output = T> + Send,
        T: Send + 'static,
    {
        self.handle.block_on(future)
    }
}

impl<T> JoinHandle<T> {
    /// Whether the task has stopped, either by returning, panicking or being aborted.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Waits for the task. Unlike awaiting the handle, a panicked or aborted task is returned
    /// as an error.
    pub async fn join(self) -> std::result::Result<T, tokio::task::JoinError> {
        self.inner.await
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(e)) => panic!("{:?}", e),
        }
    }
}

/// Returns a `Executor` view over the currently running `ExecutorOwner`.
///
/// # Panics
///
/// This will panic if called outside the context of a runtime.
pub fn current() -> Executor {
    Executor {
        handle: tokio::runtime::Handle::current(),
    }
}
