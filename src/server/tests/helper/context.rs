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

use std::{sync::Arc, time::Duration};

use fault_analysis_server::{
    action::{ActionType, TestCommandProgress, TestCommandProgressState},
    runtime::{Executor, ExecutorOwner, ShutdownNotifier},
    store::MemStore,
    ActionStore, Config, FaultAnalysisServiceMessageProcessor,
};
use tracing::info;
use uuid::Uuid;

use super::action::ScriptedFactory;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestContext {
    name: String,
    owner: ExecutorOwner,
    cfg: Config,
    pub mem: MemStore,
    pub factory: Arc<ScriptedFactory>,
    notifier: Option<ShutdownNotifier>,
}

impl TestContext {
    pub fn new(name: &str) -> Self {
        let mut cfg = Config::default();
        cfg.engine.command_step_retry_backoff_ms = 1;
        cfg.engine.action_retry_backoff_min_ms = 1;
        cfg.engine.action_retry_backoff_max_ms = 5;
        cfg.processor.reaper_interval_ms = 10;
        cfg.processor.dequeue_poll_interval_ms = 10;
        cfg.executor.num_threads = Some(2);
        TestContext {
            name: name.to_owned(),
            owner: cfg.build_executor(),
            cfg,
            mem: MemStore::new(),
            factory: Arc::default(),
            notifier: None,
        }
    }

    pub fn mut_config(&mut self) -> &mut Config {
        &mut self.cfg
    }

    pub fn executor(&self) -> Executor {
        self.owner.executor()
    }

    /// Builds a processor over the shared store without starting it.
    pub fn new_processor(&self) -> FaultAnalysisServiceMessageProcessor {
        let action_store = Arc::new(ActionStore::new(
            Arc::new(self.mem.clone()),
            self.cfg.store.clone(),
            self.cfg.cancel.clone(),
        ));
        FaultAnalysisServiceMessageProcessor::new(
            self.cfg.clone(),
            self.executor(),
            action_store,
            self.factory.clone(),
        )
    }

    /// Starts a processor, the one started before is shut down first.
    pub async fn start(&mut self, processor: &FaultAnalysisServiceMessageProcessor) {
        self.stop().await;
        let notifier = ShutdownNotifier::new();
        processor.start(notifier.subscribe()).await.unwrap();
        self.notifier = Some(notifier);
        info!("{} processor is started", self.name);
    }

    pub async fn start_processor(&mut self) -> FaultAnalysisServiceMessageProcessor {
        let processor = self.new_processor();
        self.start(&processor).await;
        processor
    }

    /// Simulates losing the primary role: every task of the running processor stops.
    pub async fn stop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            notifier.shutdown();
            tokio::time::sleep(Duration::from_millis(50)).await;
            info!("{} processor is stopped", self.name);
        }
    }
}

/// Polls the progress of a command until it reaches one of `states`.
pub async fn wait_progress(
    processor: &FaultAnalysisServiceMessageProcessor,
    operation_id: Uuid,
    action_type: ActionType,
    states: &[TestCommandProgressState],
) -> TestCommandProgress {
    for _ in 0..1000 {
        let progress = processor
            .process_get_progress(operation_id, action_type)
            .await
            .unwrap();
        if states.contains(&progress.state) {
            return progress;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("command {operation_id} does not reach {states:?}");
}

/// Polls until the condition holds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timeout waiting for {what}");
}
