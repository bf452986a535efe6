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

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::join_all;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    action::*,
    action_store::ActionStore,
    engine::ReliableFaultsEngine,
    metrics::*,
    node_sync::NodeCommandSynchronizer,
    runtime::{
        select,
        time::{sleep, sleep_or_shutdown, Ticker},
        Executor, JoinHandle, Shutdown, TaskPriority,
    },
    Config, Error, Result,
};

/// An action owned by the engine, tracked until the reaper observes its completion.
pub struct ActionCompletionInfo {
    pub operation_id: Uuid,
    handle: JoinHandle<Result<ActionState>>,
    // Released once the completion is reaped.
    permit: OwnedSemaphorePermit,
}

/// Admits test commands, feeds them to the engine under a concurrency limit and answers
/// queries about them.
#[derive(Clone)]
pub struct FaultAnalysisServiceMessageProcessor {
    shared: Arc<ProcessorShared>,
}

struct ProcessorShared {
    cfg: Config,
    executor: Executor,
    action_store: Arc<ActionStore>,
    engine: Arc<ReliableFaultsEngine>,
    node_sync: Arc<NodeCommandSynchronizer>,
    factory: Arc<dyn ActionFactory>,

    queue: Mutex<VecDeque<ActionState>>,
    queue_notify: Notify,
    semaphore: Arc<Semaphore>,
    pending: Mutex<HashMap<Uuid, ActionCompletionInfo>>,
    // Every operation this processor has admitted or resumed and not yet let go of, whether it
    // is queued, being dispatched or running.
    owned: Mutex<HashSet<Uuid>>,
}

impl FaultAnalysisServiceMessageProcessor {
    pub fn new(
        cfg: Config,
        executor: Executor,
        action_store: Arc<ActionStore>,
        factory: Arc<dyn ActionFactory>,
    ) -> Self {
        let node_sync = Arc::new(NodeCommandSynchronizer::new());
        let engine = Arc::new(ReliableFaultsEngine::new(
            action_store.clone(),
            node_sync.clone(),
            cfg.engine.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(cfg.concurrent_requests.max(1)));
        FaultAnalysisServiceMessageProcessor {
            shared: Arc::new(ProcessorShared {
                cfg,
                executor,
                action_store,
                engine,
                node_sync,
                factory,
                queue: Mutex::default(),
                queue_notify: Notify::new(),
                semaphore,
                pending: Mutex::default(),
                owned: Mutex::default(),
            }),
        }
    }

    /// Resumes the actions left behind by the previous primary, then starts the consumer, the
    /// completion reaper and the history truncation. All of them stop once `shutdown` fires.
    pub async fn start(&self, shutdown: Shutdown) -> Result<()> {
        self.resume_pending_actions().await?;

        let shared = self.shared.clone();
        let consumer_shutdown = shutdown.clone();
        self.shared
            .executor
            .spawn(None, TaskPriority::High, async move {
                shared.consume(consumer_shutdown).await;
            });

        let shared = self.shared.clone();
        let reaper_shutdown = shutdown.clone();
        self.shared
            .executor
            .spawn(None, TaskPriority::High, async move {
                shared.reap(reaper_shutdown).await;
            });

        self.shared
            .action_store
            .start_truncation(&self.shared.executor, shutdown);
        info!("fault analysis processor is started");
        Ok(())
    }

    /// Enqueues every persisted, non-terminal action this processor does not own yet.
    pub async fn resume_pending_actions(&self) -> Result<usize> {
        let actions = self.shared.action_store.get_actions_to_resume().await?;
        let mut resumed = 0;
        for listed in actions {
            let operation_id = listed.operation_id;
            if !self.shared.claim(operation_id) {
                continue;
            }
            // The listed record may have finished before it was claimed.
            let state = match self.shared.action_store.find_by_operation_id(operation_id).await {
                Ok(state) if !state.is_terminal() => state,
                Ok(_) | Err(Error::KeyNotFound(_)) => {
                    self.shared.disown(operation_id);
                    continue;
                }
                Err(err) => {
                    self.shared.disown(operation_id);
                    return Err(err);
                }
            };
            if let Some(node_name) = state.node_name() {
                // A run stopped by a propagated error keeps its node.
                if let Err(err) = self.shared.node_sync.add(node_name) {
                    warn!(operation_id = %state.operation_id, err = ?err, "resume node transition");
                }
            }
            debug!(operation_id = %state.operation_id, step = ?state.current_step(), "resume action");
            self.shared.enqueue(state);
            resumed += 1;
        }
        PROCESSOR_RESUMED_TOTAL.inc_by(resumed as u64);
        info!(resumed, "resume pending actions");
        Ok(resumed)
    }

    pub async fn process_data_loss_command(
        &self,
        operation_id: Uuid,
        partition_selector: PartitionSelector,
        mode: DataLossMode,
        timeout: Duration,
    ) -> Result<()> {
        if mode == DataLossMode::Invalid {
            return Err(reject(operation_id, invalid_argument("data loss mode")));
        }
        validate_partition_selector(operation_id, &partition_selector)?;
        let kind = ActionKind::DataLoss(DataLossInfo {
            partition_selector,
            mode,
            selected_partition: None,
            data_loss_number: None,
            result: None,
        });
        self.admit(ActionState::new(operation_id, kind), timeout)
            .await
    }

    pub async fn process_quorum_loss_command(
        &self,
        operation_id: Uuid,
        partition_selector: PartitionSelector,
        mode: QuorumLossMode,
        quorum_loss_duration: Duration,
        timeout: Duration,
    ) -> Result<()> {
        if mode == QuorumLossMode::Invalid {
            return Err(reject(operation_id, invalid_argument("quorum loss mode")));
        }
        if quorum_loss_duration.is_zero() {
            return Err(reject(
                operation_id,
                invalid_argument("quorum loss duration"),
            ));
        }
        validate_partition_selector(operation_id, &partition_selector)?;
        let kind = ActionKind::QuorumLoss(QuorumLossInfo {
            partition_selector,
            mode,
            quorum_loss_duration,
            selected_partition: None,
            replica_ids: Vec::new(),
            result: None,
        });
        self.admit(ActionState::new(operation_id, kind), timeout)
            .await
    }

    pub async fn process_restart_partition_command(
        &self,
        operation_id: Uuid,
        partition_selector: PartitionSelector,
        mode: RestartPartitionMode,
        timeout: Duration,
    ) -> Result<()> {
        if mode == RestartPartitionMode::Invalid {
            return Err(reject(
                operation_id,
                invalid_argument("restart partition mode"),
            ));
        }
        validate_partition_selector(operation_id, &partition_selector)?;
        let kind = ActionKind::RestartPartition(RestartPartitionInfo {
            partition_selector,
            mode,
            selected_partition: None,
            result: None,
        });
        self.admit(ActionState::new(operation_id, kind), timeout)
            .await
    }

    pub async fn process_start_node_command(
        &self,
        operation_id: Uuid,
        node_name: &str,
        node_instance_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        validate_node_name(operation_id, node_name)?;
        let kind = ActionKind::StartNode(NodeTransitionInfo {
            node_name: node_name.to_owned(),
            node_instance_id,
            stop_duration: None,
            result: None,
        });
        self.admit(ActionState::new(operation_id, kind), timeout)
            .await
    }

    pub async fn process_stop_node_command(
        &self,
        operation_id: Uuid,
        node_name: &str,
        node_instance_id: u64,
        stop_duration: Duration,
        timeout: Duration,
    ) -> Result<()> {
        validate_node_name(operation_id, node_name)?;
        if stop_duration.is_zero() {
            return Err(reject(operation_id, invalid_argument("stop duration")));
        }
        let kind = ActionKind::StopNode(NodeTransitionInfo {
            node_name: node_name.to_owned(),
            node_instance_id,
            stop_duration: Some(stop_duration),
            result: None,
        });
        self.admit(ActionState::new(operation_id, kind), timeout)
            .await
    }

    /// Admits a command that never leaves `PerformingActions` until it is cancelled.
    pub async fn process_stuck_command(&self, operation_id: Uuid, timeout: Duration) -> Result<()> {
        self.admit(ActionState::new(operation_id, ActionKind::Stuck), timeout)
            .await
    }

    pub async fn process_retry_step_command(
        &self,
        operation_id: Uuid,
        retries: u32,
        timeout: Duration,
    ) -> Result<()> {
        let kind = ActionKind::RetryStep(RetryStepInfo { retries });
        self.admit(ActionState::new(operation_id, kind), timeout)
            .await
    }

    pub async fn process_get_test_command_list(
        &self,
        state_filter: TestCommandStateFilter,
        type_filter: TestCommandTypeFilter,
    ) -> Result<Vec<TestCommandQueryResult>> {
        let actions = self
            .shared
            .action_store
            .get_selected_actions(state_filter, type_filter)
            .await?;
        Ok(actions
            .iter()
            .take(self.shared.cfg.max_query_results)
            .map(TestCommandQueryResult::from)
            .collect())
    }

    pub async fn process_get_progress(
        &self,
        operation_id: Uuid,
        expected_type: ActionType,
    ) -> Result<TestCommandProgress> {
        let state = self
            .shared
            .action_store
            .find_by_operation_id(operation_id)
            .await?;
        if state.action_type() != expected_type {
            return Err(Error::InvalidArgument(format!(
                "{operation_id} is a {:?} command, not {expected_type:?}",
                state.action_type()
            )));
        }
        Ok(TestCommandProgress::from(&state))
    }

    pub async fn process_get_stopped_node_list(&self) -> Result<Vec<String>> {
        let mut nodes = self.shared.action_store.get_stopped_nodes().await?;
        nodes.truncate(self.shared.cfg.max_query_results);
        Ok(nodes)
    }

    pub async fn process_cancel_test_command(&self, operation_id: Uuid, force: bool) -> Result<()> {
        self.shared
            .action_store
            .cancel_test_command(operation_id, force)
            .await
    }

    pub fn action_store(&self) -> Arc<ActionStore> {
        self.shared.action_store.clone()
    }

    pub fn node_sync(&self) -> Arc<NodeCommandSynchronizer> {
        self.shared.node_sync.clone()
    }

    /// The number of actions owned by the engine and not yet reaped.
    pub fn running_actions(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    async fn admit(&self, state: ActionState, timeout: Duration) -> Result<()> {
        let operation_id = state.operation_id;
        let action_type = state.action_type();
        let node_name = state.node_name().map(ToOwned::to_owned);
        if let Some(node_name) = &node_name {
            self.shared
                .node_sync
                .add(node_name)
                .map_err(|err| reject(operation_id, err))?;
        }

        let result = if self.shared.claim(operation_id) {
            let result = self
                .shared
                .action_store
                .initialize_new_action(&state, timeout)
                .await;
            if result.is_err() {
                self.shared.disown(operation_id);
            }
            result
        } else {
            Err(Error::OperationIdAlreadyExists(operation_id))
        };
        if let Err(err) = result {
            if let Some(node_name) = &node_name {
                self.shared.node_sync.remove(node_name);
            }
            return Err(reject(operation_id, err));
        }

        take_admit_metrics(action_type);
        info!(operation_id = %operation_id, action_type = ?action_type, "test command admitted");
        self.shared.enqueue(state);
        Ok(())
    }
}

impl ProcessorShared {
    fn enqueue(&self, state: ActionState) {
        self.queue.lock().unwrap().push_back(state);
        self.queue_notify.notify_one();
    }

    /// Takes ownership of an operation, returns false if it is owned already.
    fn claim(&self, operation_id: Uuid) -> bool {
        self.owned.lock().unwrap().insert(operation_id)
    }

    fn disown(&self, operation_id: Uuid) {
        self.owned.lock().unwrap().remove(&operation_id);
    }

    fn action_context(&self) -> ActionContext {
        ActionContext {
            node_sync: self.node_sync.clone(),
            action_store: self.action_store.clone(),
        }
    }

    fn construct_action(&self, state: &ActionState) -> Result<Box<dyn FabricTestAction>> {
        match &state.kind {
            ActionKind::Stuck => Ok(Box::new(StuckAction)),
            ActionKind::RetryStep(_) => Ok(Box::new(RetryStepAction::new(state)?)),
            ActionKind::DataLoss(_)
            | ActionKind::QuorumLoss(_)
            | ActionKind::RestartPartition(_)
            | ActionKind::StartNode(_)
            | ActionKind::StopNode(_) => self.factory.create(state, &self.action_context()),
        }
    }

    async fn consume(self: Arc<Self>, mut shutdown: Shutdown) {
        let poll_interval = self.cfg.processor.dequeue_poll_interval();
        'consume: loop {
            // No slot is held while the queue is empty.
            loop {
                let empty = self.queue.lock().unwrap().is_empty();
                if !empty {
                    break;
                }
                select! {
                    _ = self.queue_notify.notified() => {},
                    _ = sleep(poll_interval) => {},
                    _ = shutdown.recv() => break 'consume,
                }
            }

            let permit = select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'consume,
                },
                _ = shutdown.recv() => break 'consume,
            };
            let next = self.queue.lock().unwrap().pop_front();
            if let Some(state) = next {
                self.dispatch(state, permit, &shutdown).await;
            }
        }
        info!("fault analysis consumer is stopped");
    }

    async fn dispatch(
        &self,
        mut state: ActionState,
        permit: OwnedSemaphorePermit,
        shutdown: &Shutdown,
    ) {
        let operation_id = state.operation_id;
        let action = match self.construct_action(&state) {
            Ok(action) => action,
            Err(err) => {
                error!(operation_id = %operation_id, err = ?err, "construct action");
                self.fail_unconstructed(state, err, shutdown).await;
                return;
            }
        };

        if state.current_step() == StepStateNames::IntentSaved {
            state.state_progress.push(StepStateNames::LookingUpState);
            if let Err(err) = self.action_store.update_action_state(&mut state).await {
                if err.is_propagate() {
                    info!(operation_id = %operation_id, err = ?err, "drop action until it is resumed");
                    self.disown(operation_id);
                    return;
                }
                warn!(operation_id = %operation_id, err = ?err, "start action, requeue it");
                state.state_progress.pop();
                drop(permit);
                if sleep_or_shutdown(self.cfg.engine.command_step_retry_backoff(), shutdown)
                    .await
                    .is_ok()
                {
                    self.enqueue(state);
                }
                return;
            }
        }

        let engine = self.engine.clone();
        let engine_shutdown = shutdown.clone();
        let tag = operation_id.as_u128() as u64;
        let handle = self
            .executor
            .spawn(Some(tag), TaskPriority::Middle, async move {
                engine.run(action, state, engine_shutdown).await
            });
        PROCESSOR_RUNNING_ACTIONS.inc();
        self.pending.lock().unwrap().insert(
            operation_id,
            ActionCompletionInfo {
                operation_id,
                handle,
                permit,
            },
        );
    }

    /// An action that can't be built never runs, it is failed right away. Persisting the failure
    /// is retried until it succeeds or the processor stops.
    async fn fail_unconstructed(&self, mut state: ActionState, err: Error, shutdown: &Shutdown) {
        let operation_id = state.operation_id;
        state.rollback_state = RollbackState::RollingBackAndWillFailAction;
        state.error_causing_rollback = Some(err.error_code());
        state.state_progress.push(StepStateNames::Failed);
        state.mark_stopped();
        loop {
            match self.action_store.update_action_state(&mut state).await {
                Ok(()) => break,
                Err(err) if err.is_propagate() => {
                    info!(operation_id = %operation_id, err = ?err, "drop action until it is resumed");
                    self.disown(operation_id);
                    return;
                }
                Err(err) => {
                    warn!(operation_id = %operation_id, err = ?err, "fail unconstructed action, retry it");
                    let backoff = self.cfg.engine.command_step_retry_backoff();
                    if sleep_or_shutdown(backoff, shutdown).await.is_err() {
                        return;
                    }
                }
            }
        }
        if let Some(node_name) = state.node_name() {
            self.node_sync.remove(node_name);
        }
        self.disown(operation_id);
    }

    async fn reap(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = Ticker::new(self.cfg.processor.reaper_interval());
        while ticker.tick(&mut shutdown).await {
            self.reap_completed().await;
        }
        info!("fault analysis reaper is stopped");
    }

    async fn reap_completed(&self) -> usize {
        let finished = {
            let mut pending = self.pending.lock().unwrap();
            let ids = pending
                .iter()
                .filter(|(_, info)| info.handle.is_finished())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.iter()
                .filter_map(|id| pending.remove(id))
                .collect::<Vec<_>>()
        };

        let reaped = finished.len();
        let results = join_all(finished.into_iter().map(|info| async move {
            let ActionCompletionInfo {
                operation_id,
                handle,
                permit,
            } = info;
            (operation_id, handle.join().await, permit)
        }))
        .await;
        for (operation_id, result, permit) in results {
            match result {
                Ok(Ok(state)) => {
                    debug!(operation_id = %operation_id, state = ?state.progress_state(), "reap action");
                }
                Ok(Err(err)) if err.is_propagate() => {
                    info!(operation_id = %operation_id, err = ?err, "reap stopped action");
                }
                Ok(Err(err)) => {
                    error!(operation_id = %operation_id, err = ?err, "action finished with unexpected error");
                    std::process::abort();
                }
                Err(err) => {
                    error!(operation_id = %operation_id, err = ?err, "action task panicked or was aborted");
                    std::process::abort();
                }
            }
            self.disown(operation_id);
            PROCESSOR_RUNNING_ACTIONS.dec();
            drop(permit);
        }
        reaped
    }
}

fn invalid_argument(what: &str) -> Error {
    Error::InvalidArgument(format!("invalid {what}"))
}

fn reject(operation_id: Uuid, err: Error) -> Error {
    PROCESSOR_REJECT_TOTAL.inc();
    warn!(operation_id = %operation_id, err = ?err, "reject test command");
    err
}

fn validate_partition_selector(operation_id: Uuid, selector: &PartitionSelector) -> Result<()> {
    if selector.service_name.is_empty() {
        return Err(reject(operation_id, invalid_argument("service name")));
    }
    if let PartitionSelectorKind::Named(name) = &selector.kind {
        if name.is_empty() {
            return Err(reject(operation_id, invalid_argument("partition name")));
        }
    }
    Ok(())
}

fn validate_node_name(operation_id: Uuid, node_name: &str) -> Result<()> {
    if node_name.is_empty() {
        return Err(reject(operation_id, invalid_argument("node name")));
    }
    Ok(())
}
