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

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    action::{
        ActionKind, ActionState, RollbackState, StepStateNames, TestCommandStateFilter,
        TestCommandTypeFilter,
    },
    config::{CancelConfig, StoreConfig},
    metrics::*,
    runtime::{time::Ticker, Executor, JoinHandle, Shutdown, TaskPriority},
    store::{StateStore, Transaction, ACTION_TABLE, HISTORY_TABLE, STOPPED_NODE_TABLE},
    Error, Result,
};

/// Invoked after a record reached a terminal state and was moved to history.
#[crate::async_trait]
pub trait TerminalHook: Send + Sync {
    async fn on_terminal(&self, state: &ActionState) -> Result<()>;
}

/// Receives faults that must not fail the operation that observed them.
pub trait FaultReporter: Send + Sync {
    fn report_transient_fault(&self, operation_id: Uuid, err: &Error);
}

/// Reports transient faults to the log.
#[derive(Default)]
pub struct LogFaultReporter;

impl FaultReporter for LogFaultReporter {
    fn report_transient_fault(&self, operation_id: Uuid, err: &Error) {
        STORE_TRANSIENT_FAULT_TOTAL.inc();
        warn!(operation_id = %operation_id, err = ?err, "transient fault");
    }
}

/// Durable CRUD over action records.
///
/// A record lives in the action table while it is running or rolling back and in the history
/// table once its progress reached a terminal step, never in both.
pub struct ActionStore {
    store: Arc<dyn StateStore>,
    cfg: StoreConfig,
    cancel_cfg: CancelConfig,
    terminal_hook: Option<Arc<dyn TerminalHook>>,
    fault_reporter: Arc<dyn FaultReporter>,

    // Only one truncation pass runs at a time.
    truncate_lock: tokio::sync::Mutex<()>,
}

impl ActionStore {
    pub fn new(store: Arc<dyn StateStore>, cfg: StoreConfig, cancel_cfg: CancelConfig) -> Self {
        ActionStore {
            store,
            cfg,
            cancel_cfg,
            terminal_hook: None,
            fault_reporter: Arc::new(LogFaultReporter),
            truncate_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_terminal_hook(mut self, hook: Arc<dyn TerminalHook>) -> Self {
        self.terminal_hook = Some(hook);
        self
    }

    pub fn with_fault_reporter(mut self, reporter: Arc<dyn FaultReporter>) -> Self {
        self.fault_reporter = reporter;
        self
    }

    /// Persists a newly admitted action.
    pub async fn initialize_new_action(&self, state: &ActionState, timeout: Duration) -> Result<()> {
        let fut = self.retry_on_conflict(|| self.try_initialize_new_action(state));
        match tokio::time::timeout(timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(format!(
                "initialize action {}",
                state.operation_id
            ))),
        }
    }

    /// Persists the in-memory state. A cancellation stored by a caller is carried over onto
    /// `state`, and a terminal record is moved to the history table.
    pub async fn update_action_state(&self, state: &mut ActionState) -> Result<()> {
        let current: &ActionState = state;
        let persisted = self
            .retry_on_conflict(|| self.try_update_action_state(current))
            .await?;
        *state = persisted;

        if state.is_terminal() {
            if let Some(hook) = &self.terminal_hook {
                if let Err(err) = hook.on_terminal(state).await {
                    self.fault_reporter
                        .report_transient_fault(state.operation_id, &err);
                }
            }
        }
        Ok(())
    }

    /// Carries a stored cancellation over onto `state` without writing anything.
    pub async fn refresh_rollback_state(&self, state: &mut ActionState) -> Result<()> {
        let stored = self.get_rollback_state(state.operation_id).await?;
        overlay_cancellation(state, stored);
        Ok(())
    }

    pub async fn get_rollback_state(&self, operation_id: Uuid) -> Result<RollbackState> {
        Ok(self.find_by_operation_id(operation_id).await?.rollback_state)
    }

    pub async fn find_by_operation_id(&self, operation_id: Uuid) -> Result<ActionState> {
        let mut txn = self.store.begin().await?;
        let key = action_key(operation_id);
        if let Some(value) = txn.get(ACTION_TABLE, &key).await? {
            return decode_action(&value);
        }
        if let Some(value) = txn.get(HISTORY_TABLE, &key).await? {
            return decode_action(&value);
        }
        Err(Error::KeyNotFound(operation_id))
    }

    /// Records a caller's cancellation request, the engine observes it at its next check point.
    pub async fn cancel_test_command(&self, operation_id: Uuid, force: bool) -> Result<()> {
        self.retry_on_conflict(|| self.try_cancel_test_command(operation_id, force))
            .await
    }

    /// Returns the records matching both filters ordered by receive time. Empty filters select
    /// everything.
    pub async fn get_selected_actions(
        &self,
        state_filter: TestCommandStateFilter,
        type_filter: TestCommandTypeFilter,
    ) -> Result<Vec<ActionState>> {
        let state_filter = state_filter.normalize();
        let type_filter = type_filter.normalize();

        let mut txn = self.store.begin().await?;
        let mut actions = Vec::new();
        if state_filter.wants_active() {
            actions.extend(scan_actions(&mut *txn, ACTION_TABLE).await?);
        }
        if state_filter.wants_history() {
            actions.extend(scan_actions(&mut *txn, HISTORY_TABLE).await?);
        }
        actions.retain(|state| {
            state_filter.contains(state.progress_state().state_filter())
                && type_filter.intersects(state.action_type().type_filter())
        });
        actions.sort_by_key(|state| state.time_received);
        Ok(actions)
    }

    /// Every record that has not reached a terminal state, oldest first.
    pub async fn get_actions_to_resume(&self) -> Result<Vec<ActionState>> {
        let mut txn = self.store.begin().await?;
        let mut actions = scan_actions(&mut *txn, ACTION_TABLE).await?;
        actions.sort_by_key(|state| state.time_received);
        Ok(actions)
    }

    pub async fn set_node_stopped(&self, node_name: &str, stopped: bool) -> Result<()> {
        self.retry_on_conflict(|| async move {
            let mut txn = self.store.begin().await?;
            mark_node_stopped(&mut *txn, node_name, stopped).await?;
            txn.commit().await
        })
        .await
    }

    pub async fn get_stopped_nodes(&self) -> Result<Vec<String>> {
        let mut txn = self.store.begin().await?;
        let mut nodes = Vec::new();
        for (key, value) in txn.scan(STOPPED_NODE_TABLE).await? {
            if serde_json::from_slice::<bool>(&value)? {
                let name = String::from_utf8(key)
                    .map_err(|_| Error::InvalidData("stopped node name".into()))?;
                nodes.push(name);
            }
        }
        Ok(nodes)
    }

    /// Removes the oldest finished records once the total record count exceeds the configured
    /// maximum. Records that finished within the retention window are kept. Returns the number of
    /// removed records, or zero if another pass is already running.
    pub async fn truncate(&self) -> Result<usize> {
        let _guard = match self.truncate_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("another truncation pass is running");
                return Ok(0);
            }
        };
        let now = Utc::now();
        let removed = self.retry_on_conflict(|| self.try_truncate(now)).await?;
        if removed > 0 {
            STORE_TRUNCATED_TOTAL.inc_by(removed as u64);
            info!(removed, "truncate finished test commands");
        }
        Ok(removed)
    }

    /// Runs [`ActionStore::truncate`] periodically until shutdown.
    pub fn start_truncation(
        self: &Arc<Self>,
        executor: &Executor,
        shutdown: Shutdown,
    ) -> JoinHandle<()> {
        let store = self.clone();
        executor.spawn(None, TaskPriority::Low, async move {
            let mut shutdown = shutdown;
            let mut ticker = Ticker::new(store.cfg.stored_action_cleanup_interval());
            while ticker.tick(&mut shutdown).await {
                if let Err(err) = store.truncate().await {
                    if err.is_propagate() {
                        debug!(err = ?err, "skip truncation");
                    } else {
                        warn!(err = ?err, "truncate finished test commands");
                    }
                }
            }
            info!("truncation task is stopped");
        })
    }
}

impl ActionStore {
    async fn retry_on_conflict<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match f().await {
                Err(Error::TxnConflict(table)) if retries < self.cfg.conflict_retries => {
                    retries += 1;
                    STORE_CONFLICT_RETRY_TOTAL.inc();
                    debug!(table = %table, retries, "retry transaction after conflict");
                }
                r => return r,
            }
        }
    }

    async fn try_initialize_new_action(&self, state: &ActionState) -> Result<()> {
        let mut txn = self.store.begin().await?;
        let key = action_key(state.operation_id);
        if txn.get(ACTION_TABLE, &key).await?.is_some()
            || txn.get(HISTORY_TABLE, &key).await?.is_some()
        {
            return Err(Error::OperationIdAlreadyExists(state.operation_id));
        }
        txn.put(ACTION_TABLE, key, encode_action(state)?).await?;
        txn.commit().await
    }

    async fn try_update_action_state(&self, state: &ActionState) -> Result<ActionState> {
        let mut txn = self.store.begin().await?;
        let key = action_key(state.operation_id);
        let mut state = state.clone();
        if let Some(value) = txn.get(ACTION_TABLE, &key).await? {
            let stored = decode_action(&value)?;
            overlay_cancellation(&mut state, stored.rollback_state);
        }

        if state.is_terminal() {
            txn.delete(ACTION_TABLE, &key).await?;
            txn.put(HISTORY_TABLE, key, encode_action(&state)?).await?;
            apply_node_transition(&mut *txn, &state).await?;
        } else {
            txn.put(ACTION_TABLE, key, encode_action(&state)?).await?;
        }
        txn.commit().await?;

        debug!(
            operation_id = %state.operation_id,
            step = ?state.current_step(),
            rollback = ?state.rollback_state,
            "action state persisted"
        );
        Ok(state)
    }

    async fn try_cancel_test_command(&self, operation_id: Uuid, force: bool) -> Result<()> {
        let mut txn = self.store.begin().await?;
        let key = action_key(operation_id);
        let mut state = match txn.get(ACTION_TABLE, &key).await? {
            Some(value) => decode_action(&value)?,
            None => {
                if txn.get(HISTORY_TABLE, &key).await?.is_none() {
                    return Err(Error::KeyNotFound(operation_id));
                }
                return Err(Error::InvalidTestCommandState(format!(
                    "{operation_id} has already finished"
                )));
            }
        };
        if state.is_terminal() {
            return Err(Error::InvalidTestCommandState(format!(
                "{operation_id} has already finished"
            )));
        }

        let next = match cancel_transition(
            state.rollback_state,
            force,
            self.cancel_cfg.force_requires_graceful_first,
        )? {
            Some(next) => next,
            None => return Ok(()),
        };
        state.rollback_state = next;
        txn.put(ACTION_TABLE, key, encode_action(&state)?).await?;
        txn.commit().await?;
        info!(operation_id = %operation_id, force, "test command cancellation requested");
        Ok(())
    }

    async fn try_truncate(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut txn = self.store.begin().await?;
        let total = txn.count(ACTION_TABLE).await? + txn.count(HISTORY_TABLE).await?;
        if total <= self.cfg.max_stored_action_count {
            return Ok(0);
        }
        let excess = total - self.cfg.max_stored_action_count;

        let keep = chrono::Duration::from_std(self.cfg.completed_action_keep_duration())
            .map_err(|_| Error::InvalidArgument("completed action keep duration".into()))?;
        let deadline = now - keep;
        let mut candidates = scan_actions(&mut *txn, HISTORY_TABLE)
            .await?
            .into_iter()
            .filter(|state| state.stopped_or_received() < deadline)
            .collect::<Vec<_>>();
        candidates.sort_by_key(|state| state.stopped_or_received());
        candidates.truncate(excess);
        if candidates.is_empty() {
            return Ok(0);
        }

        for state in &candidates {
            txn.delete(HISTORY_TABLE, &action_key(state.operation_id))
                .await?;
        }
        txn.commit().await?;
        Ok(candidates.len())
    }
}

/// Decides how a cancel request changes the rollback state of a running record. `None` means
/// the request is already in effect.
pub fn cancel_transition(
    current: RollbackState,
    force: bool,
    force_requires_graceful_first: bool,
) -> Result<Option<RollbackState>> {
    use RollbackState::*;

    match (force, current) {
        (false, RollingBackForce) => Err(Error::InvalidTestCommandState(
            "the command is already being force cancelled".into(),
        )),
        (false, RollingBackDueToUserCancel) => Ok(None),
        (false, _) => Ok(Some(RollingBackDueToUserCancel)),
        (true, RollingBackForce) => Ok(None),
        (true, RollingBackDueToUserCancel) => Ok(Some(RollingBackForce)),
        (true, _) if force_requires_graceful_first => Err(Error::InvalidTestCommandState(
            "force cancel requires a graceful cancel first".into(),
        )),
        (true, _) => Ok(Some(RollingBackForce)),
    }
}

/// A stored force cancel always wins, a stored graceful cancel wins over everything but force.
fn overlay_cancellation(state: &mut ActionState, stored: RollbackState) {
    match stored {
        RollbackState::RollingBackForce => {
            state.rollback_state = RollbackState::RollingBackForce;
        }
        RollbackState::RollingBackDueToUserCancel
            if state.rollback_state != RollbackState::RollingBackForce =>
        {
            state.rollback_state = RollbackState::RollingBackDueToUserCancel;
        }
        _ => {}
    }
}

async fn apply_node_transition(txn: &mut dyn Transaction, state: &ActionState) -> Result<()> {
    if state.current_step() != StepStateNames::CompletedSuccessfully {
        return Ok(());
    }
    match &state.kind {
        ActionKind::StopNode(info) => mark_node_stopped(txn, &info.node_name, true).await,
        ActionKind::StartNode(info) => mark_node_stopped(txn, &info.node_name, false).await,
        _ => Ok(()),
    }
}

async fn mark_node_stopped(
    txn: &mut dyn Transaction,
    node_name: &str,
    stopped: bool,
) -> Result<()> {
    let key = node_name.as_bytes().to_vec();
    if stopped {
        txn.put(STOPPED_NODE_TABLE, key, serde_json::to_vec(&true)?)
            .await
    } else {
        txn.delete(STOPPED_NODE_TABLE, &key).await
    }
}

async fn scan_actions(txn: &mut dyn Transaction, table: &str) -> Result<Vec<ActionState>> {
    txn.scan(table)
        .await?
        .iter()
        .map(|(_, value)| decode_action(value))
        .collect()
}

#[inline]
fn action_key(operation_id: Uuid) -> Vec<u8> {
    operation_id.as_bytes().to_vec()
}

#[inline]
fn encode_action(state: &ActionState) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(state)?)
}

#[inline]
fn decode_action(value: &[u8]) -> Result<ActionState> {
    Ok(serde_json::from_slice(value)?)
}
