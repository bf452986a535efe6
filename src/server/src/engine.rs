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

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    action::{ActionState, FabricTestAction, RollbackState, StepStateNames},
    action_store::ActionStore,
    config::EngineConfig,
    metrics::*,
    node_sync::NodeCommandSynchronizer,
    runtime::{time::sleep_or_shutdown, Shutdown},
    Error, Result,
};

enum PassOutcome {
    Finished,
    RetryAction,
}

/// Drives an action through its steps, persisting every transition, until it reaches
/// `CompletedSuccessfully` or `Failed`.
pub struct ReliableFaultsEngine {
    action_store: Arc<ActionStore>,
    node_sync: Arc<NodeCommandSynchronizer>,
    cfg: EngineConfig,
}

impl ReliableFaultsEngine {
    pub fn new(
        action_store: Arc<ActionStore>,
        node_sync: Arc<NodeCommandSynchronizer>,
        cfg: EngineConfig,
    ) -> Self {
        ReliableFaultsEngine {
            action_store,
            node_sync,
            cfg,
        }
    }

    /// Runs the action to a terminal state and returns the final record.
    ///
    /// Only propagate-class errors (not primary, object closed, shutdown) are returned. They
    /// leave the last persisted state behind for the next primary to resume.
    pub async fn run(
        &self,
        action: Box<dyn FabricTestAction>,
        mut state: ActionState,
        shutdown: Shutdown,
    ) -> Result<ActionState> {
        let operation_id = state.operation_id;
        info!(
            operation_id = %operation_id,
            action_type = ?state.action_type(),
            step = ?state.current_step(),
            "engine starts running action"
        );

        match self.run_action(action.as_ref(), &mut state, &shutdown).await {
            Ok(()) => {
                if let Some(node_name) = state.node_name() {
                    self.node_sync.remove(node_name);
                }
                take_outcome_metrics(state.progress_state());
                info!(
                    operation_id = %operation_id,
                    state = ?state.progress_state(),
                    err = ?state.error_causing_rollback,
                    "engine finished action"
                );
                Ok(state)
            }
            Err(err) => {
                if err.is_propagate() {
                    info!(operation_id = %operation_id, err = ?err, "engine stops running action");
                } else {
                    error!(operation_id = %operation_id, err = ?err, "engine run action");
                }
                Err(err)
            }
        }
    }

    async fn run_action(
        &self,
        action: &dyn FabricTestAction,
        state: &mut ActionState,
        shutdown: &Shutdown,
    ) -> Result<()> {
        loop {
            if state.is_terminal() {
                return Ok(());
            }
            if state.rollback_state == RollbackState::RollingBackForce {
                return self.force_fail(state, shutdown).await;
            }

            match self.run_pass(action, state, shutdown).await? {
                PassOutcome::Finished => return Ok(()),
                PassOutcome::RetryAction => {
                    ENGINE_ACTION_RETRY_TOTAL.inc();
                    state.rollback_state = RollbackState::NotRollingBack;
                    state.error_causing_rollback = None;
                    self.persist(state, shutdown).await?;

                    let backoff = self.cfg.action_retry_backoff();
                    info!(
                        operation_id = %state.operation_id,
                        backoff = ?backoff,
                        "action rolled back, retry it later"
                    );
                    sleep_or_shutdown(backoff, shutdown).await?;
                }
            }
        }
    }

    async fn run_pass(
        &self,
        action: &dyn FabricTestAction,
        state: &mut ActionState,
        shutdown: &Shutdown,
    ) -> Result<PassOutcome> {
        // Forward.
        loop {
            self.refresh(state, shutdown).await?;
            match state.rollback_state {
                RollbackState::RollingBackForce => {
                    self.force_fail(state, shutdown).await?;
                    return Ok(PassOutcome::Finished);
                }
                RollbackState::RollingBackDueToUserCancel
                    if !state.retry_step_without_rolling_back_on_failure() =>
                {
                    break
                }
                RollbackState::RollingBackAndWillFailAction
                | RollbackState::RollingBackAndWillRetryAction => break,
                _ => {}
            }

            let step = state.current_step();
            if step.is_terminal() {
                return Ok(PassOutcome::Finished);
            }
            match self.run_step(action, state, step, shutdown).await {
                Ok(next) => {
                    debug!(operation_id = %state.operation_id, step = ?step, next = ?next, "step finished");
                    state.state_progress.push(next);
                    if next.is_terminal() {
                        state.mark_stopped();
                    }
                    self.persist(state, shutdown).await?;
                    if next.is_terminal() {
                        return Ok(PassOutcome::Finished);
                    }
                }
                Err(Error::RetrySameStep(reason)) => {
                    ENGINE_STEP_RETRY_TOTAL.inc();
                    debug!(operation_id = %state.operation_id, step = ?step, reason = %reason, "retry same step");
                    sleep_or_shutdown(self.cfg.command_step_retry_backoff(), shutdown).await?;
                }
                Err(err) if err.is_propagate() => return Err(err),
                Err(err) => {
                    let retryable = is_retryable(&err);
                    if retryable && state.retry_step_without_rolling_back_on_failure() {
                        ENGINE_STEP_RETRY_TOTAL.inc();
                        warn!(operation_id = %state.operation_id, step = ?step, err = ?err, "step failed, retry it");
                        sleep_or_shutdown(self.cfg.command_step_retry_backoff(), shutdown).await?;
                        continue;
                    }

                    ENGINE_ROLLBACK_TOTAL.inc();
                    warn!(
                        operation_id = %state.operation_id,
                        step = ?step,
                        retryable,
                        err = ?err,
                        "step failed, roll back action"
                    );
                    state.rollback_state = if retryable {
                        RollbackState::RollingBackAndWillRetryAction
                    } else {
                        RollbackState::RollingBackAndWillFailAction
                    };
                    state.error_causing_rollback = Some(err.error_code());
                    self.persist(state, shutdown).await?;
                    break;
                }
            }
        }

        // Rollback.
        loop {
            self.refresh(state, shutdown).await?;
            if state.rollback_state == RollbackState::RollingBackForce {
                self.force_fail(state, shutdown).await?;
                return Ok(PassOutcome::Finished);
            }

            let step = state.current_step();
            if step == StepStateNames::IntentSaved {
                break;
            }
            if step.is_terminal() {
                return Ok(PassOutcome::Finished);
            }
            match self.cleanup_step(action, state, step, shutdown).await {
                Ok(()) => {
                    debug!(operation_id = %state.operation_id, step = ?step, "step cleaned up");
                    state.state_progress.pop();
                    self.persist(state, shutdown).await?;
                }
                Err(err) if err.is_propagate() => return Err(err),
                Err(err) => {
                    ENGINE_CLEANUP_RETRY_TOTAL.inc();
                    warn!(operation_id = %state.operation_id, step = ?step, err = ?err, "cleanup step, retry it");
                    sleep_or_shutdown(self.cfg.command_step_retry_backoff(), shutdown).await?;
                }
            }
        }

        if state.rollback_state == RollbackState::RollingBackAndWillRetryAction {
            state.clear_info();
            state.state_progress.push(StepStateNames::LookingUpState);
            return Ok(PassOutcome::RetryAction);
        }
        state.state_progress.push(StepStateNames::Failed);
        state.mark_stopped();
        self.persist(state, shutdown).await?;
        Ok(PassOutcome::Finished)
    }

    async fn run_step(
        &self,
        action: &dyn FabricTestAction,
        state: &mut ActionState,
        step: StepStateNames,
        shutdown: &Shutdown,
    ) -> Result<StepStateNames> {
        let _timer = ENGINE_STEP_DURATION_SECONDS.start_timer();
        let mut step = action.get_step(state, step)?;
        step.run(state, shutdown).await
    }

    async fn cleanup_step(
        &self,
        action: &dyn FabricTestAction,
        state: &mut ActionState,
        step: StepStateNames,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let mut step = action.get_step(state, step)?;
        step.cleanup(state, shutdown).await
    }

    /// A forced cancel skips every cleanup.
    async fn force_fail(&self, state: &mut ActionState, shutdown: &Shutdown) -> Result<()> {
        info!(operation_id = %state.operation_id, step = ?state.current_step(), "action is force cancelled");
        state.rollback_state = RollbackState::RollingBackForce;
        state.state_progress.push(StepStateNames::Failed);
        state.mark_stopped();
        self.persist(state, shutdown).await
    }

    /// Persists the state, retrying failures other than propagate-class ones.
    async fn persist(&self, state: &mut ActionState, shutdown: &Shutdown) -> Result<()> {
        loop {
            match self.action_store.update_action_state(state).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_propagate() => return Err(err),
                Err(err) => {
                    warn!(operation_id = %state.operation_id, err = ?err, "persist action state, retry it");
                    sleep_or_shutdown(self.cfg.command_step_retry_backoff(), shutdown).await?;
                }
            }
        }
    }

    async fn refresh(&self, state: &mut ActionState, shutdown: &Shutdown) -> Result<()> {
        loop {
            match self.action_store.refresh_rollback_state(state).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_propagate() => return Err(err),
                Err(err) => {
                    warn!(operation_id = %state.operation_id, err = ?err, "read rollback state, retry it");
                    sleep_or_shutdown(self.cfg.command_step_retry_backoff(), shutdown).await?;
                }
            }
        }
    }
}

/// Whether a step failure is worth rolling back and running the whole action again.
pub fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Fatal(_) => false,
        Error::RollbackAndRetryCommand(_) | Error::Cancelled => true,
        Error::Cluster(code, _) => code.is_transient(),
        _ => false,
    }
}
