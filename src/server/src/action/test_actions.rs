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

//! Actions that never touch a cluster, used to exercise the engine.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use tracing::debug;

use super::{ActionKind, ActionState, FabricTestAction, Step, StepStateNames};
use crate::{runtime::Shutdown, Error, Result};

/// Never gets past `PerformingActions` until it is cancelled.
#[derive(Default)]
pub struct StuckAction;

/// Asks for the `PerformingActions` step to be retried a configured number of times, then
/// completes.
pub struct RetryStepAction {
    retries: u32,
    attempts: Arc<AtomicU32>,
}

struct LookingUpStep;

struct StuckStep;

struct RetryStep {
    retries: u32,
    attempts: Arc<AtomicU32>,
}

impl RetryStepAction {
    pub fn new(state: &ActionState) -> Result<Self> {
        match &state.kind {
            ActionKind::RetryStep(info) => Ok(RetryStepAction {
                retries: info.retries,
                attempts: Arc::default(),
            }),
            _ => Err(Error::InvalidArgument(format!(
                "{:?} is not a retry step command",
                state.action_type()
            ))),
        }
    }
}

impl FabricTestAction for StuckAction {
    fn get_step(&self, _state: &ActionState, step: StepStateNames) -> Result<Box<dyn Step>> {
        match step {
            StepStateNames::LookingUpState => Ok(Box::new(LookingUpStep)),
            StepStateNames::PerformingActions => Ok(Box::new(StuckStep)),
            _ => Err(Error::Fatal(format!("stuck action has no step {step:?}"))),
        }
    }
}

impl FabricTestAction for RetryStepAction {
    fn get_step(&self, _state: &ActionState, step: StepStateNames) -> Result<Box<dyn Step>> {
        match step {
            StepStateNames::LookingUpState => Ok(Box::new(LookingUpStep)),
            StepStateNames::PerformingActions => Ok(Box::new(RetryStep {
                retries: self.retries,
                attempts: self.attempts.clone(),
            })),
            _ => Err(Error::Fatal(format!("retry step action has no step {step:?}"))),
        }
    }
}

#[crate::async_trait]
impl Step for LookingUpStep {
    async fn run(&mut self, _state: &mut ActionState, _: &Shutdown) -> Result<StepStateNames> {
        Ok(StepStateNames::PerformingActions)
    }
}

#[crate::async_trait]
impl Step for StuckStep {
    async fn run(&mut self, state: &mut ActionState, _: &Shutdown) -> Result<StepStateNames> {
        debug!(operation_id = %state.operation_id, "stuck action performing");
        Err(Error::RetrySameStep("stuck".to_owned()))
    }
}

#[crate::async_trait]
impl Step for RetryStep {
    async fn run(&mut self, state: &mut ActionState, _: &Shutdown) -> Result<StepStateNames> {
        let attempts = self.attempts.fetch_add(1, Ordering::AcqRel);
        if attempts < self.retries {
            debug!(operation_id = %state.operation_id, attempts, "retry step asks for another attempt");
            return Err(Error::RetrySameStep(format!("attempt {attempts}")));
        }
        Ok(StepStateNames::CompletedSuccessfully)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::{
        action::RetryStepInfo,
        runtime::{ExecutorOwner, ShutdownNotifier},
    };

    #[test]
    fn retry_step_completes_after_retries() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let notifier = ShutdownNotifier::new();
            let shutdown = notifier.subscribe();
            let mut state = ActionState::new(
                Uuid::new_v4(),
                ActionKind::RetryStep(RetryStepInfo { retries: 2 }),
            );
            let action = RetryStepAction::new(&state).unwrap();
            for _ in 0..2 {
                let mut step = action
                    .get_step(&state, StepStateNames::PerformingActions)
                    .unwrap();
                let r = step.run(&mut state, &shutdown).await;
                assert!(matches!(r, Err(Error::RetrySameStep(_))));
            }
            let mut step = action
                .get_step(&state, StepStateNames::PerformingActions)
                .unwrap();
            let next = step.run(&mut state, &shutdown).await.unwrap();
            assert_eq!(next, StepStateNames::CompletedSuccessfully);
        });
    }

    #[test]
    fn retry_step_rejects_other_kinds() {
        let state = ActionState::new(Uuid::new_v4(), ActionKind::Stuck);
        assert!(matches!(
            RetryStepAction::new(&state),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn stuck_has_no_terminal_steps() {
        let state = ActionState::new(Uuid::new_v4(), ActionKind::Stuck);
        assert!(StuckAction
            .get_step(&state, StepStateNames::Failed)
            .is_err());
        assert!(StuckAction
            .get_step(&state, StepStateNames::LookingUpState)
            .is_ok());
    }
}
