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

mod state;
mod test_actions;

use std::sync::Arc;

pub use self::{
    state::*,
    test_actions::{RetryStepAction, StuckAction},
};
use crate::{
    action_store::ActionStore, node_sync::NodeCommandSynchronizer, runtime::Shutdown, Result,
};

/// One step of a test action.
///
/// `run` performs the step and returns the name of the next one. Returning
/// `Error::RetrySameStep` asks the engine to run the same step again after a backoff, without
/// persisting anything. `cleanup` undoes whatever `run` may have applied and is invoked while the
/// action rolls back; it must be safe to call more than once.
#[crate::async_trait]
pub trait Step: Send {
    async fn run(&mut self, state: &mut ActionState, shutdown: &Shutdown) -> Result<StepStateNames>;

    async fn cleanup(&mut self, _state: &mut ActionState, _shutdown: &Shutdown) -> Result<()> {
        Ok(())
    }
}

/// The concrete fault-injection logic of a test command.
pub trait FabricTestAction: Send + Sync {
    fn get_step(&self, state: &ActionState, step: StepStateNames) -> Result<Box<dyn Step>>;
}

/// The collaborators a concrete action may use.
#[derive(Clone)]
pub struct ActionContext {
    pub node_sync: Arc<NodeCommandSynchronizer>,
    pub action_store: Arc<ActionStore>,
}

/// Builds the concrete actions of the cluster-facing command kinds.
pub trait ActionFactory: Send + Sync {
    fn create(&self, state: &ActionState, ctx: &ActionContext) -> Result<Box<dyn FabricTestAction>>;
}
