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
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use fault_analysis_server::{
    action::{
        ActionContext, ActionFactory, ActionState, FabricTestAction, Step, StepStateNames,
    },
    runtime::Shutdown,
    Error, ErrorCode, Result,
};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub enum Outcome {
    Next(StepStateNames),
    Transient,
    Fatal,
    Panic,
}

/// The scripted behavior of one action.
#[derive(Default)]
pub struct Script {
    outcomes: Mutex<HashMap<StepStateNames, VecDeque<Outcome>>>,
    // While set, `PerformingActions` asks to be retried.
    hold: AtomicBool,
    cleanups: Mutex<Vec<StepStateNames>>,
}

/// Builds actions whose steps follow a per-operation script. Unscripted steps succeed.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<Uuid, Arc<Script>>>,
    broken: Mutex<HashSet<Uuid>>,
    constructions: Mutex<HashMap<Uuid, usize>>,
}

struct ScriptedAction {
    script: Arc<Script>,
}

struct ScriptedStep {
    script: Arc<Script>,
    name: StepStateNames,
}

impl ScriptedFactory {
    fn script(&self, operation_id: Uuid) -> Arc<Script> {
        self.scripts
            .lock()
            .unwrap()
            .entry(operation_id)
            .or_default()
            .clone()
    }

    pub fn on(&self, operation_id: Uuid, step: StepStateNames, outcomes: Vec<Outcome>) {
        self.script(operation_id)
            .outcomes
            .lock()
            .unwrap()
            .insert(step, outcomes.into_iter().collect());
    }

    pub fn hold(&self, operation_id: Uuid) {
        self.script(operation_id).hold.store(true, Ordering::Release);
    }

    pub fn release(&self, operation_id: Uuid) {
        self.script(operation_id).hold.store(false, Ordering::Release);
    }

    /// The action of this operation can't be constructed.
    pub fn break_construction(&self, operation_id: Uuid) {
        self.broken.lock().unwrap().insert(operation_id);
    }

    /// How many times an action was built for this operation.
    pub fn constructions(&self, operation_id: Uuid) -> usize {
        self.constructions
            .lock()
            .unwrap()
            .get(&operation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn cleanups(&self, operation_id: Uuid) -> Vec<StepStateNames> {
        self.script(operation_id).cleanups.lock().unwrap().clone()
    }
}

impl ActionFactory for ScriptedFactory {
    fn create(&self, state: &ActionState, _: &ActionContext) -> Result<Box<dyn FabricTestAction>> {
        *self
            .constructions
            .lock()
            .unwrap()
            .entry(state.operation_id)
            .or_default() += 1;
        if self.broken.lock().unwrap().contains(&state.operation_id) {
            return Err(Error::InvalidArgument("broken action".into()));
        }
        Ok(Box::new(ScriptedAction {
            script: self.script(state.operation_id),
        }))
    }
}

impl FabricTestAction for ScriptedAction {
    fn get_step(&self, _: &ActionState, name: StepStateNames) -> Result<Box<dyn Step>> {
        Ok(Box::new(ScriptedStep {
            script: self.script.clone(),
            name,
        }))
    }
}

#[fault_analysis_server::async_trait]
impl Step for ScriptedStep {
    async fn run(&mut self, _: &mut ActionState, _: &Shutdown) -> Result<StepStateNames> {
        if self.name == StepStateNames::PerformingActions
            && self.script.hold.load(Ordering::Acquire)
        {
            return Err(Error::RetrySameStep("hold".into()));
        }

        let outcome = self
            .script
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&self.name)
            .and_then(|q| q.pop_front());
        match outcome {
            Some(Outcome::Next(next)) => Ok(next),
            Some(Outcome::Transient) => Err(Error::Cluster(ErrorCode::NotReady, "scripted".into())),
            Some(Outcome::Fatal) => Err(Error::Fatal("scripted".into())),
            Some(Outcome::Panic) => panic!("scripted step panicked"),
            None if self.name == StepStateNames::LookingUpState => {
                Ok(StepStateNames::PerformingActions)
            }
            None => Ok(StepStateNames::CompletedSuccessfully),
        }
    }

    async fn cleanup(&mut self, _: &mut ActionState, _: &Shutdown) -> Result<()> {
        self.script.cleanups.lock().unwrap().push(self.name);
        Ok(())
    }
}
