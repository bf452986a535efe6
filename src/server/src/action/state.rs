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

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStateNames {
    IntentSaved,
    LookingUpState,
    PerformingActions,
    CompletedSuccessfully,
    Failed,
}

impl StepStateNames {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStateNames::CompletedSuccessfully | StepStateNames::Failed
        )
    }
}

/// The steps an action has gone through, used as a stack. It always holds at least the
/// `IntentSaved` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StepStateNames>", into = "Vec<StepStateNames>")]
pub struct StateProgress {
    steps: Vec<StepStateNames>,
}

impl StateProgress {
    pub fn new() -> Self {
        StateProgress {
            steps: vec![StepStateNames::IntentSaved],
        }
    }

    pub fn push(&mut self, step: StepStateNames) {
        self.steps.push(step);
    }

    pub fn peek(&self) -> StepStateNames {
        *self.steps.last().expect("state progress is never empty")
    }

    /// Pops the top step. The last remaining step is never removed, `None` is returned instead.
    pub fn pop(&mut self) -> Option<StepStateNames> {
        if self.steps.len() <= 1 {
            return None;
        }
        self.steps.pop()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[StepStateNames] {
        &self.steps
    }
}

impl Default for StateProgress {
    fn default() -> Self {
        StateProgress::new()
    }
}

impl TryFrom<Vec<StepStateNames>> for StateProgress {
    type Error = String;

    fn try_from(steps: Vec<StepStateNames>) -> Result<Self, Self::Error> {
        if steps.is_empty() {
            return Err("state progress must not be empty".to_owned());
        }
        Ok(StateProgress { steps })
    }
}

impl From<StateProgress> for Vec<StepStateNames> {
    fn from(progress: StateProgress) -> Self {
        progress.steps
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollbackState {
    NotRollingBack,
    RollingBackAndWillRetryAction,
    RollingBackAndWillFailAction,
    RollingBackDueToUserCancel,
    RollingBackForce,
}

impl RollbackState {
    /// Whether the state was set by a caller cancelling the command.
    #[inline]
    pub fn is_cancel(self) -> bool {
        matches!(
            self,
            RollbackState::RollingBackDueToUserCancel | RollbackState::RollingBackForce
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    DataLoss,
    QuorumLoss,
    RestartPartition,
    StartNode,
    StopNode,
    Stuck,
    RetryStep,
}

impl ActionType {
    pub fn type_filter(self) -> TestCommandTypeFilter {
        match self {
            ActionType::DataLoss => TestCommandTypeFilter::DATA_LOSS,
            ActionType::QuorumLoss => TestCommandTypeFilter::QUORUM_LOSS,
            ActionType::RestartPartition => TestCommandTypeFilter::RESTART_PARTITION,
            ActionType::StartNode | ActionType::StopNode => TestCommandTypeFilter::NODE_TRANSITION,
            ActionType::Stuck | ActionType::RetryStep => TestCommandTypeFilter::TEST,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionSelectorKind {
    Singleton,
    Named(String),
    Int64Range(i64),
    Random,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSelector {
    pub service_name: String,
    pub kind: PartitionSelectorKind,
}

impl PartitionSelector {
    pub fn random(service_name: impl Into<String>) -> Self {
        PartitionSelector {
            service_name: service_name.into(),
            kind: PartitionSelectorKind::Random,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLossMode {
    Invalid,
    PartialDataLoss,
    FullDataLoss,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumLossMode {
    Invalid,
    QuorumReplicas,
    AllReplicas,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPartitionMode {
    Invalid,
    AllReplicasOrInstances,
    OnlyActiveSecondaries,
}

/// The partition an attempt resolved its selector to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedPartition {
    pub service_name: String,
    pub partition_id: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLossInfo {
    pub partition_selector: PartitionSelector,
    pub mode: DataLossMode,

    // Re-derived on every forward attempt.
    #[serde(default)]
    pub selected_partition: Option<SelectedPartition>,
    #[serde(default)]
    pub data_loss_number: Option<i64>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumLossInfo {
    pub partition_selector: PartitionSelector,
    pub mode: QuorumLossMode,
    pub quorum_loss_duration: Duration,

    #[serde(default)]
    pub selected_partition: Option<SelectedPartition>,
    #[serde(default)]
    pub replica_ids: Vec<u64>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPartitionInfo {
    pub partition_selector: PartitionSelector,
    pub mode: RestartPartitionMode,

    #[serde(default)]
    pub selected_partition: Option<SelectedPartition>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTransitionInfo {
    pub node_name: String,
    pub node_instance_id: u64,
    /// How long a stopped node stays down, only set for stop commands.
    #[serde(default)]
    pub stop_duration: Option<Duration>,

    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStepInfo {
    /// How many times the performing step asks to be retried before it succeeds.
    pub retries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    DataLoss(DataLossInfo),
    QuorumLoss(QuorumLossInfo),
    RestartPartition(RestartPartitionInfo),
    StartNode(NodeTransitionInfo),
    StopNode(NodeTransitionInfo),
    Stuck,
    RetryStep(RetryStepInfo),
}

impl ActionKind {
    fn clear_info(&mut self) {
        match self {
            ActionKind::DataLoss(info) => {
                info.selected_partition = None;
                info.data_loss_number = None;
                info.result = None;
            }
            ActionKind::QuorumLoss(info) => {
                info.selected_partition = None;
                info.replica_ids.clear();
                info.result = None;
            }
            ActionKind::RestartPartition(info) => {
                info.selected_partition = None;
                info.result = None;
            }
            ActionKind::StartNode(info) | ActionKind::StopNode(info) => {
                info.result = None;
            }
            ActionKind::Stuck | ActionKind::RetryStep(_) => {}
        }
    }
}

/// The durable record of one test command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionState {
    pub operation_id: Uuid,
    pub kind: ActionKind,
    pub state_progress: StateProgress,
    pub rollback_state: RollbackState,
    /// The error that started the current or last rollback.
    pub error_causing_rollback: Option<ErrorCode>,
    pub time_received: DateTime<Utc>,
    pub time_stopped: Option<DateTime<Utc>>,
}

impl ActionState {
    pub fn new(operation_id: Uuid, kind: ActionKind) -> Self {
        ActionState {
            operation_id,
            kind,
            state_progress: StateProgress::new(),
            rollback_state: RollbackState::NotRollingBack,
            error_causing_rollback: None,
            time_received: Utc::now(),
            time_stopped: None,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match &self.kind {
            ActionKind::DataLoss(_) => ActionType::DataLoss,
            ActionKind::QuorumLoss(_) => ActionType::QuorumLoss,
            ActionKind::RestartPartition(_) => ActionType::RestartPartition,
            ActionKind::StartNode(_) => ActionType::StartNode,
            ActionKind::StopNode(_) => ActionType::StopNode,
            ActionKind::Stuck => ActionType::Stuck,
            ActionKind::RetryStep(_) => ActionType::RetryStep,
        }
    }

    /// Node transitions must not be interrupted mid-flight: their failures retry the same step,
    /// and a graceful cancel is ignored until a forced one arrives.
    pub fn retry_step_without_rolling_back_on_failure(&self) -> bool {
        matches!(self.kind, ActionKind::StartNode(_) | ActionKind::StopNode(_))
    }

    #[inline]
    pub fn current_step(&self) -> StepStateNames {
        self.state_progress.peek()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.current_step().is_terminal()
    }

    /// The node a node-transition command targets.
    pub fn node_name(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::StartNode(info) | ActionKind::StopNode(info) => Some(&info.node_name),
            _ => None,
        }
    }

    pub fn clear_info(&mut self) {
        self.kind.clear_info();
    }

    pub fn mark_stopped(&mut self) {
        self.time_stopped = Some(Utc::now());
    }

    /// The time used to age a finished record, falls back to the receive time for records
    /// that never got a stop time.
    pub fn stopped_or_received(&self) -> DateTime<Utc> {
        self.time_stopped.unwrap_or(self.time_received)
    }

    pub fn progress_state(&self) -> TestCommandProgressState {
        match (self.current_step(), self.rollback_state) {
            (StepStateNames::CompletedSuccessfully, _) => TestCommandProgressState::Completed,
            (StepStateNames::Failed, RollbackState::RollingBackDueToUserCancel) => {
                TestCommandProgressState::Cancelled
            }
            (StepStateNames::Failed, RollbackState::RollingBackForce) => {
                TestCommandProgressState::ForceCancelled
            }
            (StepStateNames::Failed, _) => TestCommandProgressState::Faulted,
            (_, RollbackState::NotRollingBack) => TestCommandProgressState::Running,
            _ => TestCommandProgressState::RollingBack,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestCommandProgressState {
    Running,
    RollingBack,
    Completed,
    Faulted,
    Cancelled,
    ForceCancelled,
}

impl TestCommandProgressState {
    pub fn state_filter(self) -> TestCommandStateFilter {
        match self {
            TestCommandProgressState::Running => TestCommandStateFilter::RUNNING,
            TestCommandProgressState::RollingBack => TestCommandStateFilter::ROLLING_BACK,
            TestCommandProgressState::Completed => TestCommandStateFilter::COMPLETED_SUCCESSFULLY,
            TestCommandProgressState::Faulted => TestCommandStateFilter::FAILED,
            TestCommandProgressState::Cancelled => TestCommandStateFilter::CANCELLED,
            TestCommandProgressState::ForceCancelled => TestCommandStateFilter::FORCE_CANCELLED,
        }
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct TestCommandStateFilter: u32 {
        const RUNNING = 0x01;
        const ROLLING_BACK = 0x02;
        const COMPLETED_SUCCESSFULLY = 0x08;
        const FAILED = 0x10;
        const CANCELLED = 0x20;
        const FORCE_CANCELLED = 0x40;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct TestCommandTypeFilter: u32 {
        const DATA_LOSS = 0x01;
        const QUORUM_LOSS = 0x02;
        const RESTART_PARTITION = 0x04;
        const NODE_TRANSITION = 0x08;
        const TEST = 0x10;
    }
}

impl TestCommandStateFilter {
    /// An empty filter selects everything.
    pub fn normalize(self) -> Self {
        if self.is_empty() {
            Self::all()
        } else {
            self
        }
    }

    /// Whether records in the active table can match.
    pub fn wants_active(self) -> bool {
        self.intersects(Self::RUNNING | Self::ROLLING_BACK)
    }

    /// Whether records in the history table can match.
    pub fn wants_history(self) -> bool {
        self.intersects(
            Self::COMPLETED_SUCCESSFULLY | Self::FAILED | Self::CANCELLED | Self::FORCE_CANCELLED,
        )
    }
}

impl TestCommandTypeFilter {
    pub fn normalize(self) -> Self {
        if self.is_empty() {
            Self::all()
        } else {
            self
        }
    }
}

/// One entry of a test command list query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommandQueryResult {
    pub operation_id: Uuid,
    pub action_type: ActionType,
    pub state: TestCommandProgressState,
}

/// The answer to a progress query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCommandProgress {
    pub operation_id: Uuid,
    pub state: TestCommandProgressState,
    /// The caller-facing code of the error that caused the last rollback.
    pub error_code: Option<ErrorCode>,
    pub kind: ActionKind,
    pub time_received: DateTime<Utc>,
    pub time_stopped: Option<DateTime<Utc>>,
}

impl From<&ActionState> for TestCommandQueryResult {
    fn from(state: &ActionState) -> Self {
        TestCommandQueryResult {
            operation_id: state.operation_id,
            action_type: state.action_type(),
            state: state.progress_state(),
        }
    }
}

impl From<&ActionState> for TestCommandProgress {
    fn from(state: &ActionState) -> Self {
        TestCommandProgress {
            operation_id: state.operation_id,
            state: state.progress_state(),
            error_code: state
                .error_causing_rollback
                .map(ErrorCode::translate_for_caller),
            kind: state.kind.clone(),
            time_received: state.time_received,
            time_stopped: state.time_stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop_node() -> ActionState {
        ActionState::new(
            Uuid::new_v4(),
            ActionKind::StopNode(NodeTransitionInfo {
                node_name: "n1".to_owned(),
                node_instance_id: 7,
                stop_duration: Some(Duration::from_secs(60)),
                result: None,
            }),
        )
    }

    #[test]
    fn state_progress_never_empty() {
        let mut progress = StateProgress::new();
        assert_eq!(progress.peek(), StepStateNames::IntentSaved);
        assert_eq!(progress.pop(), None);
        assert_eq!(progress.len(), 1);

        progress.push(StepStateNames::LookingUpState);
        progress.push(StepStateNames::PerformingActions);
        assert_eq!(progress.pop(), Some(StepStateNames::PerformingActions));
        assert_eq!(progress.pop(), Some(StepStateNames::LookingUpState));
        assert_eq!(progress.pop(), None);
        assert_eq!(progress.peek(), StepStateNames::IntentSaved);
    }

    #[test]
    fn empty_progress_is_rejected_on_decode() {
        let r = serde_json::from_str::<StateProgress>("[]");
        assert!(r.is_err());
        let progress: StateProgress = serde_json::from_str(r#"["IntentSaved","Failed"]"#).unwrap();
        assert_eq!(progress.peek(), StepStateNames::Failed);
    }

    #[test]
    fn progress_state_mapping() {
        let mut state = stop_node();
        assert_eq!(state.progress_state(), TestCommandProgressState::Running);

        state.rollback_state = RollbackState::RollingBackAndWillFailAction;
        assert_eq!(state.progress_state(), TestCommandProgressState::RollingBack);

        state.state_progress.push(StepStateNames::Failed);
        assert_eq!(state.progress_state(), TestCommandProgressState::Faulted);

        state.rollback_state = RollbackState::RollingBackDueToUserCancel;
        assert_eq!(state.progress_state(), TestCommandProgressState::Cancelled);

        state.rollback_state = RollbackState::RollingBackForce;
        assert_eq!(
            state.progress_state(),
            TestCommandProgressState::ForceCancelled
        );

        let mut state = stop_node();
        state.state_progress.push(StepStateNames::CompletedSuccessfully);
        assert_eq!(state.progress_state(), TestCommandProgressState::Completed);
    }

    #[test]
    fn node_transition_flags() {
        let state = stop_node();
        assert!(state.retry_step_without_rolling_back_on_failure());
        assert_eq!(state.node_name(), Some("n1"));
        assert_eq!(state.action_type(), ActionType::StopNode);

        let state = ActionState::new(Uuid::new_v4(), ActionKind::Stuck);
        assert!(!state.retry_step_without_rolling_back_on_failure());
        assert_eq!(state.node_name(), None);
    }

    #[test]
    fn clear_info_keeps_arguments() {
        let selector = PartitionSelector::random("fabric:/app/svc");
        let mut state = ActionState::new(
            Uuid::new_v4(),
            ActionKind::DataLoss(DataLossInfo {
                partition_selector: selector.clone(),
                mode: DataLossMode::FullDataLoss,
                selected_partition: Some(SelectedPartition {
                    service_name: "fabric:/app/svc".to_owned(),
                    partition_id: Uuid::new_v4(),
                }),
                data_loss_number: Some(3),
                result: Some("done".to_owned()),
            }),
        );
        state.clear_info();
        match state.kind {
            ActionKind::DataLoss(info) => {
                assert_eq!(info.partition_selector, selector);
                assert_eq!(info.mode, DataLossMode::FullDataLoss);
                assert!(info.selected_partition.is_none());
                assert!(info.data_loss_number.is_none());
                assert!(info.result.is_none());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn filters() {
        assert_eq!(
            TestCommandStateFilter::empty().normalize(),
            TestCommandStateFilter::all()
        );
        assert!(TestCommandStateFilter::RUNNING.wants_active());
        assert!(!TestCommandStateFilter::RUNNING.wants_history());
        assert!(TestCommandStateFilter::CANCELLED.wants_history());
        assert_eq!(
            TestCommandTypeFilter::empty().normalize(),
            TestCommandTypeFilter::all()
        );
        assert!(TestCommandTypeFilter::NODE_TRANSITION.contains(ActionType::StartNode.type_filter()));
    }

    #[test]
    fn progress_translates_error_code() {
        let mut state = stop_node();
        state.error_causing_rollback = Some(ErrorCode::NotReady);
        let progress = TestCommandProgress::from(&state);
        assert_eq!(progress.error_code, Some(ErrorCode::Abort));
    }
}
