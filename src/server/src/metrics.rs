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

use lazy_static::lazy_static;
use prometheus::*;
use prometheus_static_metric::make_static_metric;

use crate::action::{ActionType, TestCommandProgressState};

make_static_metric! {
    pub struct SpawnTotal: IntCounter {
        "priority" => {
            high,
            middle,
            low,
        }
    }
    pub struct ActionTypeTotal: IntCounter {
        "type" => {
            data_loss,
            quorum_loss,
            restart_partition,
            start_node,
            stop_node,
            stuck,
            retry_step,
        }
    }
    pub struct ActionOutcomeTotal: IntCounter {
        "outcome" => {
            completed,
            faulted,
            cancelled,
            force_cancelled,
        }
    }
}

// executor.
lazy_static! {
    pub static ref EXECUTOR_PARK_TOTAL: IntCounter =
        register_int_counter!("executor_park_total", "The total of park() of executor").unwrap();
    pub static ref EXECUTOR_UNPARK_TOTAL: IntCounter =
        register_int_counter!("executor_unpark_total", "The total of unpark() of executor")
            .unwrap();
    pub static ref EXECUTOR_SPAWN_TOTAL_VEC: IntCounterVec = register_int_counter_vec!(
        "executor_spawn_total",
        "The total of spawn of executor",
        &["priority"],
    )
    .unwrap();
    pub static ref EXECUTOR_SPAWN_TOTAL: SpawnTotal = SpawnTotal::from(&EXECUTOR_SPAWN_TOTAL_VEC);
}

// admission.
lazy_static! {
    pub static ref PROCESSOR_ADMIT_TOTAL_VEC: IntCounterVec = register_int_counter_vec!(
        "fault_analysis_processor_admit_total",
        "the total of admitted test commands",
        &["type"],
    )
    .unwrap();
    pub static ref PROCESSOR_ADMIT_TOTAL: ActionTypeTotal =
        ActionTypeTotal::from(&PROCESSOR_ADMIT_TOTAL_VEC);
    pub static ref PROCESSOR_REJECT_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_processor_reject_total",
        "the total of rejected test commands"
    )
    .unwrap();
    pub static ref PROCESSOR_RUNNING_ACTIONS: IntGauge = register_int_gauge!(
        "fault_analysis_processor_running_actions",
        "the number of actions owned by the engine"
    )
    .unwrap();
    pub static ref PROCESSOR_RESUMED_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_processor_resumed_total",
        "the total of actions resumed after a restart or failover"
    )
    .unwrap();
}

// engine.
lazy_static! {
    pub static ref ENGINE_OUTCOME_TOTAL_VEC: IntCounterVec = register_int_counter_vec!(
        "fault_analysis_engine_outcome_total",
        "the total of actions reaching a terminal state",
        &["outcome"],
    )
    .unwrap();
    pub static ref ENGINE_OUTCOME_TOTAL: ActionOutcomeTotal =
        ActionOutcomeTotal::from(&ENGINE_OUTCOME_TOTAL_VEC);
    pub static ref ENGINE_ACTION_RETRY_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_engine_action_retry_total",
        "the total of whole-action retries after a rollback"
    )
    .unwrap();
    pub static ref ENGINE_ROLLBACK_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_engine_rollback_total",
        "the total of rollbacks started"
    )
    .unwrap();
    pub static ref ENGINE_STEP_RETRY_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_engine_step_retry_total",
        "the total of retries of the same step"
    )
    .unwrap();
    pub static ref ENGINE_CLEANUP_RETRY_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_engine_cleanup_retry_total",
        "the total of retried step cleanups"
    )
    .unwrap();
    pub static ref ENGINE_STEP_DURATION_SECONDS: Histogram = register_histogram!(
        "fault_analysis_engine_step_duration_seconds",
        "the duration of running one step of an action",
        exponential_buckets(0.0005, 2.0, 20).unwrap(),
    )
    .unwrap();
}

// store.
lazy_static! {
    pub static ref STORE_TRUNCATED_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_store_truncated_total",
        "the total of history records removed by truncation"
    )
    .unwrap();
    pub static ref STORE_CONFLICT_RETRY_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_store_conflict_retry_total",
        "the total of transactions retried after a conflict"
    )
    .unwrap();
    pub static ref STORE_TRANSIENT_FAULT_TOTAL: IntCounter = register_int_counter!(
        "fault_analysis_store_transient_fault_total",
        "the total of transient faults reported by terminal hooks"
    )
    .unwrap();
}

pub fn take_admit_metrics(action_type: ActionType) {
    let counter = match action_type {
        ActionType::DataLoss => &PROCESSOR_ADMIT_TOTAL.data_loss,
        ActionType::QuorumLoss => &PROCESSOR_ADMIT_TOTAL.quorum_loss,
        ActionType::RestartPartition => &PROCESSOR_ADMIT_TOTAL.restart_partition,
        ActionType::StartNode => &PROCESSOR_ADMIT_TOTAL.start_node,
        ActionType::StopNode => &PROCESSOR_ADMIT_TOTAL.stop_node,
        ActionType::Stuck => &PROCESSOR_ADMIT_TOTAL.stuck,
        ActionType::RetryStep => &PROCESSOR_ADMIT_TOTAL.retry_step,
    };
    counter.inc();
}

pub fn take_outcome_metrics(state: TestCommandProgressState) {
    match state {
        TestCommandProgressState::Completed => ENGINE_OUTCOME_TOTAL.completed.inc(),
        TestCommandProgressState::Faulted => ENGINE_OUTCOME_TOTAL.faulted.inc(),
        TestCommandProgressState::Cancelled => ENGINE_OUTCOME_TOTAL.cancelled.inc(),
        TestCommandProgressState::ForceCancelled => ENGINE_OUTCOME_TOTAL.force_cancelled.inc(),
        TestCommandProgressState::Running | TestCommandProgressState::RollingBack => {}
    }
}
