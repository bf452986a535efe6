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

//! The orchestration core of the fault analysis service: durable test command records, the
//! step engine that drives them, and the processor that admits and schedules them.

pub mod action;
pub mod action_store;
mod config;
pub mod engine;
mod error;
pub mod metrics;
pub mod node_sync;
pub mod processor;
pub mod runtime;
pub mod store;

pub use async_trait::async_trait;

pub use crate::{
    action_store::{ActionStore, FaultReporter, LogFaultReporter, TerminalHook},
    config::{CancelConfig, Config, EngineConfig, ProcessorConfig, StoreConfig},
    engine::ReliableFaultsEngine,
    error::{Error, ErrorCode, Result},
    node_sync::NodeCommandSynchronizer,
    processor::FaultAnalysisServiceMessageProcessor,
};
