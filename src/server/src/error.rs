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

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("operation {0} already exists")]
    OperationIdAlreadyExists(Uuid),

    #[error("operation {0} not found")]
    KeyNotFound(Uuid),

    #[error("invalid test command state: {0}")]
    InvalidTestCommandState(String),

    #[error("node {0} is already under transition")]
    NodeTransitionInProgress(String),

    // Step outcomes.
    #[error("retry same step: {0}")]
    RetrySameStep(String),

    #[error("rollback and retry command: {0}")]
    RollbackAndRetryCommand(String),

    #[error("fatal {0}")]
    Fatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("cluster {0:?}: {1}")]
    Cluster(ErrorCode, String),

    // Errors must be propagated to the caller without classification.
    #[error("not primary")]
    NotPrimary,

    #[error("object closed")]
    ObjectClosed,

    #[error("service is shutting down")]
    Shutdown,

    #[error("timeout {0}")]
    Timeout(String),

    #[error("transaction conflict on {0}")]
    TxnConflict(String),

    #[error("store {0}")]
    Store(String),

    #[error("invalid {0} data")]
    InvalidData(String),

    #[error("serde {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config {0}")]
    Config(#[from] toml::de::Error),

    #[error("io {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The error codes surfaced to callers of the test command APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Abort,
    Fail,
    InvalidArgument,
    NotReady,
    OperationTimedOut,
    OperationCanceled,
    ReplicaDoesNotExist,
    InvalidAddress,
    InvalidReplicaStateForReplicaOperation,
    NotPrimary,
    ObjectClosed,
    KeyNotFound,
    TestCommandOperationIdAlreadyExists,
    InvalidTestCommandState,
    NodeTransitionInProgress,
    NodeNotFound,
    PartitionNotFound,
    ServiceDoesNotExist,
}

impl ErrorCode {
    /// The cluster errors that are worth rolling back and retrying the whole command for.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::NotReady
                | ErrorCode::OperationTimedOut
                | ErrorCode::ReplicaDoesNotExist
                | ErrorCode::InvalidAddress
                | ErrorCode::InvalidReplicaStateForReplicaOperation
        )
    }

    /// Maps an internal error code to the one reported by progress queries.
    pub fn translate_for_caller(self) -> ErrorCode {
        match self {
            ErrorCode::NotReady => ErrorCode::Abort,
            code => code,
        }
    }
}

impl Error {
    /// Not-primary and object-closed errors abort the current loop immediately, the action is
    /// picked up again after the next primary resumes pending actions.
    pub fn is_propagate(&self) -> bool {
        matches!(self, Error::NotPrimary | Error::ObjectClosed | Error::Shutdown)
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::OperationIdAlreadyExists(_) => ErrorCode::TestCommandOperationIdAlreadyExists,
            Error::KeyNotFound(_) => ErrorCode::KeyNotFound,
            Error::InvalidTestCommandState(_) => ErrorCode::InvalidTestCommandState,
            Error::NodeTransitionInProgress(_) => ErrorCode::NodeTransitionInProgress,
            Error::Cancelled => ErrorCode::OperationCanceled,
            Error::Cluster(code, _) => *code,
            Error::NotPrimary => ErrorCode::NotPrimary,
            Error::ObjectClosed => ErrorCode::ObjectClosed,
            Error::Timeout(_) => ErrorCode::OperationTimedOut,
            Error::Shutdown => ErrorCode::Abort,
            Error::RetrySameStep(_)
            | Error::RollbackAndRetryCommand(_)
            | Error::Fatal(_)
            | Error::TxnConflict(_)
            | Error::Store(_)
            | Error::InvalidData(_)
            | Error::Serde(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorCode::Fail,
        }
    }
}
