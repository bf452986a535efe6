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

mod mem;

pub use self::mem::MemStore;
use crate::Result;

pub const ACTION_TABLE: &str = "actionTable";
pub const HISTORY_TABLE: &str = "historyTable";
pub const STOPPED_NODE_TABLE: &str = "stoppedNodeTable";

/// A replicated, transactional key-value store made of named tables.
#[crate::async_trait]
pub trait StateStore: Send + Sync {
    /// Begins a new transaction. Fails with `NotPrimary` or `ObjectClosed` when the local
    /// replica can no longer write.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// A transaction over a [`StateStore`]. Writes become visible to other transactions only after
/// a successful [`Transaction::commit`]; dropping a transaction aborts it.
#[crate::async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&mut self, table: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    async fn delete(&mut self, table: &str, key: &[u8]) -> Result<()>;

    /// Returns all live entries of the table, ordered by key.
    async fn scan(&mut self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    async fn count(&mut self, table: &str) -> Result<usize>;

    /// Commits the transaction, returns `TxnConflict` if anything it read has been changed by
    /// another committed transaction.
    async fn commit(self: Box<Self>) -> Result<()>;
}
