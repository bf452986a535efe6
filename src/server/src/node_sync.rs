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

use std::{collections::HashSet, sync::Mutex};

use tracing::debug;

use crate::{Error, Result};

/// Guarantees at most one in-flight start/stop command per node.
#[derive(Default)]
pub struct NodeCommandSynchronizer {
    nodes: Mutex<HashSet<String>>,
}

impl NodeCommandSynchronizer {
    pub fn new() -> Self {
        NodeCommandSynchronizer::default()
    }

    pub fn add(&self, node_name: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.insert(node_name.to_owned()) {
            return Err(Error::NodeTransitionInProgress(node_name.to_owned()));
        }
        debug!(node = node_name, "node transition lock acquired");
        Ok(())
    }

    /// Releases the lock of a node.
    ///
    /// # Panics
    ///
    /// Panics if the node is not locked, which means the lock was released twice.
    pub fn remove(&self, node_name: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.remove(node_name) {
            panic!("node {node_name} is released without a transition in progress");
        }
        debug!(node = node_name, "node transition lock released");
    }

    pub fn contains(&self, node_name: &str) -> bool {
        self.nodes.lock().unwrap().contains(node_name)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
