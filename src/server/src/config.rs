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

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    runtime::{ExecutorConfig, ExecutorOwner},
    Result,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The number of actions the engine may run at the same time.
    pub concurrent_requests: usize,

    /// The upper bound of records returned by a list query.
    pub max_query_results: usize,

    pub engine: EngineConfig,

    pub store: StoreConfig,

    pub cancel: CancelConfig,

    pub processor: ProcessorConfig,

    pub executor: ExecutorConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub command_step_retry_backoff_ms: u64,

    // A whole-action retry sleeps a random duration in [min, max].
    pub action_retry_backoff_min_ms: u64,
    pub action_retry_backoff_max_ms: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_stored_action_count: usize,
    pub completed_action_keep_duration_secs: u64,
    pub stored_action_cleanup_interval_secs: u64,
    pub conflict_retries: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CancelConfig {
    /// Only a command that is already being cancelled gracefully may be force cancelled.
    pub force_requires_graceful_first: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub reaper_interval_ms: u64,
    pub dequeue_poll_interval_ms: u64,
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Config> {
        Ok(toml::from_str(content)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Builds the runtime the processor and its engine tasks run on.
    pub fn build_executor(&self) -> ExecutorOwner {
        ExecutorOwner::with_config(self.executor.clone())
    }
}

impl EngineConfig {
    #[inline]
    pub fn command_step_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.command_step_retry_backoff_ms)
    }

    /// Returns a random duration inside the configured action retry window.
    pub fn action_retry_backoff(&self) -> Duration {
        use rand::Rng;

        let min = self.action_retry_backoff_min_ms;
        let max = self.action_retry_backoff_max_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl StoreConfig {
    #[inline]
    pub fn completed_action_keep_duration(&self) -> Duration {
        Duration::from_secs(self.completed_action_keep_duration_secs)
    }

    #[inline]
    pub fn stored_action_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.stored_action_cleanup_interval_secs)
    }
}

impl ProcessorConfig {
    #[inline]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    #[inline]
    pub fn dequeue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dequeue_poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            concurrent_requests: 10,
            max_query_results: 10000,
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            cancel: CancelConfig::default(),
            processor: ProcessorConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            command_step_retry_backoff_ms: 1000,
            action_retry_backoff_min_ms: 10_000,
            action_retry_backoff_max_ms: 60_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_stored_action_count: 10000,
            completed_action_keep_duration_secs: 7 * 24 * 60 * 60,
            stored_action_cleanup_interval_secs: 600,
            conflict_retries: 5,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            reaper_interval_ms: 1000,
            dequeue_poll_interval_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempdir::TempDir;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.concurrent_requests, 10);
        assert_eq!(cfg.max_query_results, 10000);
        assert_eq!(cfg.engine.command_step_retry_backoff(), Duration::from_secs(1));
        assert_eq!(cfg.store.max_stored_action_count, 10000);
        assert_eq!(
            cfg.store.completed_action_keep_duration(),
            Duration::from_secs(604800)
        );
        assert!(!cfg.cancel.force_requires_graceful_first);
    }

    #[test]
    fn partial_sections() {
        let content = r#"
            concurrent_requests = 3

            [engine]
            action_retry_backoff_min_ms = 5
            action_retry_backoff_max_ms = 5

            [cancel]
            force_requires_graceful_first = true
        "#;
        let cfg = Config::from_toml_str(content).unwrap();
        assert_eq!(cfg.concurrent_requests, 3);
        assert_eq!(cfg.engine.action_retry_backoff(), Duration::from_millis(5));
        assert_eq!(cfg.engine.command_step_retry_backoff_ms, 1000);
        assert!(cfg.cancel.force_requires_graceful_first);
        assert_eq!(cfg.processor.reaper_interval(), Duration::from_secs(1));
    }

    #[test]
    fn action_retry_backoff_in_window() {
        let cfg = EngineConfig {
            command_step_retry_backoff_ms: 1,
            action_retry_backoff_min_ms: 10,
            action_retry_backoff_max_ms: 20,
        };
        for _ in 0..100 {
            let d = cfg.action_retry_backoff();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[test]
    fn load_from_file() {
        let dir = TempDir::new("fault-analysis-config").unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_query_results = 7").unwrap();
        writeln!(file, "[store]").unwrap();
        writeln!(file, "conflict_retries = 2").unwrap();
        drop(file);

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.max_query_results, 7);
        assert_eq!(cfg.store.conflict_retries, 2);
        assert_eq!(cfg.store.stored_action_cleanup_interval_secs, 600);
    }

    #[test]
    fn executor_section() {
        let content = r#"
            [executor]
            num_threads = 1
            event_interval = 31
        "#;
        let cfg = Config::from_toml_str(content).unwrap();
        assert_eq!(cfg.executor.num_threads, Some(1));
        assert_eq!(cfg.executor.global_event_interval, None);
        let owner = cfg.build_executor();
        assert_eq!(owner.executor().block_on(async { 1 + 1 }), 2);
    }

    #[test]
    fn malformed_config() {
        assert!(matches!(
            Config::from_toml_str("concurrent_requests = \"ten\""),
            Err(crate::Error::Config(_))
        ));
    }
}
