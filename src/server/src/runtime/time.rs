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

use tokio::time::{Interval, MissedTickBehavior};

use super::Shutdown;
use crate::{Error, Result};

pub use tokio::time::{sleep, timeout, Instant};

/// Sleeps for `duration`, returns `Error::Shutdown` if shutdown is requested first.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &Shutdown) -> Result<()> {
    if shutdown.is_shutdown() {
        return Err(Error::Shutdown);
    }
    let mut shutdown = shutdown.clone();
    tokio::select! {
        _ = sleep(duration) => Ok(()),
        _ = shutdown.recv() => Err(Error::Shutdown),
    }
}

/// A periodic timer. A tick that was missed while the previous pass was still running is
/// delayed rather than fired in a burst.
pub struct Ticker {
    interval: Interval,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let start = Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ticker { interval }
    }

    /// Waits for the next tick, returns false once shutdown is requested.
    pub async fn tick(&mut self, shutdown: &mut Shutdown) -> bool {
        if shutdown.is_shutdown() {
            return false;
        }
        tokio::select! {
            _ = self.interval.tick() => true,
            _ = shutdown.recv() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecutorOwner, ShutdownNotifier};

    #[test]
    fn sleep_interrupted_by_shutdown() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let notifier = ShutdownNotifier::new();
            let shutdown = notifier.subscribe();
            notifier.shutdown();
            let r = sleep_or_shutdown(Duration::from_secs(3600), &shutdown).await;
            assert!(matches!(r, Err(Error::Shutdown)));
        });
    }

    #[test]
    fn ticker_stops_on_shutdown() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let notifier = ShutdownNotifier::new();
            let mut shutdown = notifier.subscribe();
            let mut ticker = Ticker::new(Duration::from_millis(1));
            assert!(ticker.tick(&mut shutdown).await);
            notifier.shutdown();
            assert!(!ticker.tick(&mut shutdown).await);
        });
    }
}
