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

use tokio::sync::watch;

/// Owns the process-level shutdown signal. Dropping the notifier also fires the signal.
pub struct ShutdownNotifier {
    sender: watch::Sender<bool>,
}

/// A cloneable view of the shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.notify.borrow()
    }

    /// Waits until shutdown is requested or the notifier is gone.
    pub async fn recv(&mut self) {
        loop {
            if *self.notify.borrow_and_update() {
                return;
            }
            if self.notify.changed().await.is_err() {
                return;
            }
        }
    }
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        ShutdownNotifier::default()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            notify: self.sender.subscribe(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }

    pub async fn ctrl_c(self) {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen ctrl c event");
        self.shutdown();
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        ShutdownNotifier { sender }
    }
}

impl Drop for ShutdownNotifier {
    fn drop(&mut self) {
        let _ = self.sender.send(true);
    }
}
