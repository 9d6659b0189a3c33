// Copyright 2025 Tailwater Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

use super::{relay, Client, DeliveryReport};
use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

/// Logs every message at `info` before forwarding it.
pub struct Logger<C> {
    inner: C,
}

impl<C: Client> Logger<C> {
    /// Wraps `inner`.
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: Client> Client for Logger<C> {
    async fn produce(&self, messages: mpsc::Receiver<Message>) {
        relay(&self.inner, messages, |message| {
            info!(
                topic = %message.topic,
                key = %message.key_lossy(),
                value = %message.value_lossy(),
                "Producing message"
            );
        })
        .await;
    }

    fn events(&self) -> broadcast::Receiver<DeliveryReport> {
        self.inner.events()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
