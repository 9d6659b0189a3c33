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
use crate::message::{Header, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

/// Name of the header identifying the producing application.
pub const TRACING_HEADER: &str = "x-tracing";

/// Builds the tracing header: `"<app>,<unix seconds>"`.
pub fn tracing_header(app_name: &str, now: DateTime<Utc>) -> Header {
    Header::new(TRACING_HEADER, format!("{app_name},{}", now.timestamp()))
}

/// Appends the [`TRACING_HEADER`] to every message.
pub struct Tracer<C> {
    inner: C,
    app_name: String,
}

impl<C: Client> Tracer<C> {
    /// Wraps `inner`.
    pub fn new(inner: C, app_name: impl Into<String>) -> Self {
        Self {
            inner,
            app_name: app_name.into(),
        }
    }
}

#[async_trait]
impl<C: Client> Client for Tracer<C> {
    async fn produce(&self, messages: mpsc::Receiver<Message>) {
        let app_name = self.app_name.as_str();
        relay(&self.inner, messages, |message| {
            message.push_header(tracing_header(app_name, Utc::now()));
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
