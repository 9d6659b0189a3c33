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

//! Produce and delivery counters.
//!
//! Attempts are counted inline, before a message reaches the wrapped client.
//! Deliveries are counted by a background task reading [`Client::events`],
//! so the two counters are independent and may briefly disagree.

use super::{relay, Client, DeliveryReport};
use crate::message::Message;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long `close` waits for the delivery consumer once the inner client
/// has closed.
const CONSUMER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination for produce counters.
pub trait ProduceRecorder: Send + Sync + 'static {
    /// A message was handed to the transport.
    fn record_produce_attempt(&self, topic: &str);

    /// The broker acknowledged a message.
    fn record_delivery_success(&self, topic: &str);

    /// A message was lost.
    fn record_delivery_error(&self, topic: &str);
}

/// Records through the `metrics` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl ProduceRecorder for MetricsRecorder {
    fn record_produce_attempt(&self, topic: &str) {
        metrics::increment_produce_attempts(topic);
    }

    fn record_delivery_success(&self, topic: &str) {
        metrics::increment_delivery_success(topic);
    }

    fn record_delivery_error(&self, topic: &str) {
        metrics::increment_delivery_errors(topic);
    }
}

/// Counts produce attempts and delivery outcomes.
pub struct Metric<C, R = MetricsRecorder> {
    inner: C,
    recorder: Arc<R>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Client> Metric<C> {
    /// Wraps `inner`, recording through the `metrics` facade.
    ///
    /// Spawns the delivery consumer, so it must be called within a Tokio
    /// runtime.
    pub fn new(inner: C) -> Self {
        Self::with_recorder(inner, Arc::new(MetricsRecorder))
    }
}

impl<C: Client, R: ProduceRecorder> Metric<C, R> {
    /// Wraps `inner`, recording through `recorder`.
    pub fn with_recorder(inner: C, recorder: Arc<R>) -> Self {
        let consumer = tokio::spawn(record_deliveries(inner.events(), recorder.clone()));
        Self {
            inner,
            recorder,
            consumer: Mutex::new(Some(consumer)),
        }
    }
}

async fn record_deliveries<R: ProduceRecorder>(
    mut events: broadcast::Receiver<DeliveryReport>,
    recorder: Arc<R>,
) {
    loop {
        match events.recv().await {
            Ok(report) => match &report.error {
                None => recorder.record_delivery_success(&report.topic),
                Some(e) => {
                    warn!(topic = %report.topic, error = %e, "Message delivery failed");
                    recorder.record_delivery_error(&report.topic);
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Delivery report consumer lagged, reports lost");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Delivery report consumer stopped");
}

#[async_trait]
impl<C: Client, R: ProduceRecorder> Client for Metric<C, R> {
    async fn produce(&self, messages: mpsc::Receiver<Message>) {
        let recorder = &self.recorder;
        relay(&self.inner, messages, |message| {
            recorder.record_produce_attempt(&message.topic);
        })
        .await;
    }

    fn events(&self) -> broadcast::Receiver<DeliveryReport> {
        self.inner.events()
    }

    async fn close(&self) {
        self.inner.close().await;

        let Some(mut consumer) = self.consumer.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(CONSUMER_SHUTDOWN_TIMEOUT, &mut consumer)
            .await
            .is_err()
        {
            warn!("Delivery report consumer did not stop, aborting");
            consumer.abort();
        }
    }
}
