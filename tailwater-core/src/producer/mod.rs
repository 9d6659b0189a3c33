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

//! Producer Client Trait and Decorators
//!
//! This module defines the [`Client`] trait that the log transport implements
//! (see `tailwater-kafka`), plus the decorators stacked on top of it.
//!
//! # Architecture
//!
//! A client consumes a channel of [`Message`]s until the channel closes.
//! Delivery confirmations arrive asynchronously and are published on a
//! broadcast channel of [`DeliveryReport`]s.
//!
//! Decorators own the client they wrap and are clients themselves. Each one
//! reads its input channel, performs its action on every message and forwards
//! it through a small relay channel to the wrapped client. The relay and the
//! inner `produce` run concurrently on the same task.
//!
//! | Decorator | Action |
//! |-----------|--------|
//! | [`Tracer`] | appends `x-tracing: "<app>,<unixSecs>"` |
//! | [`Debugger`] | offers a projection to a [`DebugSink`](crate::debug::DebugSink) |
//! | [`Logger`] | one `info` line per message |
//! | [`Metric`] | counts attempts, and deliveries from [`Client::events`] |
//!
//! Decorators never touch `key` or `value`; they may append headers.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use tailwater_core::producer::{Client, ClientBuilder};
//! # fn example(kafka: impl Client + 'static) {
//! // Metric is innermost, Tracer sees messages first.
//! let client = ClientBuilder::new(kafka)
//!     .with_metrics()
//!     .with_logger()
//!     .with_tracer("tailwater")
//!     .build();
//! # }
//! ```

mod debugger;
mod logger;
mod metric;
mod tracer;

pub use debugger::Debugger;
pub use logger::Logger;
pub use metric::{Metric, MetricsRecorder, ProduceRecorder};
pub use tracer::{tracing_header, Tracer, TRACING_HEADER};

use crate::debug::DebugSink;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Depth of the channel between a decorator and the client it wraps.
pub const RELAY_BUFFER_SIZE: usize = 64;

/// Errors reported by the log transport.
///
/// These never stop the pipeline; a failed message is logged, counted and
/// considered lost.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProduceError {
    /// The message could not be handed to the transport
    #[error("Enqueue failed: {0}")]
    Enqueue(String),

    /// The broker rejected the message or it timed out
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The client was already closed
    #[error("Client is closed")]
    Closed,
}

impl ProduceError {
    /// Returns the error category as a static string for metrics labels.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Enqueue(_) => "enqueue",
            Self::Delivery(_) => "delivery",
            Self::Closed => "closed",
        }
    }
}

/// Outcome of one message delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Topic the message was sent to
    pub topic: String,

    /// Message key
    pub key: Vec<u8>,

    /// `None` when the broker acknowledged the message
    pub error: Option<ProduceError>,
}

impl DeliveryReport {
    /// Creates a successful report.
    pub fn delivered(topic: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            error: None,
        }
    }

    /// Creates a failed report.
    pub fn failed(topic: impl Into<String>, key: impl Into<Vec<u8>>, error: ProduceError) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            error: Some(error),
        }
    }

    /// Returns true if the broker acknowledged the message.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A message sink backed by a log transport.
#[async_trait]
pub trait Client: Send + Sync {
    /// Sends every message from the channel, returning once the channel is
    /// closed and every message has been handed to the transport.
    async fn produce(&self, messages: mpsc::Receiver<Message>);

    /// Subscribes to delivery reports. The channel closes after [`close`](Self::close).
    fn events(&self) -> broadcast::Receiver<DeliveryReport>;

    /// Waits for in-flight deliveries, then releases the transport.
    async fn close(&self);
}

#[async_trait]
impl<C: Client + ?Sized> Client for Box<C> {
    async fn produce(&self, messages: mpsc::Receiver<Message>) {
        (**self).produce(messages).await;
    }

    fn events(&self) -> broadcast::Receiver<DeliveryReport> {
        (**self).events()
    }

    async fn close(&self) {
        (**self).close().await;
    }
}

#[async_trait]
impl<C: Client + ?Sized> Client for Arc<C> {
    async fn produce(&self, messages: mpsc::Receiver<Message>) {
        (**self).produce(messages).await;
    }

    fn events(&self) -> broadcast::Receiver<DeliveryReport> {
        (**self).events()
    }

    async fn close(&self) {
        (**self).close().await;
    }
}

/// Applies `action` to each message, then forwards it to `inner`.
///
/// Returns when `messages` closes and `inner` has consumed the relay.
pub(crate) async fn relay<C, F>(inner: &C, mut messages: mpsc::Receiver<Message>, mut action: F)
where
    C: Client + ?Sized,
    F: FnMut(&mut Message) + Send,
{
    let (tx, rx) = mpsc::channel(RELAY_BUFFER_SIZE);

    let forward = async move {
        while let Some(mut message) = messages.recv().await {
            action(&mut message);
            if tx.send(message).await.is_err() {
                break;
            }
        }
    };

    tokio::join!(forward, inner.produce(rx));
}

/// Composes decorators around a client.
///
/// The first layer added is innermost; the last one sees messages first.
pub struct ClientBuilder {
    client: Box<dyn Client>,
}

impl ClientBuilder {
    /// Starts from the bare transport client.
    pub fn new(client: impl Client + 'static) -> Self {
        Self {
            client: Box::new(client),
        }
    }

    /// Adds a [`Tracer`].
    #[must_use]
    pub fn with_tracer(self, app_name: impl Into<String>) -> Self {
        Self {
            client: Box::new(Tracer::new(self.client, app_name)),
        }
    }

    /// Adds a [`Logger`].
    #[must_use]
    pub fn with_logger(self) -> Self {
        Self {
            client: Box::new(Logger::new(self.client)),
        }
    }

    /// Adds a [`Debugger`] feeding `sink`.
    #[must_use]
    pub fn with_debugger(self, sink: DebugSink) -> Self {
        Self {
            client: Box::new(Debugger::new(self.client, sink)),
        }
    }

    /// Adds a [`Metric`] recording through the `metrics` facade.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn with_metrics(self) -> Self {
        self.with_metrics_recorder(Arc::new(MetricsRecorder))
    }

    /// Adds a [`Metric`] recording through `recorder`.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn with_metrics_recorder<R: ProduceRecorder>(self, recorder: Arc<R>) -> Self {
        Self {
            client: Box::new(Metric::with_recorder(self.client, recorder)),
        }
    }

    /// Returns the composed client.
    pub fn build(self) -> Box<dyn Client> {
        self.client
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A client that records what it was asked to produce.

    use super::*;
    use tokio::sync::Mutex;

    pub(crate) struct RecordingClient {
        pub produced: Arc<Mutex<Vec<Message>>>,
        events: std::sync::Mutex<Option<broadcast::Sender<DeliveryReport>>>,
        fail_topic: Option<String>,
    }

    impl RecordingClient {
        pub(crate) fn new() -> Self {
            let (events, _) = broadcast::channel(64);
            Self {
                produced: Arc::new(Mutex::new(Vec::new())),
                events: std::sync::Mutex::new(Some(events)),
                fail_topic: None,
            }
        }

        pub(crate) fn failing_on(mut self, topic: &str) -> Self {
            self.fail_topic = Some(topic.to_string());
            self
        }
    }

    #[async_trait]
    impl Client for RecordingClient {
        async fn produce(&self, mut messages: mpsc::Receiver<Message>) {
            while let Some(message) = messages.recv().await {
                let report = if self.fail_topic.as_deref() == Some(message.topic.as_str()) {
                    DeliveryReport::failed(
                        &message.topic,
                        message.key.clone(),
                        ProduceError::Delivery("broker down".to_string()),
                    )
                } else {
                    DeliveryReport::delivered(&message.topic, message.key.clone())
                };
                let events = self.events.lock().unwrap().clone();
                if let Some(events) = events {
                    let _ = events.send(report);
                }
                self.produced.lock().await.push(message);
            }
        }

        fn events(&self) -> broadcast::Receiver<DeliveryReport> {
            match self.events.lock().unwrap().as_ref() {
                Some(events) => events.subscribe(),
                None => broadcast::channel(1).1,
            }
        }

        async fn close(&self) {
            self.events.lock().unwrap().take();
        }
    }

    pub(crate) async fn produce_all<C: Client + ?Sized>(client: &C, messages: Vec<Message>) {
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for message in messages {
            tx.send(message).await.unwrap();
        }
        drop(tx);
        client.produce(rx).await;
    }
}
