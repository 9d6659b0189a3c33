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

use super::config::{KafkaConfig, KafkaConfigError};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Mutex as StdMutex;
use tailwater_core::message::Message;
use tailwater_core::producer::{Client, DeliveryReport, ProduceError};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// [`Client`] backed by an `rdkafka` [`FutureProducer`].
pub struct KafkaClient {
    producer: FutureProducer,
    config: KafkaConfig,
    deliveries: Mutex<JoinSet<()>>,
    events: StdMutex<Option<broadcast::Sender<DeliveryReport>>>,
}

impl KafkaClient {
    /// Creates the producer. Brokers are contacted lazily.
    ///
    /// # Errors
    ///
    /// [`KafkaConfigError::Client`] if librdkafka rejects the configuration.
    pub fn new(config: KafkaConfig) -> Result<Self, KafkaConfigError> {
        let producer: FutureProducer = config.client_config().create()?;
        let (events, _) = broadcast::channel(config.events_capacity);

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            config,
            deliveries: Mutex::new(JoinSet::new()),
            events: StdMutex::new(Some(events)),
        })
    }

    fn sender(&self) -> Option<broadcast::Sender<DeliveryReport>> {
        self.events.lock().ok().and_then(|events| events.clone())
    }

    fn report(&self, report: DeliveryReport) {
        if let Some(events) = self.sender() {
            // No subscriber is fine.
            let _ = events.send(report);
        }
    }

    /// Enqueues one message and tracks its delivery.
    async fn send(&self, message: Message) {
        let delivery = match self.enqueue(&message).await {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(topic = %message.topic, error = %e, "Unable to enqueue message");
                self.report(DeliveryReport::failed(message.topic, message.key, e));
                return;
            }
        };

        let events = self.sender();
        let mut deliveries = self.deliveries.lock().await;
        while deliveries.try_join_next().is_some() {}
        deliveries.spawn(confirm(delivery, message.topic, message.key, events));
    }

    async fn enqueue(&self, message: &Message) -> Result<DeliveryFuture, ProduceError> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, header| {
                headers.insert(Header {
                    key: &header.key,
                    value: Some(&header.value),
                })
            });

        let mut record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.value)
            .headers(headers);

        loop {
            match self.producer.send_result(record) {
                Ok(delivery) => return Ok(delivery),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    debug!(
                        backoff_ms = self.config.queue_full_backoff.as_millis() as u64,
                        "Producer queue full, backing off"
                    );
                    record = returned;
                    tokio::time::sleep(self.config.queue_full_backoff).await;
                }
                Err((e, _)) => return Err(ProduceError::Enqueue(e.to_string())),
            }
        }
    }
}

async fn confirm(
    delivery: DeliveryFuture,
    topic: String,
    key: Vec<u8>,
    events: Option<broadcast::Sender<DeliveryReport>>,
) {
    let report = match delivery.await {
        Ok(Ok(_)) => DeliveryReport::delivered(topic, key),
        Ok(Err((e, _))) => {
            DeliveryReport::failed(topic, key, ProduceError::Delivery(e.to_string()))
        }
        Err(_) => DeliveryReport::failed(
            topic,
            key,
            ProduceError::Delivery("delivery canceled".to_string()),
        ),
    };

    if let Some(events) = events {
        let _ = events.send(report);
    }
}

#[async_trait]
impl Client for KafkaClient {
    #[instrument(skip_all)]
    async fn produce(&self, mut messages: mpsc::Receiver<Message>) {
        let mut sent: u64 = 0;
        while let Some(message) = messages.recv().await {
            self.send(message).await;
            sent += 1;
        }
        info!(sent, "Produce channel closed");
    }

    fn events(&self) -> broadcast::Receiver<DeliveryReport> {
        match self.sender() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    #[instrument(skip_all)]
    async fn close(&self) {
        info!("Closing Kafka producer");

        let producer = self.producer.clone();
        let timeout = self.config.flush_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => debug!("Kafka producer flushed"),
            Ok(Err(e)) => warn!(error = %e, "Kafka producer flush incomplete"),
            Err(e) => error!(error = %e, "Kafka producer flush task failed"),
        }

        let mut deliveries = self.deliveries.lock().await;
        while let Some(joined) = deliveries.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Delivery confirmation task failed");
            }
        }
        drop(deliveries);

        if let Ok(mut events) = self.events.lock() {
            events.take();
        }
        info!("Kafka producer closed");
    }
}
