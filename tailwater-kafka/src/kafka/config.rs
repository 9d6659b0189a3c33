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

//! Kafka client configuration.

use rdkafka::ClientConfig;
use std::time::Duration;

/// Default maximum message size accepted by the producer (1 MiB).
pub const DEFAULT_MESSAGE_MAX_BYTES: usize = 1_048_576;

/// Default wait before retrying an enqueue on a full local queue.
pub const DEFAULT_QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Default bound on the final flush at close.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the delivery report channel.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Errors raised while configuring or creating the Kafka client.
#[derive(Debug, thiserror::Error)]
pub enum KafkaConfigError {
    /// A required field was not set
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A field has an unusable value
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// librdkafka refused the configuration
    #[error("Unable to create Kafka producer: {0}")]
    Client(#[from] rdkafka::error::KafkaError),
}

/// Configuration for [`KafkaClient`](super::KafkaClient).
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` list (required).
    pub bootstrap_servers: String,

    /// `message.max.bytes` (default: 1 MiB).
    pub message_max_bytes: usize,

    /// Additional librdkafka properties, applied last.
    pub properties: Vec<(String, String)>,

    /// Wait before retrying an enqueue on a full local queue (default: 100ms).
    pub queue_full_backoff: Duration,

    /// Bound on the final flush at close (default: 30s).
    pub flush_timeout: Duration,

    /// Capacity of the delivery report channel (default: 1024).
    pub events_capacity: usize,
}

impl KafkaConfig {
    /// Creates a new builder for `KafkaConfig`.
    #[must_use]
    pub fn builder() -> KafkaConfigBuilder {
        KafkaConfigBuilder::default()
    }

    /// Returns the librdkafka configuration for the producer.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("message.max.bytes", self.message_max_bytes.to_string());
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

/// Builder for [`KafkaConfig`].
#[derive(Debug, Default)]
pub struct KafkaConfigBuilder {
    bootstrap_servers: Option<String>,
    message_max_bytes: Option<usize>,
    properties: Vec<(String, String)>,
    queue_full_backoff: Option<Duration>,
    flush_timeout: Option<Duration>,
    events_capacity: Option<usize>,
}

impl KafkaConfigBuilder {
    /// Sets the bootstrap servers (required).
    #[must_use]
    pub fn bootstrap_servers(mut self, servers: impl Into<String>) -> Self {
        self.bootstrap_servers = Some(servers.into());
        self
    }

    /// Sets `message.max.bytes`.
    #[must_use]
    pub fn message_max_bytes(mut self, bytes: usize) -> Self {
        self.message_max_bytes = Some(bytes);
        self
    }

    /// Adds a librdkafka property. Later values override earlier ones and
    /// the dedicated setters.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Sets the enqueue backoff on a full local queue.
    #[must_use]
    pub fn queue_full_backoff(mut self, backoff: Duration) -> Self {
        self.queue_full_backoff = Some(backoff);
        self
    }

    /// Sets the bound on the final flush at close.
    #[must_use]
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    /// Sets the delivery report channel capacity.
    #[must_use]
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    /// Builds the `KafkaConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap servers are missing or empty, or if
    /// `message_max_bytes` or `events_capacity` is 0.
    pub fn build(self) -> Result<KafkaConfig, KafkaConfigError> {
        let bootstrap_servers = self
            .bootstrap_servers
            .ok_or(KafkaConfigError::MissingField("bootstrap_servers"))?;
        if bootstrap_servers.trim().is_empty() {
            return Err(KafkaConfigError::Invalid {
                field: "bootstrap_servers",
                reason: "cannot be empty".to_string(),
            });
        }

        let message_max_bytes = self.message_max_bytes.unwrap_or(DEFAULT_MESSAGE_MAX_BYTES);
        if message_max_bytes == 0 {
            return Err(KafkaConfigError::Invalid {
                field: "message_max_bytes",
                reason: "must be greater than 0".to_string(),
            });
        }

        let events_capacity = self.events_capacity.unwrap_or(DEFAULT_EVENTS_CAPACITY);
        if events_capacity == 0 {
            return Err(KafkaConfigError::Invalid {
                field: "events_capacity",
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(KafkaConfig {
            bootstrap_servers,
            message_max_bytes,
            properties: self.properties,
            queue_full_backoff: self
                .queue_full_backoff
                .unwrap_or(DEFAULT_QUEUE_FULL_BACKOFF),
            flush_timeout: self.flush_timeout.unwrap_or(DEFAULT_FLUSH_TIMEOUT),
            events_capacity,
        })
    }
}
