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

//! Kafka client for the producer pipeline.
//!
//! Messages are enqueued without waiting for the broker. Each enqueued
//! message gets a small task awaiting its delivery confirmation, which is
//! published as a `DeliveryReport`. When librdkafka's local queue is full the
//! client backs off and retries the enqueue, so back-pressure reaches the
//! produce channel instead of dropping messages.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tailwater_kafka::kafka::KafkaConfig;
//!
//! let config = KafkaConfig::builder()
//!     .bootstrap_servers("broker-1:9092,broker-2:9092")
//!     .message_max_bytes(4 * 1024 * 1024)
//!     .property("compression.type", "zstd")
//!     .flush_timeout(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//! ```

mod client;
pub mod config;

pub use client::KafkaClient;
pub use config::{KafkaConfig, KafkaConfigBuilder, KafkaConfigError};
