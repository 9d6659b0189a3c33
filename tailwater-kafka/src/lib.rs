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

//! Tailwater Kafka - Log Transport for the Producer Pipeline
//!
//! This crate provides the [`kafka::KafkaClient`], an implementation of
//! `tailwater_core::producer::Client` on top of `rdkafka`'s `FutureProducer`.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tailwater_core::producer::ClientBuilder;
//! use tailwater_kafka::kafka::{KafkaClient, KafkaConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = KafkaConfig::builder()
//!         .bootstrap_servers("localhost:9092")
//!         .build()?;
//!
//!     let client = ClientBuilder::new(KafkaClient::new(config)?)
//!         .with_metrics()
//!         .with_logger()
//!         .with_tracer("tailwater")
//!         .build();
//!
//!     // Hand `client` to a tailwater_core::pipeline::Pipeline
//!     # drop(client);
//!     Ok(())
//! }
//! ```

pub mod kafka;
