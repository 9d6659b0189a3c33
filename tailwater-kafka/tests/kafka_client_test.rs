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

//! Kafka client tests.
//!
//! Tests marked `#[ignore]` need a broker on `localhost:9092`:
//!
//! ```bash
//! docker run -d -p 9092:9092 apache/kafka:3.7.0
//! cargo test -p tailwater-kafka -- --ignored
//! ```

use std::time::Duration;
use tailwater_core::message::{Header, Message};
use tailwater_core::producer::Client;
use tailwater_kafka::kafka::{KafkaClient, KafkaConfig};
use tokio::sync::{broadcast::error::RecvError, mpsc};

fn config() -> KafkaConfig {
    KafkaConfig::builder()
        .bootstrap_servers("localhost:9092")
        .property("message.timeout.ms", "5000")
        .flush_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_close_without_messages_closes_events() {
    let client = KafkaClient::new(config()).unwrap();
    let mut events = client.events();

    client.close().await;

    assert!(matches!(events.recv().await, Err(RecvError::Closed)));
}

#[tokio::test]
#[ignore = "requires Kafka on localhost:9092"]
async fn test_produce_reports_deliveries() {
    let client = KafkaClient::new(config()).unwrap();
    let mut events = client.events();

    let (tx, rx) = mpsc::channel(8);
    for i in 0..3 {
        let mut message = Message::new("tailwater-test", format!("key-{i}"), "{}");
        message.push_header(Header::new("x-tracing", "tailwater-test,0"));
        tx.send(message).await.unwrap();
    }
    drop(tx);

    client.produce(rx).await;
    client.close().await;

    let mut delivered = 0;
    loop {
        match events.recv().await {
            Ok(report) => {
                assert!(report.is_success(), "delivery failed: {:?}", report.error);
                delivered += 1;
            }
            Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(_)) => unreachable!(),
        }
    }
    assert_eq!(delivered, 3);
}
