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

//! Change events to messages.

use crate::codec::Encoder;
use crate::event::ChangeEvent;
use crate::message::Message;
use crate::metrics::{self, SkipReason};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Encodes events on a dedicated task.
///
/// Events that fail validation or serialization are logged, counted and
/// dropped. The output closes when the input closes or the consumer goes away.
#[derive(Debug, Clone)]
pub struct Transformer {
    encoder: Encoder,
    buffer: usize,
}

impl Transformer {
    /// Creates a transformer whose output channel holds `buffer` messages.
    pub fn new(encoder: Encoder, buffer: usize) -> Self {
        Self {
            encoder,
            buffer: buffer.max(1),
        }
    }

    /// Spawns the encoding task.
    pub fn spawn(
        self,
        events: mpsc::Receiver<ChangeEvent>,
    ) -> (mpsc::Receiver<Message>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let handle = tokio::spawn(self.run(events, tx));
        (rx, handle)
    }

    #[instrument(skip_all, fields(topic = %self.encoder.topic()))]
    async fn run(self, mut events: mpsc::Receiver<ChangeEvent>, tx: mpsc::Sender<Message>) {
        while let Some(event) = events.recv().await {
            let operation = event.operation.clone();
            match self.encoder.encode(event) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        debug!("Message consumer gone, stopping transformer");
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        %operation,
                        category = e.category(),
                        error = %e,
                        "Unable to encode change event, skipping"
                    );
                    let reason = if e.is_validation() {
                        SkipReason::Validation
                    } else {
                        SkipReason::Serialization
                    };
                    metrics::increment_events_skipped(reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OperationType;
    use bson::{doc, oid::ObjectId};

    #[tokio::test]
    async fn test_invalid_events_are_dropped() {
        let (tx, events) = mpsc::channel(8);
        let (mut messages, handle) = Transformer::new(Encoder::new("items"), 8).spawn(events);

        let id = ObjectId::new();
        tx.send(ChangeEvent::builder(OperationType::Insert).build())
            .await
            .unwrap();
        tx.send(
            ChangeEvent::builder(OperationType::Delete)
                .document_key(doc! { "_id": ObjectId::from_bytes([0; 12]) })
                .build(),
        )
        .await
        .unwrap();
        tx.send(
            ChangeEvent::builder(OperationType::Delete)
                .document_key(doc! { "_id": id })
                .build(),
        )
        .await
        .unwrap();
        drop(tx);

        let message = messages.recv().await.unwrap();
        assert_eq!(message.key, id.to_hex().into_bytes());
        assert_eq!(message.topic, "items");
        assert!(messages.recv().await.is_none());
        handle.await.unwrap();
    }
}
