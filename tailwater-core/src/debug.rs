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

//! Live view of produced messages.
//!
//! The sink holds at most one pending event. Offering an event while the slot
//! is full drops the new event and counts it; production never waits on a
//! debug consumer.

use crate::codec;
use crate::message::Message;
use crate::metrics;
use bson::Bson;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// A produced message, projected for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEvent {
    /// Cluster time of the change, or the time it was seen if absent
    pub timestamp: DateTime<Utc>,

    /// Document id (the message key)
    pub id: String,

    /// Change operation
    pub operation: String,

    /// `updateDescription` for updates, `fullDocument` otherwise
    pub value: Option<serde_json::Value>,
}

/// The collection a sink is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugContext {
    /// Database name
    pub database: String,

    /// Collection name
    pub collection: String,
}

/// Single-slot, drop-newest side channel of [`DebugEvent`]s.
#[derive(Debug, Clone)]
pub struct DebugSink {
    context: Arc<DebugContext>,
    tx: mpsc::Sender<DebugEvent>,
    rx: Arc<Mutex<Option<mpsc::Receiver<DebugEvent>>>>,
}

impl DebugSink {
    /// Creates a sink for the given collection.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            context: Arc::new(DebugContext {
                database: database.into(),
                collection: collection.into(),
            }),
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Returns the watched database and collection.
    pub fn context(&self) -> &DebugContext {
        &self.context
    }

    /// Takes the receiving end. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<DebugEvent>> {
        self.rx.lock().ok()?.take()
    }

    /// Offers a message to the sink. Never blocks.
    pub fn add(&self, message: &Message) {
        let Some(event) = project(message) else {
            return;
        };

        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => metrics::increment_debug_events_dropped(),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn project(message: &Message) -> Option<DebugEvent> {
    let event = match codec::deserialize(&message.value) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "Message value is not a change event, not debugging it");
            return None;
        }
    };

    let value = if event.is_update() {
        event
            .update_description
            .as_ref()
            .and_then(|description| bson::to_bson(description).ok())
    } else {
        event.full_document.clone().map(Bson::Document)
    };

    Some(DebugEvent {
        timestamp: event
            .cluster_time
            .map_or_else(Utc::now, |time| time.to_chrono()),
        id: message.key_lossy().into_owned(),
        operation: event.operation.to_string(),
        value: value.map(Bson::into_relaxed_extjson),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;
    use crate::event::{ChangeEvent, OperationType, UpdateDescription};
    use bson::{doc, oid::ObjectId};

    #[test]
    fn test_update_projects_update_description() {
        let id = ObjectId::new();
        let event = ChangeEvent::builder(OperationType::Update)
            .document_key(doc! { "_id": id })
            .full_document(doc! { "_id": id, "qty": 3 })
            .update_description(UpdateDescription {
                updated_fields: doc! { "qty": 3 },
                removed_fields: vec!["old".to_string()],
                truncated_arrays: None,
                disambiguated_paths: None,
            })
            .cluster_time(bson::DateTime::from_millis(1_623_175_200_000))
            .build();
        let message = Encoder::new("items").encode(event).unwrap();

        let projected = project(&message).unwrap();
        assert_eq!(projected.id, id.to_hex());
        assert_eq!(projected.operation, "update");
        assert_eq!(projected.timestamp.timestamp(), 1_623_175_200);
        assert_eq!(
            projected.value.unwrap()["updatedFields"],
            serde_json::json!({ "qty": 3 })
        );
    }

    #[test]
    fn test_insert_projects_full_document() {
        let id = ObjectId::new();
        let event = ChangeEvent::builder(OperationType::Insert)
            .document_key(doc! { "_id": id })
            .full_document(doc! { "_id": id, "name": "widget" })
            .build();
        let message = Encoder::new("items").encode(event).unwrap();

        let projected = project(&message).unwrap();
        assert_eq!(projected.operation, "insert");
        assert_eq!(projected.value.unwrap()["name"], "widget");
    }

    #[test]
    fn test_non_event_values_are_ignored() {
        let sink = DebugSink::new("shop", "items");
        let mut events = sink.take_events().unwrap();

        sink.add(&Message::new("items", "k", "not json"));

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_events_can_be_taken_once() {
        let sink = DebugSink::new("shop", "items");
        assert_eq!(sink.context().collection, "items");
        assert!(sink.clone().take_events().is_some());
        assert!(sink.take_events().is_none());
    }
}
