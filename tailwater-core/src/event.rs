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

//! MongoDB change event representation.
//!
//! A [`ChangeEvent`] is decoded from the raw documents returned by a change
//! stream (or by the replay aggregation) and is what the codec serializes into
//! a Kafka message value.
//!
//! Field order in the struct is the field order on the wire: the serialized
//! form always starts with `_id` followed by `operationType`.
//!
//! # Examples
//!
//! ```rust
//! use tailwater_core::event::{ChangeEvent, OperationType};
//! use bson::{doc, oid::ObjectId};
//!
//! let id = ObjectId::new();
//! let event = ChangeEvent::builder(OperationType::Insert)
//!     .namespace("shop", "items")
//!     .document_key(doc! { "_id": id })
//!     .full_document(doc! { "_id": id, "name": "lamp" })
//!     .build();
//!
//! assert!(event.is_insert());
//! assert_eq!(event.collection_name(), Some("items"));
//! ```

use bson::{Bson, DateTime, Document};
use serde::{Deserialize, Serialize};

/// MongoDB change stream operation types.
///
/// The `Unknown` variant keeps operation types introduced by newer servers
/// so they can still be forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,

    /// A document was updated in place
    Update,

    /// A document was deleted from a collection
    Delete,

    /// A document was replaced entirely
    Replace,

    /// The change stream was invalidated (collection dropped, renamed, etc.)
    Invalidate,

    /// A collection was dropped
    Drop,

    /// A database was dropped
    #[serde(rename = "dropDatabase")]
    DropDatabase,

    /// A collection was renamed
    Rename,

    /// An operation type this crate does not know about
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns the wire name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Invalidate => "invalidate",
            Self::Drop => "drop",
            Self::DropDatabase => "dropDatabase",
            Self::Rename => "rename",
            Self::Unknown(name) => name,
        }
    }

    /// Returns true if this operation modifies data (insert, update, replace).
    #[inline]
    pub fn is_data_modification(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Replace)
    }

    /// Returns true if this is an unknown operation type.
    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MongoDB namespace, serialized as `{ "db": ..., "coll": ... }`.
///
/// `coll` is absent for database-level events such as `dropDatabase`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    #[serde(rename = "db")]
    pub database: String,

    /// Collection name
    #[serde(rename = "coll", default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: Some(collection.into()),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        match &self.collection {
            Some(collection) => format!("{}.{}", self.database, collection),
            None => self.database.clone(),
        }
    }
}

/// Update description for partial document updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields that were added or modified
    #[serde(rename = "updatedFields", default)]
    pub updated_fields: Document,

    /// Fields that were removed from the document
    #[serde(rename = "removedFields", default)]
    pub removed_fields: Vec<String>,

    /// Array truncations (if any)
    #[serde(rename = "truncatedArrays", default, skip_serializing_if = "Option::is_none")]
    pub truncated_arrays: Option<Vec<TruncatedArray>>,

    /// Paths containing ambiguous dotted field names (MongoDB 6.1+)
    #[serde(
        rename = "disambiguatedPaths",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub disambiguated_paths: Option<Document>,
}

/// Describes the truncation of an array field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncatedArray {
    /// Field path to the array
    pub field: String,

    /// New size of the array after truncation
    #[serde(rename = "newSize")]
    pub new_size: i32,
}

/// A change event as emitted by MongoDB, or synthesized by a replay scan.
///
/// Only `documentKey._id` is required for an event to be publishable; see
/// [`crate::codec::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Identifier of the event itself.
    ///
    /// For live events this is the resume token of the event. Replay events
    /// carry `{ _id: <document id>, copyingData: true }`.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Bson>,

    /// Type of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Full document after the operation
    ///
    /// Present for inserts and replaces, and for updates when full document
    /// lookup is enabled.
    #[serde(rename = "fullDocument", default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Namespace where the operation occurred
    #[serde(rename = "ns", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,

    /// Target namespace of a rename
    #[serde(rename = "to", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Namespace>,

    /// Document key (`_id` and shard key if sharded)
    #[serde(rename = "documentKey", default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Description of an update
    #[serde(
        rename = "updateDescription",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub update_description: Option<UpdateDescription>,

    /// Time of the operation in the oplog, millisecond precision
    #[serde(
        rename = "clusterTime",
        default,
        deserialize_with = "cluster_time::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub cluster_time: Option<DateTime>,

    /// Transaction number, for operations that ran in a transaction
    #[serde(rename = "txnNumber", default, skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<i64>,

    /// Logical session identifier, for operations that ran in a transaction
    #[serde(rename = "lsid", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Document>,
}

impl ChangeEvent {
    /// Starts building an event of the given operation type.
    pub fn builder(operation: OperationType) -> ChangeEventBuilder {
        ChangeEventBuilder {
            event: Self {
                id: None,
                operation,
                full_document: None,
                namespace: None,
                to: None,
                document_key: None,
                update_description: None,
                cluster_time: None,
                txn_number: None,
                session_id: None,
            },
        }
    }

    /// Decodes an event from a raw change stream document.
    ///
    /// # Errors
    ///
    /// Returns the BSON deserialization error when the document does not have
    /// the shape of a change event (for example a missing `operationType`).
    pub fn from_document(document: Document) -> Result<Self, bson::de::Error> {
        bson::from_document(document)
    }

    /// Returns true if this is an insert operation.
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    /// Returns true if this is an update operation.
    #[inline]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    /// Returns true if this is an invalidate operation.
    #[inline]
    pub fn is_invalidate(&self) -> bool {
        self.operation == OperationType::Invalidate
    }

    /// Returns true if the event was synthesized by a replay scan.
    pub fn is_copying_data(&self) -> bool {
        match &self.id {
            Some(Bson::Document(id)) => id.get_bool("copyingData").unwrap_or(false),
            _ => false,
        }
    }

    /// Returns the collection name, if the event carries a namespace.
    pub fn collection_name(&self) -> Option<&str> {
        self.namespace.as_ref()?.collection.as_deref()
    }

    /// Returns the database name, if the event carries a namespace.
    pub fn database_name(&self) -> Option<&str> {
        self.namespace.as_ref().map(|ns| ns.database.as_str())
    }

    /// Returns the raw `documentKey._id` value, if present.
    pub fn document_key_id(&self) -> Option<&Bson> {
        self.document_key.as_ref()?.get("_id")
    }
}

/// Builder for [`ChangeEvent`], mostly useful in tests and replays.
#[derive(Debug, Clone)]
pub struct ChangeEventBuilder {
    event: ChangeEvent,
}

impl ChangeEventBuilder {
    /// Sets the event identifier.
    #[must_use]
    pub fn id(mut self, id: impl Into<Bson>) -> Self {
        self.event.id = Some(id.into());
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn namespace(mut self, database: impl Into<String>, collection: impl Into<String>) -> Self {
        self.event.namespace = Some(Namespace::new(database, collection));
        self
    }

    /// Sets the document key.
    #[must_use]
    pub fn document_key(mut self, key: Document) -> Self {
        self.event.document_key = Some(key);
        self
    }

    /// Sets the full document.
    #[must_use]
    pub fn full_document(mut self, document: Document) -> Self {
        self.event.full_document = Some(document);
        self
    }

    /// Sets the update description.
    #[must_use]
    pub fn update_description(mut self, description: UpdateDescription) -> Self {
        self.event.update_description = Some(description);
        self
    }

    /// Sets the cluster time.
    #[must_use]
    pub fn cluster_time(mut self, time: DateTime) -> Self {
        self.event.cluster_time = Some(time);
        self
    }

    /// Returns the built event.
    #[must_use]
    pub fn build(self) -> ChangeEvent {
        self.event
    }
}

/// `clusterTime` arrives as a BSON timestamp from the server but is carried
/// (and serialized) as a datetime.
mod cluster_time {
    use bson::{Bson, DateTime};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Bson>::deserialize(deserializer)? {
            None | Some(Bson::Null) => Ok(None),
            Some(Bson::Timestamp(ts)) => Ok(Some(DateTime::from_millis(
                i64::from(ts.time) * 1000,
            ))),
            Some(Bson::DateTime(dt)) => Ok(Some(dt)),
            Some(other) => Err(D::Error::custom(format!(
                "unsupported clusterTime type: {:?}",
                other.element_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId, Timestamp};

    #[test]
    fn test_decode_live_update_event() {
        let id = ObjectId::new();
        let raw = doc! {
            "_id": { "_data": "8263A1" },
            "operationType": "update",
            "clusterTime": Timestamp { time: 1_623_175_200, increment: 3 },
            "ns": { "db": "shop", "coll": "items" },
            "documentKey": { "_id": id },
            "updateDescription": {
                "updatedFields": { "price": 12 },
                "removedFields": ["discount"],
                "truncatedArrays": [{ "field": "tags", "newSize": 2 }],
            },
        };

        let event = ChangeEvent::from_document(raw).unwrap();
        assert!(event.is_update());
        assert_eq!(event.collection_name(), Some("items"));
        assert_eq!(event.database_name(), Some("shop"));
        assert_eq!(event.document_key_id(), Some(&Bson::ObjectId(id)));
        assert_eq!(
            event.cluster_time,
            Some(DateTime::from_millis(1_623_175_200_000))
        );
        let update = event.update_description.unwrap();
        assert_eq!(update.removed_fields, vec!["discount".to_string()]);
        assert_eq!(update.truncated_arrays.unwrap()[0].new_size, 2);
    }

    #[test]
    fn test_unknown_operation_is_preserved() {
        let raw = doc! {
            "operationType": "shardCollection",
            "ns": { "db": "shop" },
        };

        let event = ChangeEvent::from_document(raw).unwrap();
        assert_eq!(
            event.operation,
            OperationType::Unknown("shardCollection".to_string())
        );
        assert_eq!(event.operation.as_str(), "shardCollection");
        assert_eq!(event.collection_name(), None);
    }

    #[test]
    fn test_drop_database_wire_name() {
        let raw = doc! { "operationType": "dropDatabase", "ns": { "db": "shop" } };
        let event = ChangeEvent::from_document(raw).unwrap();
        assert_eq!(event.operation, OperationType::DropDatabase);
        assert_eq!(event.operation.to_string(), "dropDatabase");
    }

    #[test]
    fn test_missing_operation_type_fails() {
        assert!(ChangeEvent::from_document(doc! { "documentKey": { "_id": 1 } }).is_err());
    }

    #[test]
    fn test_copying_data_marker() {
        let id = ObjectId::new();
        let replayed = ChangeEvent::builder(OperationType::Insert)
            .id(doc! { "_id": id, "copyingData": true })
            .build();
        let live = ChangeEvent::builder(OperationType::Insert)
            .id(doc! { "_data": "82" })
            .build();

        assert!(replayed.is_copying_data());
        assert!(!live.is_copying_data());
    }

    #[test]
    fn test_namespace_full_name() {
        assert_eq!(Namespace::new("shop", "items").full_name(), "shop.items");
        let db_only = Namespace {
            database: "shop".to_string(),
            collection: None,
        };
        assert_eq!(db_only.full_name(), "shop");
    }
}
