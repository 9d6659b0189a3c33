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

//! Validation and wire encoding of change events.
//!
//! The functions here are pure: they never log and never touch shared state.
//! The transform stage decides what to do with their errors.
//!
//! Values are rendered as canonical extended JSON, so 64-bit integers and
//! datetimes keep their exact type (`{"$numberLong": "..."}`,
//! `{"$date": {"$numberLong": "..."}}`) and field order follows the event.
//!
//! ```rust
//! use tailwater_core::codec::{self, Encoder};
//! use tailwater_core::event::{ChangeEvent, OperationType};
//! use bson::{doc, oid::ObjectId};
//!
//! let id = ObjectId::new();
//! let event = ChangeEvent::builder(OperationType::Delete)
//!     .document_key(doc! { "_id": id })
//!     .build();
//!
//! let message = Encoder::new("items").encode(event).unwrap();
//! assert_eq!(message.key, id.to_hex().into_bytes());
//! ```

use crate::event::ChangeEvent;
use crate::message::Message;
use bson::spec::ElementType;
use bson::Bson;
use thiserror::Error;

/// Errors raised while validating or encoding an event.
#[derive(Debug, Error)]
pub enum CodecError {
    /// `documentKey._id` is absent or the zero value of its type
    #[error("documentKey should not be empty")]
    MissingDocumentKey,

    /// `documentKey._id` has a type that cannot be used as a record key
    #[error("unsupported documentKey._id type: {0:?}")]
    UnsupportedDocumentKey(ElementType),

    /// The event could not be rendered to extended JSON
    #[error("failed to serialize change event: {0}")]
    Serialization(String),

    /// A payload could not be parsed back into a change event
    #[error("failed to deserialize change event: {0}")]
    Deserialization(String),
}

impl CodecError {
    /// Returns true for errors caused by the event's document key.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingDocumentKey | Self::UnsupportedDocumentKey(_)
        )
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::MissingDocumentKey | Self::UnsupportedDocumentKey(_) => "validation",
            Self::Serialization(_) => "serialization",
            Self::Deserialization(_) => "deserialization",
        }
    }
}

/// Checks that the event carries a usable `documentKey._id`.
///
/// # Errors
///
/// [`CodecError::MissingDocumentKey`] when the id is absent, null, or the zero
/// value of its type; [`CodecError::UnsupportedDocumentKey`] when it is of a
/// type that has no key rendering.
pub fn validate(event: &ChangeEvent) -> Result<(), CodecError> {
    document_id(event).map(|_| ())
}

/// Renders `documentKey._id` as the record key.
///
/// ObjectIds render as lowercase hex, strings as themselves and integers in
/// decimal.
///
/// # Errors
///
/// Same as [`validate`].
pub fn document_id(event: &ChangeEvent) -> Result<String, CodecError> {
    match event.document_key_id() {
        None | Some(Bson::Null) => Err(CodecError::MissingDocumentKey),
        Some(Bson::ObjectId(oid)) => {
            if oid.bytes() == [0u8; 12] {
                Err(CodecError::MissingDocumentKey)
            } else {
                Ok(oid.to_hex())
            }
        }
        Some(Bson::String(s)) if s.is_empty() => Err(CodecError::MissingDocumentKey),
        Some(Bson::String(s)) => Ok(s.clone()),
        Some(Bson::Int32(0)) | Some(Bson::Int64(0)) => Err(CodecError::MissingDocumentKey),
        Some(Bson::Int32(n)) => Ok(n.to_string()),
        Some(Bson::Int64(n)) => Ok(n.to_string()),
        Some(other) => Err(CodecError::UnsupportedDocumentKey(other.element_type())),
    }
}

/// Serializes the event to canonical extended JSON bytes.
///
/// # Errors
///
/// [`CodecError::Serialization`] when the event contains values that BSON
/// cannot represent.
pub fn serialize(event: &ChangeEvent) -> Result<Vec<u8>, CodecError> {
    let document =
        bson::to_document(event).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let json = Bson::Document(document).into_canonical_extjson();
    serde_json::to_vec(&json).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Parses extended JSON bytes (canonical or relaxed) back into an event.
///
/// # Errors
///
/// [`CodecError::Deserialization`] when the payload is not a JSON object with
/// the shape of a change event.
pub fn deserialize(bytes: &[u8]) -> Result<ChangeEvent, CodecError> {
    let json: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))?;
    match Bson::try_from(json).map_err(|e| CodecError::Deserialization(e.to_string()))? {
        Bson::Document(document) => ChangeEvent::from_document(document)
            .map_err(|e| CodecError::Deserialization(e.to_string())),
        other => Err(CodecError::Deserialization(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
    }
}

/// Turns change events into messages for one topic.
#[derive(Debug, Clone)]
pub struct Encoder {
    topic: String,
    ignore_update_description: bool,
}

impl Encoder {
    /// Creates an encoder for the given topic.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ignore_update_description: false,
        }
    }

    /// Drops `updateDescription` from serialized values.
    ///
    /// This only trims the payload; update events are still emitted.
    #[must_use]
    pub fn ignore_update_description(mut self, ignore: bool) -> Self {
        self.ignore_update_description = ignore;
        self
    }

    /// Returns the destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Validates and serializes the event into a header-less message.
    ///
    /// # Errors
    ///
    /// Any error from [`document_id`] or [`serialize`].
    pub fn encode(&self, mut event: ChangeEvent) -> Result<Message, CodecError> {
        let key = document_id(&event)?;
        if self.ignore_update_description {
            event.update_description = None;
        }
        let value = serialize(&event)?;
        Ok(Message::new(self.topic.clone(), key, value))
    }
}
