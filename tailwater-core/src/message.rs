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

//! The wire unit handed to the producer pipeline.

/// A record header. Header order is preserved on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name
    pub key: String,

    /// Header value (may be empty)
    pub value: Vec<u8>,
}

impl Header {
    /// Creates a header from a name and value.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message to publish on a topic.
///
/// `key` is the document identity, so all changes to one document land on the
/// same partition under key-based routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Destination topic
    pub topic: String,

    /// Record key (document id as UTF-8)
    pub key: Vec<u8>,

    /// Record value (canonical extended JSON change event)
    pub value: Vec<u8>,

    /// Ordered headers
    pub headers: Vec<Header>,
}

impl Message {
    /// Creates a message without headers.
    pub fn new(topic: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
        }
    }

    /// Appends a header after any existing ones.
    pub fn push_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    /// Returns the first header with the given name.
    pub fn header(&self, key: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.key == key)
    }

    /// Returns the key as a string, replacing invalid UTF-8.
    pub fn key_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    /// Returns the value as a string, replacing invalid UTF-8.
    pub fn value_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}
