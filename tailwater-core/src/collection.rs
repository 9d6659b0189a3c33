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

//! Collection query adapter.
//!
//! Sources never talk to the driver directly. They go through
//! [`CollectionAdapter`] and [`EventCursor`], which keeps the retry and replay
//! logic testable against in-memory cursors. [`MongoCollection`] is the
//! implementation backed by the official MongoDB driver.
//!
//! A cursor is owned by exactly one source and must be closed on every exit
//! path. Dropping a driver cursor also kills it server side, so `close` is
//! mostly about making the exit explicit.

use async_trait::async_trait;
use bson::{Document, Timestamp};
use futures::StreamExt;
use mongodb::{
    change_stream::{event::ResumeToken, ChangeStream},
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, ClientOptions, FullDocumentType},
    Client, Collection, Cursor,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by sources and collection adapters.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Error reported by the driver (may be retryable)
    #[error("MongoDB error: {message}")]
    Driver {
        message: String,
        /// MongoDB error code
        code: Option<i32>,
        /// MongoDB error labels (e.g., "NetworkError")
        labels: Vec<String>,
    },

    /// The change stream could not be opened within the retry budget
    #[error("failed to open change stream after {attempts} attempt(s): {source}")]
    CursorOpen {
        attempts: u32,
        #[source]
        source: Box<SourceError>,
    },

    /// The replay scan failed
    #[error("replay scan failed: {0}")]
    Scan(#[source] Box<SourceError>),

    /// Invalid options (for example an unusable resume token)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The source task panicked or was aborted
    #[error("source task failed: {0}")]
    Task(String),
}

impl From<MongoError> for SourceError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(&err)
    }
}

impl SourceError {
    /// Creates a driver error from a message, without code or labels.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
            code: None,
            labels: Vec::new(),
        }
    }

    /// Classifies a MongoDB error by its code and labels.
    pub fn from_mongo_error(err: &MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        Self::Driver {
            message: err.to_string(),
            code,
            labels: err.labels().iter().cloned().collect(),
        }
    }

    /// Returns true if the error is transient.
    ///
    /// Labels are checked first, then the transient server codes:
    /// 6, 7, 43, 89, 91, 10107, 11600, 11602, 13435, 13436.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Driver { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "ResumableChangeStreamError"
                        || l == "TransientTransactionError"
                        || l == "NetworkError"
                }) {
                    return true;
                }

                matches!(
                    code,
                    Some(
                        6 | 7 | 43 | 89 | 91 | 10107 | 11600 | 11602 | 13435 | 13436
                    )
                )
            }
            Self::CursorOpen { .. } | Self::Scan(_) | Self::Configuration(_) | Self::Task(_) => {
                false
            }
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Driver { .. } => "driver",
            Self::CursorOpen { .. } => "cursor_open",
            Self::Scan(_) => "scan",
            Self::Configuration(_) => "configuration",
            Self::Task(_) => "task",
        }
    }
}

/// Options for opening a change stream.
///
/// `start_after` and `resume_after` are mutually exclusive on the wire;
/// [`crate::config::WatchConfig`] decides which one is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchOptions {
    /// Server batch size
    pub batch_size: Option<u32>,

    /// Maximum server wait per batch
    pub max_await_time: Option<Duration>,

    /// Request `updateLookup` full documents
    pub full_document: bool,

    /// Resume after this token
    pub resume_after: Option<Document>,

    /// Start after this token
    pub start_after: Option<Document>,

    /// Start at this cluster time
    pub start_at_operation_time: Option<Timestamp>,
}

impl WatchOptions {
    /// Converts these options to the driver's `ChangeStreamOptions`.
    ///
    /// # Errors
    ///
    /// [`SourceError::Configuration`] when a token is not a valid resume token.
    pub fn to_mongo_options(&self) -> Result<ChangeStreamOptions, SourceError> {
        let mut options = ChangeStreamOptions::default();

        if self.full_document {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        options.batch_size = self.batch_size;
        options.max_await_time = self.max_await_time;
        options.start_at_operation_time = self.start_at_operation_time;

        if let Some(token) = &self.start_after {
            options.start_after = Some(to_resume_token(token)?);
        }
        if let Some(token) = &self.resume_after {
            options.resume_after = Some(to_resume_token(token)?);
        }

        Ok(options)
    }
}

// Resume tokens travel as documents; the driver wants its opaque type.
fn to_resume_token(token: &Document) -> Result<ResumeToken, SourceError> {
    let bytes = bson::to_vec(token).map_err(|e| SourceError::Configuration(e.to_string()))?;
    bson::from_slice::<ResumeToken>(&bytes).map_err(|e| SourceError::Configuration(e.to_string()))
}

/// A server-side cursor yielding raw documents.
#[async_trait]
pub trait EventCursor: Send {
    /// Returns the next document, `None` once the cursor is exhausted or dead.
    async fn next(&mut self) -> Option<Result<Document, SourceError>>;

    /// Returns false once the server reported a zero cursor id.
    fn is_alive(&self) -> bool;

    /// Returns the latest resume token, updated after every batch.
    fn resume_token(&self) -> Option<Document>;

    /// Closes the cursor. Calling it twice is harmless.
    async fn close(&mut self);
}

/// Queries a single collection.
#[async_trait]
pub trait CollectionAdapter: Send + Sync {
    /// Runs an aggregation.
    async fn aggregate(&self, pipeline: Vec<Document>)
        -> Result<Box<dyn EventCursor>, SourceError>;

    /// Opens a change stream.
    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: WatchOptions,
    ) -> Result<Box<dyn EventCursor>, SourceError>;

    /// Collection name.
    fn name(&self) -> &str;

    /// Database name.
    fn database_name(&self) -> &str;
}

/// [`CollectionAdapter`] backed by the MongoDB driver.
#[derive(Debug, Clone)]
pub struct MongoCollection {
    collection: Collection<Document>,
    database: String,
}

impl MongoCollection {
    /// Wraps an existing driver collection.
    pub fn new(collection: Collection<Document>) -> Self {
        let database = collection.namespace().db;
        Self {
            collection,
            database,
        }
    }

    /// Connects to MongoDB and selects the collection.
    ///
    /// # Errors
    ///
    /// Returns a driver error if the URI cannot be parsed or the client cannot
    /// be created.
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        server_selection_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(server_selection_timeout);
        let client = Client::with_options(options)?;

        info!("Connected MongoDB client for {}.{}", database, collection);

        Ok(Self::new(client.database(database).collection(collection)))
    }
}

#[async_trait]
impl CollectionAdapter for MongoCollection {
    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
    ) -> Result<Box<dyn EventCursor>, SourceError> {
        debug!(stages = pipeline.len(), "Running aggregation");
        let cursor = self.collection.aggregate(pipeline).await?;
        Ok(Box::new(MongoAggregateCursor {
            inner: Some(cursor),
        }))
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: WatchOptions,
    ) -> Result<Box<dyn EventCursor>, SourceError> {
        debug!(stages = pipeline.len(), ?options, "Opening change stream");
        let stream = self
            .collection
            .watch()
            .pipeline(pipeline)
            .with_options(options.to_mongo_options()?)
            .await?
            .with_type::<Document>();
        Ok(Box::new(MongoChangeStream {
            inner: Some(stream),
        }))
    }

    fn name(&self) -> &str {
        self.collection.name()
    }

    fn database_name(&self) -> &str {
        &self.database
    }
}

struct MongoChangeStream {
    inner: Option<ChangeStream<Document>>,
}

#[async_trait]
impl EventCursor for MongoChangeStream {
    async fn next(&mut self) -> Option<Result<Document, SourceError>> {
        let stream = self.inner.as_mut()?;
        stream.next().await.map(|item| item.map_err(SourceError::from))
    }

    fn is_alive(&self) -> bool {
        self.inner.as_ref().is_some_and(ChangeStream::is_alive)
    }

    fn resume_token(&self) -> Option<Document> {
        let token = self.inner.as_ref()?.resume_token()?;
        bson::to_document(&token).ok()
    }

    async fn close(&mut self) {
        self.inner.take();
    }
}

struct MongoAggregateCursor {
    inner: Option<Cursor<Document>>,
}

#[async_trait]
impl EventCursor for MongoAggregateCursor {
    async fn next(&mut self) -> Option<Result<Document, SourceError>> {
        let cursor = self.inner.as_mut()?;
        let item = cursor.next().await;
        if item.is_none() {
            self.inner = None;
        }
        item.map(|item| item.map_err(SourceError::from))
    }

    fn is_alive(&self) -> bool {
        self.inner.is_some()
    }

    fn resume_token(&self) -> Option<Document> {
        None
    }

    async fn close(&mut self) {
        self.inner.take();
    }
}
