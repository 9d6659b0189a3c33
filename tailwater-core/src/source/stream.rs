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

//! Live change stream source with resume-on-invalidation.
//!
//! The source is a single task driving [`StreamState`]:
//!
//! ```text
//! Idle -> Opening -> Streaming -> Retrying -> Opening ...
//!            |           |
//!            |           +-> Draining -> Closed
//!            +-> Closed (retry budget exhausted)
//! ```
//!
//! Open failures are retried `max_retries` times with a fixed `retry_delay`.
//! When a streaming cursor dies (zero cursor id, exhaustion or a runtime
//! error) the stream is reopened with `startAfter` set to the resume token of
//! the last document handled, which gives at-least-once delivery around the
//! resume point. Documents still buffered when the server reports a zero
//! cursor id are emitted before the cursor is given up. The `invalidate`
//! event itself is not emitted. With `max_retries == 0` a dead cursor ends
//! the stream instead.
//!
//! Cancellation is checked at every suspension point; on cancellation the
//! cursor is closed and no further reopen is attempted.

use super::{decode, emit, SourceStream};
use crate::collection::{CollectionAdapter, EventCursor, SourceError, WatchOptions};
use crate::config::{WatchConfig, DEFAULT_CHANNEL_BUFFER_SIZE};
use crate::event::ChangeEvent;
use crate::metrics;
use bson::Document;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Tails a collection's change stream.
pub struct StreamSource {
    collection: Arc<dyn CollectionAdapter>,
    config: WatchConfig,
    channel_size: usize,
}

impl StreamSource {
    /// Creates a stream source for the collection.
    pub fn new(collection: Arc<dyn CollectionAdapter>, config: WatchConfig) -> Self {
        Self {
            collection,
            config,
            channel_size: DEFAULT_CHANNEL_BUFFER_SIZE,
        }
    }

    /// Sets the depth of the event channel (minimum 1).
    #[must_use]
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }

    /// Spawns the source task.
    pub fn spawn(self, cancel: CancellationToken) -> SourceStream {
        let (tx, events) = mpsc::channel(self.channel_size);
        let run = StreamRun {
            collection: self.collection,
            config: self.config,
            tx,
            cancel,
            last_token: None,
        };
        let handle = tokio::spawn(run.run());
        SourceStream { events, handle }
    }
}

enum StreamState {
    Idle,
    Opening {
        attempt: u32,
        options: WatchOptions,
    },
    Streaming {
        cursor: Box<dyn EventCursor>,
    },
    Retrying,
    Draining {
        cursor: Box<dyn EventCursor>,
        outcome: Result<(), SourceError>,
    },
    Closed(Result<(), SourceError>),
}

impl StreamState {
    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Opening { .. } => "opening",
            Self::Streaming { .. } => "streaming",
            Self::Retrying => "retrying",
            Self::Draining { .. } => "draining",
            Self::Closed(_) => "closed",
        }
    }
}

// Why a streaming cursor stopped producing.
enum CursorEnd {
    Dead,
    Exhausted,
    Failed(SourceError),
}

struct StreamRun {
    collection: Arc<dyn CollectionAdapter>,
    config: WatchConfig,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
    last_token: Option<Document>,
}

impl StreamRun {
    #[instrument(
        skip(self),
        fields(
            database = %self.collection.database_name(),
            collection = %self.collection.name()
        )
    )]
    async fn run(mut self) -> Result<(), SourceError> {
        let mut state = StreamState::Idle;
        loop {
            debug!(state = state.name(), "Change stream state");
            state = match state {
                StreamState::Idle => {
                    info!(
                        "Initializing change stream for {}.{}",
                        self.collection.database_name(),
                        self.collection.name()
                    );
                    StreamState::Opening {
                        attempt: 0,
                        options: self.config.initial_options(),
                    }
                }
                StreamState::Opening { attempt, options } => self.open(attempt, options).await,
                StreamState::Streaming { cursor } => self.stream(cursor).await,
                StreamState::Retrying => self.retry().await,
                StreamState::Draining {
                    mut cursor,
                    outcome,
                } => {
                    cursor.close().await;
                    StreamState::Closed(outcome)
                }
                StreamState::Closed(outcome) => {
                    info!("Change stream closed");
                    return outcome;
                }
            };
        }
    }

    async fn open(&mut self, attempt: u32, options: WatchOptions) -> StreamState {
        let pipeline = self.config.custom_pipeline.clone();
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return StreamState::Closed(Ok(())),
            opened = self.collection.watch(pipeline, options.clone()) => opened,
        };

        match opened {
            Ok(cursor) => {
                info!(attempt, "Change stream opened");
                StreamState::Streaming { cursor }
            }
            Err(err) if attempt < self.config.max_retries => {
                warn!(
                    attempt = attempt + 1,
                    max_retries = self.config.max_retries,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Failed to open change stream, retrying"
                );
                metrics::increment_stream_retries(self.collection.name());
                if !self.sleep(self.config.retry_delay).await {
                    return StreamState::Closed(Ok(()));
                }
                StreamState::Opening {
                    attempt: attempt + 1,
                    options,
                }
            }
            Err(err) => {
                error!(attempts = attempt + 1, error = %err, "Unable to open change stream");
                StreamState::Closed(Err(SourceError::CursorOpen {
                    attempts: attempt + 1,
                    source: Box::new(err),
                }))
            }
        }
    }

    async fn stream(&mut self, mut cursor: Box<dyn EventCursor>) -> StreamState {
        let end = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                next = cursor.next() => Some(next),
            };
            let Some(next) = next else {
                return StreamState::Draining {
                    cursor,
                    outcome: Ok(()),
                };
            };

            match next {
                Some(Ok(document)) => {
                    if let Some(event) = decode(document) {
                        if event.is_invalidate() {
                            debug!("Change stream invalidated");
                        } else if !emit(&self.tx, event, &self.cancel).await {
                            return StreamState::Draining {
                                cursor,
                                outcome: Ok(()),
                            };
                        }
                    }
                    // Only a handled document may become the resume point.
                    self.capture_token(cursor.as_ref());
                }
                Some(Err(err)) => break CursorEnd::Failed(err),
                None if cursor.is_alive() => break CursorEnd::Exhausted,
                None => break CursorEnd::Dead,
            }
        };

        self.capture_token(cursor.as_ref());
        cursor.close().await;

        match end {
            CursorEnd::Dead => info!(
                resume_token = ?self.last_token,
                "Change stream cursor has been closed by the server"
            ),
            CursorEnd::Exhausted => info!(
                resume_token = ?self.last_token,
                "Change stream cursor exhausted"
            ),
            CursorEnd::Failed(ref err) => warn!(
                error = %err,
                retryable = err.is_retryable(),
                "Change stream cursor failed"
            ),
        }

        if self.config.max_retries == 0 {
            info!("Automatic resume is disabled, ending change stream");
            return match end {
                CursorEnd::Failed(err) => StreamState::Closed(Err(err)),
                CursorEnd::Dead | CursorEnd::Exhausted => StreamState::Closed(Ok(())),
            };
        }

        StreamState::Retrying
    }

    async fn retry(&mut self) -> StreamState {
        warn!(
            delay_ms = self.config.retry_delay.as_millis() as u64,
            "Reopening change stream"
        );
        metrics::increment_stream_retries(self.collection.name());
        if !self.sleep(self.config.retry_delay).await {
            return StreamState::Closed(Ok(()));
        }

        StreamState::Opening {
            attempt: 0,
            options: self.config.resume_options(self.last_token.as_ref()),
        }
    }

    fn capture_token(&mut self, cursor: &dyn EventCursor) {
        if let Some(token) = cursor.resume_token() {
            self.last_token = Some(token);
        }
    }

    // Returns false if cancelled while sleeping.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bson::{doc, oid::ObjectId};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Yields its documents. The server reports a zero cursor id once
    // `dead_after` documents were returned; the rest stay buffered.
    struct ScriptedCursor {
        documents: VecDeque<Document>,
        token: Option<Document>,
        fetched: usize,
        dead_after: usize,
    }

    #[async_trait]
    impl EventCursor for ScriptedCursor {
        async fn next(&mut self) -> Option<Result<Document, SourceError>> {
            let document = self.documents.pop_front()?;
            self.fetched += 1;
            self.token = document.get_document("_id").ok().cloned();
            Some(Ok(document))
        }

        fn is_alive(&self) -> bool {
            self.fetched < self.dead_after
        }

        fn resume_token(&self) -> Option<Document> {
            self.token.clone()
        }

        async fn close(&mut self) {
            self.documents.clear();
        }
    }

    struct FailingCollection {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl CollectionAdapter for FailingCollection {
        async fn aggregate(
            &self,
            _pipeline: Vec<Document>,
        ) -> Result<Box<dyn EventCursor>, SourceError> {
            unreachable!("stream source never aggregates")
        }

        async fn watch(
            &self,
            _pipeline: Vec<Document>,
            _options: WatchOptions,
        ) -> Result<Box<dyn EventCursor>, SourceError> {
            *self.calls.lock().unwrap() += 1;
            Err(SourceError::driver("connection refused"))
        }

        fn name(&self) -> &str {
            "items"
        }

        fn database_name(&self) -> &str {
            "shop"
        }
    }

    fn insert(n: u32) -> Document {
        doc! {
            "_id": { "_data": format!("token-{n}") },
            "operationType": "insert",
            "ns": { "db": "shop", "coll": "items" },
            "documentKey": { "_id": ObjectId::new() },
        }
    }

    #[tokio::test]
    async fn test_open_failure_exhausts_retry_budget() {
        let collection = Arc::new(FailingCollection {
            calls: Mutex::new(0),
        });
        let config = WatchConfig::builder()
            .max_retries(2)
            .retry_delay(Duration::from_millis(1))
            .build()
            .unwrap();

        let mut stream =
            StreamSource::new(collection.clone(), config).spawn(CancellationToken::new());

        assert!(stream.events.recv().await.is_none());
        let err = SourceStream::join(stream.handle).await.unwrap_err();
        assert!(matches!(err, SourceError::CursorOpen { attempts: 3, .. }));
        assert_eq!(*collection.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_delay_closes_stream() {
        let collection = Arc::new(FailingCollection {
            calls: Mutex::new(0),
        });
        let config = WatchConfig::builder()
            .max_retries(10)
            .retry_delay(Duration::from_secs(3600))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let mut stream = StreamSource::new(collection.clone(), config).spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(stream.events.recv().await.is_none());
        assert!(SourceStream::join(stream.handle).await.is_ok());
        assert_eq!(*collection.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_buffered_documents_are_emitted_after_cursor_dies() {
        let cursor = ScriptedCursor {
            documents: VecDeque::from(vec![
                insert(1),
                insert(2),
                doc! { "_id": { "_data": "token-invalidate" }, "operationType": "invalidate" },
            ]),
            token: None,
            fetched: 0,
            dead_after: 2,
        };

        let (tx, mut rx) = mpsc::channel(4);
        let mut run = StreamRun {
            collection: Arc::new(FailingCollection {
                calls: Mutex::new(0),
            }),
            config: WatchConfig::builder().max_retries(0).build().unwrap(),
            tx,
            cancel: CancellationToken::new(),
            last_token: None,
        };

        let next = run.stream(Box::new(cursor)).await;
        assert!(matches!(next, StreamState::Closed(Ok(()))));
        assert_eq!(run.last_token, Some(doc! { "_data": "token-invalidate" }));
        drop(run);

        for n in 1..=2 {
            let emitted = rx.recv().await.unwrap();
            assert_eq!(
                emitted.id,
                Some(bson::Bson::Document(doc! { "_data": format!("token-{n}") }))
            );
        }
        assert!(rx.recv().await.is_none());
    }
}
