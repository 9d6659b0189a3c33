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

//! Bootstrap source: every existing document as a synthetic insert.
//!
//! The scan runs once and is never retried. A failed scan ends the source
//! with [`SourceError::Scan`] and must be restarted by the operator.

use super::{decode, emit, SourceStream};
use crate::collection::{CollectionAdapter, SourceError};
use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;
use crate::event::ChangeEvent;
use bson::{doc, Document};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Scans a collection once.
pub struct ReplaySource {
    collection: Arc<dyn CollectionAdapter>,
    custom_pipeline: Vec<Document>,
    channel_size: usize,
}

impl ReplaySource {
    /// Creates a replay source for the collection.
    pub fn new(collection: Arc<dyn CollectionAdapter>) -> Self {
        Self {
            collection,
            custom_pipeline: Vec::new(),
            channel_size: DEFAULT_CHANNEL_BUFFER_SIZE,
        }
    }

    /// Sets stages run before the projection, e.g. a `$match` bounding the scan.
    #[must_use]
    pub fn custom_pipeline(mut self, stages: Vec<Document>) -> Self {
        self.custom_pipeline = stages;
        self
    }

    /// Sets the depth of the event channel (minimum 1).
    #[must_use]
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }

    /// Returns the full aggregation: custom stages, then the projection of
    /// each document into an insert event marked with `copyingData`.
    pub fn pipeline(&self) -> Vec<Document> {
        let mut pipeline = self.custom_pipeline.clone();
        pipeline.push(doc! {
            "$replaceRoot": {
                "newRoot": {
                    "_id": { "_id": "$_id", "copyingData": true },
                    "operationType": "insert",
                    "ns": {
                        "db": self.collection.database_name(),
                        "coll": self.collection.name(),
                    },
                    "documentKey": { "_id": "$_id" },
                    "fullDocument": "$$ROOT",
                }
            }
        });
        pipeline
    }

    /// Spawns the scan task.
    pub fn spawn(self, cancel: CancellationToken) -> SourceStream {
        let (tx, events) = mpsc::channel(self.channel_size);
        let handle = tokio::spawn(self.run(tx, cancel));
        SourceStream { events, handle }
    }

    #[instrument(
        skip(self, tx, cancel),
        fields(
            database = %self.collection.database_name(),
            collection = %self.collection.name()
        )
    )]
    async fn run(
        self,
        tx: mpsc::Sender<ChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        info!(
            "Replaying {}.{}",
            self.collection.database_name(),
            self.collection.name()
        );

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            opened = self.collection.aggregate(self.pipeline()) => opened,
        };
        let mut cursor = opened.map_err(|e| {
            error!(error = %e, "Unable to start replay scan");
            SourceError::Scan(Box::new(e))
        })?;

        let mut emitted: u64 = 0;
        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = cursor.next() => Some(next),
            };

            match next {
                None => {
                    info!(emitted, "Replay cancelled");
                    break Ok(());
                }
                Some(None) => {
                    info!(emitted, "Replay scan finished");
                    break Ok(());
                }
                Some(Some(Err(e))) => {
                    error!(emitted, error = %e, "Replay scan failed");
                    break Err(SourceError::Scan(Box::new(e)));
                }
                Some(Some(Ok(document))) => {
                    let Some(event) = decode(document) else {
                        continue;
                    };
                    if !emit(&tx, event, &cancel).await {
                        break Ok(());
                    }
                    emitted += 1;
                }
            }
        };

        cursor.close().await;
        outcome
    }
}
