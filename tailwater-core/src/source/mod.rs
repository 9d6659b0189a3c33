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

//! Change event sources.
//!
//! A source owns its cursor and the sending half of the event channel. When
//! the source task returns, the sender is dropped, which is how consumers see
//! end-of-stream. The task's result tells the orchestrator whether the source
//! ended cleanly.
//!
//! - [`StreamSource`] tails a change stream and resumes it when the server
//!   kills the cursor.
//! - [`ReplaySource`] scans the collection once and emits every document as
//!   a synthetic insert.

mod replay;
mod stream;

pub use replay::ReplaySource;
pub use stream::StreamSource;

use crate::collection::SourceError;
use crate::event::ChangeEvent;
use crate::metrics::{self, SkipReason};
use bson::Document;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The running half of a source: its events and its outcome.
#[derive(Debug)]
pub struct SourceStream {
    /// Events in store order; closed when the source ends
    pub events: mpsc::Receiver<ChangeEvent>,

    /// Resolves once the source ended
    pub handle: JoinHandle<Result<(), SourceError>>,
}

impl SourceStream {
    /// Waits for the source task and returns its outcome.
    ///
    /// # Errors
    ///
    /// The source's own error, or [`SourceError::Task`] if the task panicked
    /// or was aborted.
    pub async fn join(handle: JoinHandle<Result<(), SourceError>>) -> Result<(), SourceError> {
        handle.await.map_err(|e| SourceError::Task(e.to_string()))?
    }
}

/// Either source, selected by run mode.
pub enum ChangeSource {
    /// One-off scan of existing documents
    Replay(ReplaySource),
    /// Live change stream
    Stream(StreamSource),
}

impl ChangeSource {
    /// Spawns the source task.
    pub fn spawn(self, cancel: CancellationToken) -> SourceStream {
        match self {
            Self::Replay(source) => source.spawn(cancel),
            Self::Stream(source) => source.spawn(cancel),
        }
    }
}

/// Decodes a raw document, logging and counting documents that do not decode.
fn decode(document: Document) -> Option<ChangeEvent> {
    match ChangeEvent::from_document(document) {
        Ok(event) => {
            metrics::increment_events_received(event.operation.as_str());
            Some(event)
        }
        Err(e) => {
            warn!(error = %e, "Unable to decode change event, skipping");
            metrics::increment_events_skipped(SkipReason::Decode);
            None
        }
    }
}

/// Sends an event unless cancelled first. Returns false when the source must
/// stop (cancelled or the receiver is gone).
async fn emit(
    tx: &mpsc::Sender<ChangeEvent>,
    event: ChangeEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_reports_panicked_source_as_task_failure() {
        let handle = tokio::spawn(async {
            if true {
                panic!("cursor poisoned");
            }
            Ok(())
        });

        let err = SourceStream::join(handle).await.unwrap_err();
        assert!(matches!(err, SourceError::Task(_)));
        assert_eq!(err.category(), "task");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_join_reports_aborted_source_as_task_failure() {
        let handle = tokio::spawn(futures::future::pending::<Result<(), SourceError>>());
        handle.abort();

        let err = SourceStream::join(handle).await.unwrap_err();
        assert_eq!(err.category(), "task");
    }
}
