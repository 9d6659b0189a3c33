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

//! Pipeline Orchestration
//!
//! The pipeline wires the stages together and owns their lifecycle:
//!
//! ```text
//! ChangeSource ──▶ Transformer ──▶ Dispatcher (N workers) ──▶ Client::produce
//!  (replay|watch)    (encode)                                   (decorators → Kafka)
//! ```
//!
//! Each stage runs on its own task and the stages are linked by bounded
//! channels, so a slow broker applies back-pressure all the way to the cursor.
//!
//! # Shutdown
//!
//! [`Pipeline::stop`] releases the dispatcher workers and cancels the root
//! token, which also stops the source. [`Pipeline::run`] then waits for the
//! source, and closes the client so in-flight deliveries are drained before
//! it returns.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tailwater_core::collection::MongoCollection;
//! use tailwater_core::config::PipelineConfig;
//! use tailwater_core::pipeline::Pipeline;
//! use tailwater_core::producer::Client;
//!
//! # async fn example(client: Arc<dyn Client>) -> Result<(), Box<dyn std::error::Error>> {
//! let collection = MongoCollection::connect(
//!     "mongodb://localhost:27017",
//!     "shop",
//!     "items",
//!     std::time::Duration::from_secs(2),
//! )
//! .await?;
//!
//! let config = PipelineConfig::builder().topic("items").build()?;
//! let pipeline = Pipeline::new(config, Arc::new(collection), client);
//! pipeline.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::codec::Encoder;
use crate::collection::{CollectionAdapter, SourceError};
use crate::config::{ConfigError, PipelineConfig, RunMode};
use crate::dispatcher::{DispatchEnd, DispatchMode, Dispatcher};
use crate::metrics::{self, PipelineStatus};
use crate::producer::Client;
use crate::source::{ChangeSource, ReplaySource, SourceStream, StreamSource};
use crate::transform::Transformer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The source ended with an unrecoverable error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Replay workers idled out before the scan finished
    #[error("Replay stalled: no message for {idle_timeout:?} before the scan finished")]
    ReplayStalled {
        /// Configured replay idle timeout
        idle_timeout: Duration,
    },

    /// A stage task panicked
    #[error("Task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Returns the error category as a static string for metrics labels.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Configuration(_) => "configuration",
            Self::ReplayStalled { .. } => "replay_stalled",
            Self::Task(_) => "task",
        }
    }
}

/// Moves change events from one collection to the producer client.
pub struct Pipeline {
    config: PipelineConfig,
    collection: Arc<dyn CollectionAdapter>,
    client: Arc<dyn Client>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
}

impl Pipeline {
    /// Creates a pipeline. Nothing runs until [`run`](Self::run).
    pub fn new(
        config: PipelineConfig,
        collection: Arc<dyn CollectionAdapter>,
        client: Arc<dyn Client>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mode = match config.mode {
            RunMode::Watch => DispatchMode::Watch,
            RunMode::Replay => DispatchMode::Replay {
                idle_timeout: config.replay_idle_timeout,
            },
        };
        let dispatcher = Dispatcher::new(config.workers, mode, &cancel);

        Self {
            config,
            collection,
            client,
            cancel,
            dispatcher,
        }
    }

    /// Runs until the source ends or [`stop`](Self::stop) is called.
    ///
    /// The client is closed before returning, whatever the outcome.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Source`] when the source failed (cursor open retries
    /// exhausted, replay scan failure), [`PipelineError::ReplayStalled`] when
    /// replay workers idled out before the scan finished, and
    /// [`PipelineError::Task`] if a stage panicked.
    #[instrument(
        skip(self),
        fields(
            mode = self.config.mode.as_str(),
            database = %self.collection.database_name(),
            collection = %self.collection.name(),
            topic = %self.config.topic
        )
    )]
    pub async fn run(&self) -> Result<(), PipelineError> {
        info!(workers = self.config.workers, "Starting pipeline");
        metrics::set_pipeline_status(PipelineStatus::Running);

        let source_cancel = self.cancel.child_token();
        let SourceStream { events, handle } = self.source().spawn(source_cancel.clone());

        let encoder = Encoder::new(self.config.topic.clone())
            .ignore_update_description(self.config.ignore_update_description);
        let (messages, transformer) =
            Transformer::new(encoder, self.config.channel_buffer_size).spawn(events);

        let (produce_tx, produce_rx) = mpsc::channel(self.config.produce_channel_size);
        let (dispatched, ()) = tokio::join!(
            self.dispatcher.run(messages, produce_tx),
            self.client.produce(produce_rx),
        );

        let abandoned = !matches!(dispatched, DispatchEnd::Drained | DispatchEnd::Stopped);
        if abandoned {
            warn!(?dispatched, "Dispatcher abandoned its input, cancelling source");
            source_cancel.cancel();
        }

        let source = SourceStream::join(handle).await;
        let transformed = transformer.await;

        self.client.close().await;

        let outcome = match (source, transformed, dispatched) {
            (Err(e), _, _) => Err(PipelineError::Source(e)),
            (Ok(()), Err(e), _) => Err(PipelineError::Task(format!("transformer: {e}"))),
            (Ok(()), Ok(()), DispatchEnd::Idle) => Err(PipelineError::ReplayStalled {
                idle_timeout: self.config.replay_idle_timeout,
            }),
            (Ok(()), Ok(()), DispatchEnd::Failed) => {
                Err(PipelineError::Task("every dispatcher worker panicked".to_string()))
            }
            (Ok(()), Ok(()), DispatchEnd::OutputClosed) => Err(PipelineError::Task(
                "client stopped consuming messages".to_string(),
            )),
            (Ok(()), Ok(()), DispatchEnd::Drained | DispatchEnd::Stopped) => Ok(()),
        };

        match &outcome {
            Ok(()) => {
                metrics::set_pipeline_status(PipelineStatus::Stopped);
                info!("Pipeline stopped");
            }
            Err(e) => {
                metrics::set_pipeline_status(PipelineStatus::Error);
                error!(category = e.category(), error = %e, "Pipeline failed");
            }
        }
        outcome
    }

    /// Releases the dispatcher workers and cancels the source.
    ///
    /// Returns immediately; [`run`](Self::run) returns once the stages have
    /// drained.
    pub fn stop(&self) {
        let released = self.dispatcher.close();
        self.cancel.cancel();
        info!(released, "Pipeline stop requested");
    }

    /// Returns true once [`stop`](Self::stop) has been called.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn source(&self) -> ChangeSource {
        let buffer = self.config.channel_buffer_size;
        match self.config.mode {
            RunMode::Replay => ChangeSource::Replay(
                ReplaySource::new(self.collection.clone())
                    .custom_pipeline(self.config.watch.custom_pipeline.clone())
                    .channel_size(buffer),
            ),
            RunMode::Watch => ChangeSource::Stream(
                StreamSource::new(self.collection.clone(), self.config.watch.clone())
                    .channel_size(buffer),
            ),
        }
    }
}
