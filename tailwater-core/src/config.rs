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

//! Run configuration for sources and the pipeline.
//!
//! Both [`WatchConfig`] and [`PipelineConfig`] are immutable once built; use
//! their builders to construct them.
//!
//! ```rust
//! use std::time::Duration;
//! use tailwater_core::config::{PipelineConfig, RunMode, WatchConfig};
//!
//! let watch = WatchConfig::builder()
//!     .full_document(true)
//!     .max_retries(5)
//!     .retry_delay(Duration::from_secs(1))
//!     .build()
//!     .unwrap();
//!
//! let config = PipelineConfig::builder()
//!     .topic("items")
//!     .mode(RunMode::Watch)
//!     .workers(4)
//!     .watch(watch)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.workers, 4);
//! ```

use crate::collection::WatchOptions;
use bson::{Bson, Document, Timestamp};
use std::time::Duration;
use thiserror::Error;

/// Default number of reopen attempts for a change stream.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between reopen attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default depth of the channel feeding the producer.
pub const DEFAULT_PRODUCE_CHANNEL_SIZE: usize = 10_000;

/// Default depth of the event and message channels between stages.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Default inactivity timeout for replay workers.
pub const DEFAULT_REPLAY_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not set
    #[error("{0} is required")]
    MissingField(&'static str),

    /// A field has an unusable value
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    /// The custom pipeline fragment could not be parsed
    #[error("invalid custom pipeline: {0}")]
    InvalidPipeline(String),

    /// A resume token could not be parsed
    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),
}

/// Parses a resume token given as extended JSON, e.g. `{"_data": "8263..."}`.
///
/// # Errors
///
/// [`ConfigError::InvalidResumeToken`] when the bytes are not an extended JSON
/// document.
pub fn parse_resume_token(raw: &[u8]) -> Result<Document, ConfigError> {
    let json: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| ConfigError::InvalidResumeToken(e.to_string()))?;
    match Bson::try_from(json).map_err(|e| ConfigError::InvalidResumeToken(e.to_string()))? {
        Bson::Document(token) => Ok(token),
        other => Err(ConfigError::InvalidResumeToken(format!(
            "expected a document, got {:?}",
            other.element_type()
        ))),
    }
}

/// Which source feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Tail the collection's change stream
    #[default]
    Watch,

    /// Scan existing documents once as synthetic inserts
    Replay,
}

impl RunMode {
    /// Returns the mode name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Watch => "watch",
            Self::Replay => "replay",
        }
    }
}

/// Change stream parameters for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    /// Server batch size
    pub batch_size: Option<u32>,

    /// Look up the current full document for updates
    pub full_document: bool,

    /// Maximum server wait for new changes per batch
    pub max_await_time: Option<Duration>,

    /// Resume after this token on the first open
    pub resume_after: Option<Document>,

    /// Start after this token on the first open (wins over `resume_after`)
    pub start_after: Option<Document>,

    /// Start at this operation time, fresh opens only
    pub start_at_operation_time: Option<Timestamp>,

    /// Reopen attempts; 0 disables automatic resume
    pub max_retries: u32,

    /// Fixed delay between reopen attempts
    pub retry_delay: Duration,

    /// Stages prepended to every pipeline
    pub custom_pipeline: Vec<Document>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            full_document: false,
            max_await_time: None,
            resume_after: None,
            start_after: None,
            start_at_operation_time: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            custom_pipeline: Vec::new(),
        }
    }
}

impl WatchConfig {
    /// Creates a new builder for `WatchConfig`.
    #[must_use]
    pub fn builder() -> WatchConfigBuilder {
        WatchConfigBuilder::default()
    }

    /// Options for the first open of a run.
    pub fn initial_options(&self) -> WatchOptions {
        let mut options = self.base_options();
        if let Some(token) = &self.start_after {
            options.start_after = Some(token.clone());
        } else if let Some(token) = &self.resume_after {
            options.resume_after = Some(token.clone());
        }
        options.start_at_operation_time = self.start_at_operation_time;
        options
    }

    /// Options for a reopen after the previous cursor died.
    ///
    /// Starts after the last observed token. Without one the configured
    /// resume position is reused; the operation time never is.
    pub fn resume_options(&self, last_token: Option<&Document>) -> WatchOptions {
        match last_token {
            Some(token) => {
                let mut options = self.base_options();
                options.start_after = Some(token.clone());
                options
            }
            None => {
                let mut options = self.initial_options();
                options.start_at_operation_time = None;
                options
            }
        }
    }

    fn base_options(&self) -> WatchOptions {
        WatchOptions {
            batch_size: self.batch_size,
            max_await_time: self.max_await_time,
            full_document: self.full_document,
            ..WatchOptions::default()
        }
    }
}

/// Builder for [`WatchConfig`].
#[derive(Debug, Default)]
pub struct WatchConfigBuilder {
    batch_size: Option<u32>,
    full_document: bool,
    max_await_time: Option<Duration>,
    resume_after: Option<Document>,
    start_after: Option<Document>,
    start_at_operation_time: Option<Timestamp>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    custom_pipeline: Vec<Document>,
}

impl WatchConfigBuilder {
    /// Sets the server batch size.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Enables `updateLookup` full documents for updates.
    #[must_use]
    pub fn full_document(mut self, enabled: bool) -> Self {
        self.full_document = enabled;
        self
    }

    /// Sets the maximum server wait per batch.
    #[must_use]
    pub fn max_await_time(mut self, duration: Duration) -> Self {
        self.max_await_time = Some(duration);
        self
    }

    /// Resumes after the given token on the first open.
    #[must_use]
    pub fn resume_after(mut self, token: Document) -> Self {
        self.resume_after = Some(token);
        self
    }

    /// Starts after the given token on the first open.
    #[must_use]
    pub fn start_after(mut self, token: Document) -> Self {
        self.start_after = Some(token);
        self
    }

    /// Starts at the given operation time on the first open.
    ///
    /// A zero timestamp is ignored.
    #[must_use]
    pub fn start_at_operation_time(mut self, timestamp: Timestamp) -> Self {
        if timestamp.time != 0 || timestamp.increment != 0 {
            self.start_at_operation_time = Some(timestamp);
        }
        self
    }

    /// Sets the number of reopen attempts (default: 3).
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the delay between reopen attempts (default: 500ms).
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets the stages prepended to the watch pipeline.
    #[must_use]
    pub fn custom_pipeline(mut self, stages: Vec<Document>) -> Self {
        self.custom_pipeline = stages;
        self
    }

    /// Builds the `WatchConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is set to 0.
    pub fn build(self) -> Result<WatchConfig, ConfigError> {
        if self.batch_size == Some(0) {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(WatchConfig {
            batch_size: self.batch_size,
            full_document: self.full_document,
            max_await_time: self.max_await_time,
            resume_after: self.resume_after,
            start_after: self.start_after,
            start_at_operation_time: self.start_at_operation_time,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
            custom_pipeline: self.custom_pipeline,
        })
    }
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Replay or watch
    pub mode: RunMode,

    /// Destination topic
    pub topic: String,

    /// Name used in tracing headers
    pub app_name: String,

    /// Number of dispatcher workers
    pub workers: usize,

    /// Depth of the channel consumed by the producer client
    pub produce_channel_size: usize,

    /// Depth of the event and message channels between stages
    pub channel_buffer_size: usize,

    /// Replay workers exit after this long without messages
    pub replay_idle_timeout: Duration,

    /// Drop `updateDescription` from message values
    pub ignore_update_description: bool,

    /// Change stream parameters (the custom pipeline is also used in replay)
    pub watch: WatchConfig,
}

impl PipelineConfig {
    /// Creates a new builder for `PipelineConfig`.
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    mode: RunMode,
    topic: Option<String>,
    app_name: Option<String>,
    workers: Option<usize>,
    produce_channel_size: Option<usize>,
    channel_buffer_size: Option<usize>,
    replay_idle_timeout: Option<Duration>,
    ignore_update_description: bool,
    watch: Option<WatchConfig>,
}

impl PipelineConfigBuilder {
    /// Sets the run mode (default: watch).
    #[must_use]
    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the destination topic (required).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Sets the application name used in tracing headers.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Sets the number of dispatcher workers (default: 1).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets the produce channel depth (default: 10000).
    #[must_use]
    pub fn produce_channel_size(mut self, size: usize) -> Self {
        self.produce_channel_size = Some(size);
        self
    }

    /// Sets the inter-stage channel depth (default: 100).
    #[must_use]
    pub fn channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = Some(size);
        self
    }

    /// Sets the replay worker inactivity timeout (default: 10s).
    #[must_use]
    pub fn replay_idle_timeout(mut self, timeout: Duration) -> Self {
        self.replay_idle_timeout = Some(timeout);
        self
    }

    /// Drops `updateDescription` from message values.
    #[must_use]
    pub fn ignore_update_description(mut self, ignore: bool) -> Self {
        self.ignore_update_description = ignore;
        self
    }

    /// Sets the change stream parameters.
    #[must_use]
    pub fn watch(mut self, config: WatchConfig) -> Self {
        self.watch = Some(config);
        self
    }

    /// Builds the `PipelineConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is missing or empty, or if a size or
    /// worker count is 0.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let topic = self.topic.ok_or(ConfigError::MissingField("topic"))?;
        if topic.is_empty() {
            return Err(ConfigError::Invalid {
                field: "topic",
                reason: "cannot be empty".to_string(),
            });
        }

        let workers = positive("workers", self.workers.unwrap_or(1))?;
        let produce_channel_size = positive(
            "produce_channel_size",
            self.produce_channel_size
                .unwrap_or(DEFAULT_PRODUCE_CHANNEL_SIZE),
        )?;
        let channel_buffer_size = positive(
            "channel_buffer_size",
            self.channel_buffer_size
                .unwrap_or(DEFAULT_CHANNEL_BUFFER_SIZE),
        )?;

        Ok(PipelineConfig {
            mode: self.mode,
            topic,
            app_name: self
                .app_name
                .unwrap_or_else(|| crate::APP_NAME.to_string()),
            workers,
            produce_channel_size,
            channel_buffer_size,
            replay_idle_timeout: self
                .replay_idle_timeout
                .unwrap_or(DEFAULT_REPLAY_IDLE_TIMEOUT),
            ignore_update_description: self.ignore_update_description,
            watch: self.watch.unwrap_or_default(),
        })
    }
}

fn positive(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(value)
}
