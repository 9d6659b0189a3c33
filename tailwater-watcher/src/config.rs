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

//! Command line and environment configuration.

use bson::Timestamp;
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::time::Duration;
use tailwater_core::config::{
    parse_resume_token, ConfigError, PipelineConfig, RunMode, WatchConfig,
};
use tailwater_core::variables;
use tailwater_kafka::kafka::{KafkaConfig, KafkaConfigError};

/// Streams MongoDB collection changes to a Kafka topic.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Publish every existing document as an insert, then exit.
    #[arg(long, env = "REPLAY")]
    pub replay: bool,

    /// Aggregation stages (extended JSON array) run before the change
    /// stream or replay projection. `%currentTimestamp%` is replaced by the
    /// current unix time in milliseconds.
    #[arg(long, env = "CUSTOM_PIPELINE")]
    pub custom_pipeline: Option<String>,

    /// Number of dispatcher workers.
    #[arg(long, env = "WORKER_NUMBER", default_value_t = 1)]
    pub worker_number: usize,

    /// Replay workers exit after this many milliseconds without messages.
    #[arg(long, env = "REPLAY_IDLE_TIMEOUT_MS", default_value_t = 10_000)]
    pub replay_idle_timeout: u64,

    /// MongoDB connection string.
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://127.0.0.1:27017")]
    pub mongodb_uri: String,

    /// Database to watch.
    #[arg(long, env = "MONGODB_DATABASE_NAME", default_value = "watcher")]
    pub mongodb_database_name: String,

    /// Collection to watch.
    #[arg(long, env = "MONGODB_COLLECTION_NAME", default_value = "items")]
    pub mongodb_collection_name: String,

    /// Server selection timeout in milliseconds.
    #[arg(long, env = "MONGODB_SERVER_SELECTION_TIMEOUT_MS", default_value_t = 2_000)]
    pub mongodb_server_selection_timeout: u64,

    /// Change stream batch size.
    #[arg(long, env = "MONGODB_OPTION_BATCH_SIZE")]
    pub batch_size: Option<u32>,

    /// Look up the current full document on updates.
    #[arg(long, env = "MONGODB_OPTION_FULL_DOCUMENT")]
    pub full_document: bool,

    /// Leave `updateDescription` out of message values.
    #[arg(long, env = "MONGODB_OPTION_IGNORE_UPDATE_DESCRIPTION")]
    pub ignore_update_description: bool,

    /// Maximum server wait per change stream batch, in milliseconds.
    #[arg(long, env = "MONGODB_OPTION_MAX_AWAIT_TIME_MS")]
    pub max_await_time: Option<u64>,

    /// Resume token (extended JSON document) for the first open.
    #[arg(long, env = "MONGODB_OPTION_RESUME_AFTER")]
    pub resume_after: Option<String>,

    /// Start at this operation time: seconds part.
    #[arg(long, env = "MONGODB_OPTION_START_AT_OPERATION_TIME_T", default_value_t = 0)]
    pub start_at_operation_time_t: u32,

    /// Start at this operation time: increment part.
    #[arg(long, env = "MONGODB_OPTION_START_AT_OPERATION_TIME_I", default_value_t = 0)]
    pub start_at_operation_time_i: u32,

    /// Start this many seconds in the past, unless an operation time is set.
    #[arg(long, env = "MONGODB_OPTION_START_AT_DELAY_SECS")]
    pub start_at_delay: Option<u64>,

    /// Delay between change stream reopen attempts, in milliseconds.
    #[arg(long, env = "MONGODB_OPTION_WATCH_RETRY_DELAY_MS", default_value_t = 500)]
    pub watch_retry_delay: u64,

    /// Change stream reopen attempts; 0 disables automatic resume.
    #[arg(long, env = "MONGODB_OPTION_WATCH_MAX_RETRIES", default_value_t = 3)]
    pub watch_max_retries: u32,

    /// Kafka bootstrap servers.
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", default_value = "127.0.0.1:9092")]
    pub kafka_bootstrap_servers: String,

    /// Destination topic.
    #[arg(long, env = "KAFKA_TOPIC", default_value = "kafka-mongo-watcher")]
    pub kafka_topic: String,

    /// Depth of the channel feeding the Kafka producer.
    #[arg(long, env = "KAFKA_PRODUCE_CHANNEL_SIZE", default_value_t = 10_000)]
    pub kafka_produce_channel_size: usize,

    /// Wrap the producer with the tracing, logging and metrics decorators.
    #[arg(
        long,
        env = "KAFKA_WITH_DECORATORS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub kafka_with_decorators: bool,

    /// Kafka `message.max.bytes`.
    #[arg(long, env = "KAFKA_MESSAGE_MAX_BYTES", default_value_t = 1_048_576)]
    pub kafka_message_max_bytes: usize,

    /// Log a projection of produced messages (requires decorators).
    #[arg(long, env = "DEBUG_ENABLED")]
    pub debug_enabled: bool,

    /// Prometheus exporter listen address.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8001")]
    pub metrics_addr: SocketAddr,

    /// Log as JSON lines.
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Application name sent in the `x-tracing` header.
    #[arg(long, env = "APP_NAME", default_value = tailwater_core::APP_NAME)]
    pub app_name: String,
}

impl Args {
    /// Change stream parameters as of `now`.
    ///
    /// # Errors
    ///
    /// Invalid custom pipeline or resume token, or a zero batch size.
    pub fn watch_config(&self, now: DateTime<Utc>) -> Result<WatchConfig, ConfigError> {
        let mut builder = WatchConfig::builder()
            .full_document(self.full_document)
            .max_retries(self.watch_max_retries)
            .retry_delay(Duration::from_millis(self.watch_retry_delay));

        if let Some(size) = self.batch_size {
            builder = builder.batch_size(size);
        }
        if let Some(ms) = self.max_await_time {
            builder = builder.max_await_time(Duration::from_millis(ms));
        }
        if let Some(raw) = self.resume_after.as_deref().filter(|raw| !raw.is_empty()) {
            builder = builder.resume_after(parse_resume_token(raw.as_bytes())?);
        }
        if let Some(timestamp) = self.start_at_operation_time(now) {
            builder = builder.start_at_operation_time(timestamp);
        }
        if let Some(raw) = self.custom_pipeline.as_deref().filter(|raw| !raw.is_empty()) {
            builder = builder.custom_pipeline(variables::parse_pipeline(raw, || now)?);
        }

        builder.build()
    }

    /// Explicit operation time if set, else `now` minus the start delay.
    fn start_at_operation_time(&self, now: DateTime<Utc>) -> Option<Timestamp> {
        if self.start_at_operation_time_t != 0 {
            return Some(Timestamp {
                time: self.start_at_operation_time_t,
                increment: self.start_at_operation_time_i,
            });
        }

        let delay = i64::try_from(self.start_at_delay?).ok()?;
        let start = now.timestamp().checked_sub(delay)?;
        Some(Timestamp {
            time: u32::try_from(start).ok()?,
            increment: 0,
        })
    }

    /// Pipeline configuration as of `now`.
    ///
    /// # Errors
    ///
    /// Any error from [`watch_config`](Self::watch_config), or an empty topic
    /// or zero size.
    pub fn pipeline_config(&self, now: DateTime<Utc>) -> Result<PipelineConfig, ConfigError> {
        let mode = if self.replay {
            RunMode::Replay
        } else {
            RunMode::Watch
        };

        PipelineConfig::builder()
            .mode(mode)
            .topic(self.kafka_topic.clone())
            .app_name(self.app_name.clone())
            .workers(self.worker_number)
            .produce_channel_size(self.kafka_produce_channel_size)
            .replay_idle_timeout(Duration::from_millis(self.replay_idle_timeout))
            .ignore_update_description(self.ignore_update_description)
            .watch(self.watch_config(now)?)
            .build()
    }

    /// Kafka producer configuration.
    ///
    /// # Errors
    ///
    /// Empty bootstrap servers or a zero message size.
    pub fn kafka_config(&self) -> Result<KafkaConfig, KafkaConfigError> {
        KafkaConfig::builder()
            .bootstrap_servers(self.kafka_bootstrap_servers.clone())
            .message_max_bytes(self.kafka_message_max_bytes)
            .build()
    }

    /// MongoDB server selection timeout.
    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.mongodb_server_selection_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 8, 18, 0, 0).unwrap()
    }

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("tailwater").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);

        assert!(!args.replay);
        assert!(args.kafka_with_decorators);
        assert_eq!(args.kafka_topic, "kafka-mongo-watcher");
        assert_eq!(args.metrics_addr, "0.0.0.0:8001".parse().unwrap());

        let config = args.pipeline_config(now()).unwrap();
        assert_eq!(config.mode, RunMode::Watch);
        assert_eq!(config.workers, 1);
        assert_eq!(config.produce_channel_size, 10_000);
        assert_eq!(config.app_name, "tailwater");
        assert_eq!(config.watch.max_retries, 3);
        assert_eq!(config.watch.retry_delay, Duration::from_millis(500));
        assert_eq!(config.watch.start_at_operation_time, None);
    }

    #[test]
    fn test_decorators_can_be_disabled() {
        let args = parse(&["--kafka-with-decorators", "false"]);
        assert!(!args.kafka_with_decorators);
    }

    #[test]
    fn test_start_at_delay_counts_back_from_now() {
        let args = parse(&["--start-at-delay", "60"]);
        let config = args.watch_config(now()).unwrap();

        assert_eq!(
            config.start_at_operation_time,
            Some(Timestamp {
                time: 1_623_175_140,
                increment: 0
            })
        );
    }

    #[test]
    fn test_explicit_operation_time_wins_over_delay() {
        let args = parse(&[
            "--start-at-operation-time-t",
            "1600000000",
            "--start-at-operation-time-i",
            "4",
            "--start-at-delay",
            "60",
        ]);
        let config = args.watch_config(now()).unwrap();

        assert_eq!(
            config.start_at_operation_time,
            Some(Timestamp {
                time: 1_600_000_000,
                increment: 4
            })
        );
    }

    #[test]
    fn test_custom_pipeline_variables_are_replaced() {
        let args = parse(&[
            "--replay",
            "--custom-pipeline",
            r#"[{"$match": {"updatedAt": {"$lt": %currentTimestamp%}}}]"#,
        ]);
        let config = args.pipeline_config(now()).unwrap();

        assert_eq!(config.mode, RunMode::Replay);
        assert_eq!(
            config.watch.custom_pipeline,
            vec![doc! { "$match": { "updatedAt": { "$lt": 1_623_175_200_000_i64 } } }]
        );
    }

    #[test]
    fn test_invalid_resume_token_is_rejected() {
        let args = parse(&["--resume-after", "not json"]);
        assert!(matches!(
            args.watch_config(now()),
            Err(ConfigError::InvalidResumeToken(_))
        ));
    }
}
