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

//! Metrics instrumentation.
//!
//! Uses the `metrics` facade, so any exporter can be installed by the binary
//! (the watcher installs Prometheus). Without an installed recorder every
//! call here is a no-op.
//!
//! # Naming Conventions
//!
//! - Prefixed with `tailwater_`
//! - Counters end with `_total`
//!
//! # Labels
//!
//! Labels are kept low-cardinality: `topic`, `operation`, `reason`,
//! `collection`. Never use document ids or error messages as labels.
//!
//! # Examples
//!
//! ```rust
//! use tailwater_core::metrics::{self, SkipReason};
//!
//! metrics::increment_produce_attempts("items");
//! metrics::increment_events_skipped(SkipReason::Validation);
//! ```

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Metric name prefix for all Tailwater metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "tailwater";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Messages handed to the producer.
///
/// Type: Counter
/// Labels: topic
pub const PRODUCE_ATTEMPTS_TOTAL: &str = "tailwater_kafka_produce_attempts_total";

/// Messages confirmed by the broker.
///
/// Type: Counter
/// Labels: topic
pub const DELIVERY_SUCCESS_TOTAL: &str = "tailwater_kafka_delivery_success_total";

/// Messages the broker failed to accept.
///
/// Type: Counter
/// Labels: topic
pub const DELIVERY_ERRORS_TOTAL: &str = "tailwater_kafka_delivery_errors_total";

/// Change events read from a source.
///
/// Type: Counter
/// Labels: operation
pub const EVENTS_RECEIVED_TOTAL: &str = "tailwater_events_received_total";

/// Events dropped before production.
///
/// Type: Counter
/// Labels: reason
pub const EVENTS_SKIPPED_TOTAL: &str = "tailwater_events_skipped_total";

/// Change stream reopen attempts.
///
/// Type: Counter
/// Labels: collection
pub const STREAM_RETRIES_TOTAL: &str = "tailwater_stream_retries_total";

/// Debug events dropped because the debug slot was full.
///
/// Type: Counter
pub const DEBUG_EVENTS_DROPPED_TOTAL: &str = "tailwater_debug_events_dropped_total";

/// Dispatcher workers currently running.
///
/// Type: Gauge
pub const WORKERS_RUNNING: &str = "tailwater_workers_running";

/// Pipeline status (0=stopped, 1=running, 2=error).
///
/// Type: Gauge
pub const PIPELINE_STATUS: &str = "tailwater_pipeline_status";

/// Registers metric descriptions with the installed recorder.
///
/// Call once after installing an exporter.
pub fn init_metrics() {
    describe_counter!(
        PRODUCE_ATTEMPTS_TOTAL,
        "Total number of messages handed to the Kafka producer"
    );
    describe_counter!(
        DELIVERY_SUCCESS_TOTAL,
        "Total number of messages acknowledged by Kafka"
    );
    describe_counter!(
        DELIVERY_ERRORS_TOTAL,
        "Total number of messages Kafka failed to deliver"
    );
    describe_counter!(
        EVENTS_RECEIVED_TOTAL,
        "Total number of change events read from MongoDB"
    );
    describe_counter!(
        EVENTS_SKIPPED_TOTAL,
        "Total number of change events dropped before production"
    );
    describe_counter!(
        STREAM_RETRIES_TOTAL,
        "Total number of change stream reopen attempts"
    );
    describe_counter!(
        DEBUG_EVENTS_DROPPED_TOTAL,
        "Total number of debug events dropped because no consumer was keeping up"
    );
    describe_gauge!(WORKERS_RUNNING, "Number of running dispatcher workers");
    describe_gauge!(
        PIPELINE_STATUS,
        "Current pipeline status (0=stopped, 1=running, 2=error)"
    );
}

/// Increments the produce attempts counter.
pub fn increment_produce_attempts(topic: &str) {
    counter!(PRODUCE_ATTEMPTS_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Increments the delivery success counter.
pub fn increment_delivery_success(topic: &str) {
    counter!(DELIVERY_SUCCESS_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Increments the delivery error counter.
pub fn increment_delivery_errors(topic: &str) {
    counter!(DELIVERY_ERRORS_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Increments the received events counter.
pub fn increment_events_received(operation: &str) {
    counter!(EVENTS_RECEIVED_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Increments the skipped events counter.
pub fn increment_events_skipped(reason: SkipReason) {
    counter!(EVENTS_SKIPPED_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Increments the stream retries counter.
pub fn increment_stream_retries(collection: &str) {
    counter!(STREAM_RETRIES_TOTAL, "collection" => collection.to_string()).increment(1);
}

/// Increments the dropped debug events counter.
pub fn increment_debug_events_dropped() {
    counter!(DEBUG_EVENTS_DROPPED_TOTAL).increment(1);
}

/// Sets the running workers gauge.
pub fn set_workers_running(count: usize) {
    gauge!(WORKERS_RUNNING).set(count as f64);
}

/// Sets the pipeline status.
pub fn set_pipeline_status(status: PipelineStatus) {
    gauge!(PIPELINE_STATUS).set(f64::from(status as u8));
}

/// Why an event was dropped before reaching the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The raw document was not a change event
    Decode,
    /// The document key was missing or unusable
    Validation,
    /// The event could not be serialized
    Serialization,
}

impl SkipReason {
    /// Returns the reason as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Validation => "validation",
            Self::Serialization => "serialization",
        }
    }
}

/// Pipeline status for the `pipeline_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStatus {
    /// Pipeline is stopped.
    Stopped = 0,
    /// Pipeline is running normally.
    Running = 1,
    /// Pipeline ended with an error.
    Error = 2,
}
