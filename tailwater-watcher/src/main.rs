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

//! `tailwater` binary: one collection, one topic.
//!
//! Every option can be given as a flag or through its environment variable:
//!
//! ```bash
//! MONGODB_URI=mongodb://localhost:27017 \
//! MONGODB_DATABASE_NAME=shop \
//! MONGODB_COLLECTION_NAME=orders \
//! KAFKA_BOOTSTRAP_SERVERS=localhost:9092 \
//! KAFKA_TOPIC=shop.orders \
//! tailwater
//! ```
//!
//! Prometheus metrics are served on `METRICS_ADDR` (`/metrics`).

mod config;

use chrono::Utc;
use clap::Parser;
use config::Args;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::error::Error;
use std::sync::Arc;
use tailwater_core::collection::MongoCollection;
use tailwater_core::debug::DebugSink;
use tailwater_core::metrics;
use tailwater_core::pipeline::Pipeline;
use tailwater_core::producer::{Client, ClientBuilder};
use tailwater_kafka::kafka::KafkaClient;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.log_json);

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()?;
    metrics::init_metrics();
    info!(addr = %args.metrics_addr, "Prometheus exporter listening");

    let config = args.pipeline_config(Utc::now())?;

    let collection = MongoCollection::connect(
        &args.mongodb_uri,
        &args.mongodb_database_name,
        &args.mongodb_collection_name,
        args.server_selection_timeout(),
    )
    .await?;

    let client = build_client(&args)?;
    let pipeline = Arc::new(Pipeline::new(config, Arc::new(collection), client));

    let shutdown = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received, stopping pipeline");
            pipeline.stop();
        }
    });

    let outcome = pipeline.run().await;
    shutdown.abort();

    match outcome {
        Ok(()) => {
            info!("Pipeline finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, category = e.category(), "Pipeline failed");
            Err(e.into())
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_line_number(true)
            .init();
    }
}

/// Kafka client, wrapped in the decorator chain unless disabled.
///
/// The tracer is applied last so that it runs first and every other
/// decorator sees the `x-tracing` header.
fn build_client(args: &Args) -> Result<Arc<dyn Client>, Box<dyn Error>> {
    let kafka = KafkaClient::new(args.kafka_config()?)?;

    if !args.kafka_with_decorators {
        if args.debug_enabled {
            warn!("DEBUG_ENABLED has no effect without KAFKA_WITH_DECORATORS");
        }
        return Ok(Arc::new(kafka));
    }

    let mut builder = ClientBuilder::new(kafka).with_metrics().with_logger();
    if args.debug_enabled {
        let sink = DebugSink::new(
            args.mongodb_database_name.clone(),
            args.mongodb_collection_name.clone(),
        );
        spawn_debug_logger(&sink);
        builder = builder.with_debugger(sink);
    }

    Ok(Arc::from(builder.with_tracer(args.app_name.clone()).build()))
}

fn spawn_debug_logger(sink: &DebugSink) {
    let Some(mut events) = sink.take_events() else {
        return;
    };
    let context = sink.context().clone();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                target: "tailwater::debug",
                database = %context.database,
                collection = %context.collection,
                timestamp = %event.timestamp,
                id = %event.id,
                operation = %event.operation,
                value = ?event.value,
                "Debug event"
            );
        }
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
