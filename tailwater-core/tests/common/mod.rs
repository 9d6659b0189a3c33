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

//! In-memory collection, cursor and client used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tailwater_core::collection::{CollectionAdapter, EventCursor, SourceError, WatchOptions};
use tailwater_core::message::Message;
use tailwater_core::producer::{Client, DeliveryReport};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

pub const DATABASE: &str = "shop";
pub const COLLECTION: &str = "items";

/// Installs a test log subscriber once per test binary. `RUST_LOG`
/// overrides the default `warn` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A stored document.
pub fn fixture(id: ObjectId, name: &str) -> Document {
    doc! { "_id": id, "name": name }
}

/// A raw insert change event as the server would send it.
pub fn insert_change(token: &str, id: ObjectId) -> Document {
    doc! {
        "_id": { "_data": token },
        "operationType": "insert",
        "ns": { "db": DATABASE, "coll": COLLECTION },
        "documentKey": { "_id": id },
        "fullDocument": { "_id": id },
    }
}

/// A change document without an `operationType`, which cannot be decoded.
pub fn malformed_change(token: &str) -> Document {
    doc! {
        "_id": { "_data": token },
        "ns": { "db": DATABASE, "coll": COLLECTION },
    }
}

/// The invalidate event the server sends as it kills a cursor.
pub fn invalidate_change(token: &str) -> Document {
    doc! {
        "_id": { "_data": token },
        "operationType": "invalidate",
    }
}

/// One step of a scripted cursor.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this document
    Change(Document),
    /// Return a driver error
    Fail(String),
    /// Wait before the next step
    Pause(Duration),
}

/// What one `watch` call returns.
#[derive(Debug, Clone)]
pub struct WatchScript {
    steps: Vec<Step>,
    stay_open: bool,
    killed_after: Option<usize>,
}

impl WatchScript {
    /// Yields `changes`; the cursor id drops to zero together with the last
    /// one, as on invalidation.
    pub fn dies_after(changes: Vec<Document>) -> Self {
        Self {
            steps: changes.into_iter().map(Step::Change).collect(),
            stay_open: false,
            killed_after: None,
        }
    }

    /// Yields `changes`, then waits for more forever.
    pub fn stays_open(changes: Vec<Document>) -> Self {
        Self {
            steps: changes.into_iter().map(Step::Change).collect(),
            stay_open: true,
            killed_after: None,
        }
    }

    /// The server reports a zero cursor id once `fetched` documents were
    /// returned, while the rest of the batch is still buffered.
    pub fn killed_after(mut self, fetched: usize) -> Self {
        self.killed_after = Some(fetched);
        self
    }

    /// Appends a driver error after the scripted changes.
    pub fn failing_with(mut self, message: &str) -> Self {
        self.steps.push(Step::Fail(message.to_string()));
        self
    }
}

/// A cursor over scripted steps. The resume token is the `_id` of the last
/// document returned.
pub struct MockCursor {
    steps: VecDeque<Step>,
    token: Option<Document>,
    stay_open: bool,
    killed_after: Option<usize>,
    fetched: usize,
}

impl MockCursor {
    fn new(steps: Vec<Step>, stay_open: bool, killed_after: Option<usize>) -> Self {
        Self {
            steps: steps.into(),
            token: None,
            stay_open,
            killed_after,
            fetched: 0,
        }
    }
}

#[async_trait]
impl EventCursor for MockCursor {
    async fn next(&mut self) -> Option<Result<Document, SourceError>> {
        loop {
            match self.steps.pop_front() {
                Some(Step::Pause(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Fail(message)) => return Some(Err(SourceError::driver(message))),
                Some(Step::Change(document)) => {
                    self.fetched += 1;
                    self.token = document.get_document("_id").ok().cloned();
                    return Some(Ok(document));
                }
                None if self.stay_open && self.is_alive() => {
                    futures::future::pending::<()>().await;
                }
                None => return None,
            }
        }
    }

    fn is_alive(&self) -> bool {
        if self.killed_after.is_some_and(|n| self.fetched >= n) {
            return false;
        }
        self.stay_open || !self.steps.is_empty()
    }

    fn resume_token(&self) -> Option<Document> {
        self.token.clone()
    }

    async fn close(&mut self) {
        self.steps.clear();
        self.stay_open = false;
    }
}

/// A collection holding `documents` whose change stream follows `scripts`.
///
/// `aggregate` evaluates the final `$replaceRoot` stage of the pipeline
/// against every stored document.
#[derive(Default)]
pub struct MockCollection {
    documents: Vec<Document>,
    scripts: Mutex<VecDeque<WatchScript>>,
    fail_watch: bool,
    scan_pauses: Vec<(usize, Duration)>,
    scan_fails_at: Option<usize>,
    pub watch_calls: Mutex<Vec<WatchOptions>>,
    pub aggregate_calls: Mutex<Vec<Vec<Document>>>,
}

impl MockCollection {
    pub fn with_documents(documents: Vec<Document>) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }

    pub fn with_scripts(scripts: Vec<WatchScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// Every `watch` call fails.
    pub fn failing_watch() -> Self {
        Self {
            fail_watch: true,
            ..Self::default()
        }
    }

    /// The scan waits `delay` before returning document `index`.
    pub fn scan_pause(mut self, index: usize, delay: Duration) -> Self {
        self.scan_pauses.push((index, delay));
        self
    }

    /// The scan fails instead of returning document `index`.
    pub fn scan_fails_at(mut self, index: usize) -> Self {
        self.scan_fails_at = Some(index);
        self
    }

    pub fn watch_calls(&self) -> Vec<WatchOptions> {
        self.watch_calls.lock().unwrap().clone()
    }

    /// Waits until `watch` has been called `count` times.
    pub async fn wait_for_watch_calls(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.watch_calls.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch was not called in time");
    }
}

#[async_trait]
impl CollectionAdapter for MockCollection {
    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Box<dyn EventCursor>, SourceError> {
        self.aggregate_calls.lock().unwrap().push(pipeline.clone());

        let new_root = pipeline
            .last()
            .and_then(|stage| stage.get_document("$replaceRoot").ok())
            .and_then(|stage| stage.get("newRoot"))
            .cloned()
            .ok_or_else(|| SourceError::driver("pipeline has no $replaceRoot stage"))?;

        let mut steps = Vec::new();
        for (index, document) in self.documents.iter().enumerate() {
            for (_, delay) in self.scan_pauses.iter().filter(|(at, _)| *at == index) {
                steps.push(Step::Pause(*delay));
            }
            if self.scan_fails_at == Some(index) {
                steps.push(Step::Fail("cursor killed".to_string()));
                break;
            }
            if let Bson::Document(projected) = evaluate(&new_root, document) {
                steps.push(Step::Change(projected));
            }
        }

        Ok(Box::new(MockCursor::new(steps, false, None)))
    }

    async fn watch(
        &self,
        _pipeline: Vec<Document>,
        options: WatchOptions,
    ) -> Result<Box<dyn EventCursor>, SourceError> {
        self.watch_calls.lock().unwrap().push(options);
        if self.fail_watch {
            return Err(SourceError::driver("not primary"));
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| WatchScript::stays_open(Vec::new()));
        Ok(Box::new(MockCursor::new(
            script.steps,
            script.stay_open,
            script.killed_after,
        )))
    }

    fn name(&self) -> &str {
        COLLECTION
    }

    fn database_name(&self) -> &str {
        DATABASE
    }
}

// Field paths (`$field`) and `$$ROOT` only; enough for the replay projection.
fn evaluate(expression: &Bson, root: &Document) -> Bson {
    match expression {
        Bson::String(s) if s == "$$ROOT" => Bson::Document(root.clone()),
        Bson::String(s) if s.starts_with('$') => root.get(&s[1..]).cloned().unwrap_or(Bson::Null),
        Bson::Document(fields) => Bson::Document(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), evaluate(value, root)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A client that records every produced message and reports it delivered.
pub struct MockClient {
    pub produced: Arc<tokio::sync::Mutex<Vec<Message>>>,
    events: Mutex<Option<broadcast::Sender<DeliveryReport>>>,
    closed: Mutex<bool>,
}

impl MockClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            produced: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            events: Mutex::new(Some(events)),
            closed: Mutex::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl Client for MockClient {
    async fn produce(&self, mut messages: mpsc::Receiver<Message>) {
        while let Some(message) = messages.recv().await {
            let events = self.events.lock().unwrap().clone();
            if let Some(events) = events {
                let _ = events.send(DeliveryReport::delivered(&message.topic, message.key.clone()));
            }
            self.produced.lock().await.push(message);
        }
    }

    fn events(&self) -> broadcast::Receiver<DeliveryReport> {
        match self.events.lock().unwrap().as_ref() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn close(&self) {
        self.events.lock().unwrap().take();
        *self.closed.lock().unwrap() = true;
    }
}
