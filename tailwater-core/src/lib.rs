//! Tailwater Core - MongoDB Change Streams to Kafka
//!
//! This crate provides the moving parts of the Tailwater connector: change
//! event sources over a MongoDB collection, the codec that turns events into
//! keyed messages, and the producer pipeline that hands them to a log
//! transport.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines MongoDB change stream events, [`codec`]
//!   turns them into [`message::Message`]s keyed by document id
//! - **Sources**: [`source`] tails a change stream with automatic resume, or
//!   replays every existing document as an insert
//! - **Producer**: [`producer`] defines the [`producer::Client`] trait and its
//!   tracing, logging, metrics and debug decorators
//! - **Pipeline**: [`pipeline`] wires source, [`transform`], [`dispatcher`]
//!   and client together
//!
//! The Kafka client lives in the `tailwater-kafka` crate.
//!
//! # Example
//!
//! ```rust
//! use tailwater_core::codec::Encoder;
//! use tailwater_core::event::{ChangeEvent, OperationType};
//! use bson::{doc, oid::ObjectId};
//!
//! let id = ObjectId::new();
//! let event = ChangeEvent::builder(OperationType::Insert)
//!     .document_key(doc! { "_id": id })
//!     .build();
//!
//! let message = Encoder::new("items").encode(event).unwrap();
//! assert_eq!(message.key, id.to_hex().into_bytes());
//! ```

pub mod codec;
pub mod collection;
pub mod config;
pub mod debug;
pub mod dispatcher;
pub mod event;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod source;
pub mod transform;
pub mod variables;

/// Default application name, used in tracing headers.
pub const APP_NAME: &str = "tailwater";
