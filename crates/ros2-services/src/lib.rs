// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # ros2-services - ROS 2 services over a pub/sub transport
//!
//! Request/response calls between a [`ServiceClient`] and a
//! [`ServiceServer`], carried over two pub/sub topics: clients publish on
//! the request topic, servers publish on the reply topic.
//!
//! ## Correlation
//!
//! Every request is tagged with a [`SampleIdentity`] (client origin +
//! sequence number) stored as a 24-byte token in the message metadata.
//! The server copies that token, byte for byte, into the metadata of its
//! reply so the client can match the reply with the waiting request.
//!
//! ```text
//!  client                      transport                      server
//!    | send_request(req)           |                             |
//!    |-- rq/<svc>Request [id] ---->|---------------------------->| handler(req)
//!    |                             |<--- rr/<svc>Reply [id] -----|
//!    |<----------------------------|                             |
//!  PendingReply resolves
//! ```
//!
//! Two metadata slots exist: the legacy vendor slot
//! ([`PID_FASTDDS_SAMPLE_IDENTITY`]) and the standard related-sample slot
//! ([`PID_RELATED_SAMPLE_IDENTITY`]). Receivers accept either; servers echo
//! into every slot the request used.
//!
//! ## Quick Start
//!
//! ```
//! use ros2_services::transport::memory::MemoryBus;
//! use ros2_services::{HandlerError, RawService, ServiceClient, ServiceEndpoint, ServiceServer, TopicSpec};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(MemoryBus::new());
//! let endpoint = ServiceEndpoint::new(
//!     "reverse",
//!     TopicSpec::new("rq/reverseRequest", "demo::srv::dds_::Reverse_Request_"),
//!     TopicSpec::new("rr/reverseReply", "demo::srv::dds_::Reverse_Response_"),
//! );
//!
//! let handler = |mut bytes: Vec<u8>| -> Result<Vec<u8>, HandlerError> {
//!     bytes.reverse();
//!     Ok(bytes)
//! };
//! let server = ServiceServer::<RawService>::new(bus.clone(), endpoint.clone(), handler)?;
//! server.start()?;
//!
//! let client = ServiceClient::<RawService>::new(bus, endpoint);
//! let reply = client.send_request(&b"abc".to_vec())?.await?;
//! assert_eq!(reply, b"cba");
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules Overview
//!
//! - [`client`] - request engine
//! - [`server`] - dispatch engine
//! - [`identity`] - identity token codec and slot lookup
//! - [`correlation`] - pending request table
//! - [`transport`] - pub/sub contract and the in-process [`transport::memory::MemoryBus`]
//! - [`config`] - TOML and environment configuration

pub mod client;
pub mod config;
pub mod correlation;
pub mod definition;
pub mod error;
pub mod guid;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod qos;
pub mod server;
pub mod transport;

pub use client::{PendingReply, ServiceClient};
pub use config::{ConfigError, ServiceConfig};
pub use correlation::CorrelationTable;
pub use definition::{RawService, ServiceDefinition};
pub use error::{CodecError, ServiceError, ServiceResult, TransportError};
pub use guid::{EntityId, Guid, GuidPrefix};
pub use identity::{
    find_identity, IdentityMatch, IdentitySlots, SampleIdentity, PID_FASTDDS_SAMPLE_IDENTITY,
    PID_RELATED_SAMPLE_IDENTITY,
};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use metrics::{MetricsSnapshot, ServiceMetrics};
pub use qos::{Durability, History, QosProfile, Reliability};
pub use server::{HandlerError, ServiceHandler, ServiceServer};
pub use transport::{
    DataMessage, Demand, Parameters, Publication, SampleListener, ServiceEndpoint, Subscription,
    TopicSpec, Transport,
};
