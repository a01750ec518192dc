// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pub/sub transport contract consumed by the service engines.
//!
//! The engines never talk to the network directly. They bind a
//! [`Publication`] and a [`Subscription`] per service channel through a
//! [`Transport`] and exchange [`DataMessage`]s: opaque payload bytes plus a
//! small integer-keyed metadata map ([`Parameters`]) that carries the
//! request identity.
//!
//! # Delivery discipline
//!
//! Receive callbacks are pull-based. A subscription starts with one credit;
//! each [`SampleListener::on_next`] consumes one, and the listener grants
//! more through [`Demand::request`] once it is done with the current item.
//! A transport must not invoke `on_next` for a subscription while a previous
//! invocation is still running.

pub mod memory;

use crate::error::TransportError;
use crate::guid::{EntityId, GuidPrefix};
use crate::qos::QosProfile;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Integer-keyed metadata attached to a message (RTPS inline QoS parameters).
pub type Parameters = BTreeMap<u16, Vec<u8>>;

/// Message envelope exchanged with the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataMessage {
    /// Metadata parameters (identity slots live here)
    pub parameters: Parameters,
    /// Serialized payload, if the sample carries one
    pub data: Option<Vec<u8>>,
}

impl DataMessage {
    pub fn new(parameters: Parameters, data: Vec<u8>) -> Self {
        Self {
            parameters,
            data: Some(data),
        }
    }
}

/// A named, typed channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicSpec {
    /// Topic name as seen by the transport
    pub name: String,
    /// Fully qualified type name
    pub type_name: String,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Credit handle passed to every receive callback.
pub trait Demand: Send + Sync {
    /// Allow `n` more deliveries on this subscription.
    fn request(&self, n: u32);
}

/// Receive callback of one subscription.
///
/// Invoked from a transport-owned thread. Implementations must be
/// `Send + Sync` and should not block.
pub trait SampleListener: Send + Sync {
    /// Next message on the channel. Call `demand.request(1)` when ready for
    /// the following one.
    fn on_next(&self, message: DataMessage, demand: &dyn Demand);

    /// Channel-level failure. No further messages are delivered afterwards.
    fn on_error(&self, error: TransportError);
}

/// Outbound side of a channel.
pub trait Publication: Send + Sync {
    /// Engine-local identifier of this publisher.
    fn entity_id(&self) -> EntityId;

    /// Queue a message for delivery to matched subscribers.
    fn submit(&self, message: DataMessage) -> Result<(), TransportError>;

    /// Unpublish. Later `submit` calls fail with `PublicationClosed`.
    fn close(&self);
}

/// Inbound side of a channel.
pub trait Subscription: Send + Sync {
    /// Engine-local identifier of this subscriber.
    fn entity_id(&self) -> EntityId;

    /// Stop deliveries. The listener is not called after this returns,
    /// except for an invocation already in progress.
    fn cancel(&self);
}

/// Pub/sub transport.
pub trait Transport: Send + Sync {
    /// Participant prefix of the local endpoint.
    fn guid_prefix(&self) -> GuidPrefix;

    /// Register a publisher on `topic`.
    fn publish(
        &self,
        topic: &TopicSpec,
        qos: &QosProfile,
    ) -> Result<Box<dyn Publication>, TransportError>;

    /// Register `listener` as a subscriber on `topic`.
    fn subscribe(
        &self,
        topic: &TopicSpec,
        qos: &QosProfile,
        listener: Arc<dyn SampleListener>,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

/// Request and reply channels of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Logical service name (used in logs and metrics)
    pub service_name: String,
    /// Client -> server channel
    pub request: TopicSpec,
    /// Server -> client channel
    pub reply: TopicSpec,
}

impl ServiceEndpoint {
    pub fn new(service_name: impl Into<String>, request: TopicSpec, reply: TopicSpec) -> Self {
        Self {
            service_name: service_name.into(),
            request,
            reply,
        }
    }
}
