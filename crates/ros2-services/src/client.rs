// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client (requester).
//!
//! The ServiceClient publishes requests tagged with a fresh
//! [`SampleIdentity`] and completes the matching [`PendingReply`] when a
//! response carrying the same identity comes back on the reply channel.

use crate::config::ServiceConfig;
use crate::correlation::{CorrelationTable, SlotReceiver};
use crate::definition::{RawService, ServiceDefinition};
use crate::error::{CodecError, ServiceError, ServiceResult, TransportError};
use crate::guid::Guid;
use crate::identity::{find_identity, SampleIdentity};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::metrics::ServiceMetrics;
use crate::transport::{
    DataMessage, Demand, Publication, SampleListener, ServiceEndpoint, Subscription, Transport,
};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Client for sending requests to a service.
///
/// Channels are bound lazily on the first request (or explicitly with
/// [`start`](Self::start)). Responses may complete in any order; there is
/// no per-request timeout, wrap the returned [`PendingReply`] in
/// `tokio::time::timeout` if needed.
///
/// # Example
///
/// ```
/// use ros2_services::transport::memory::MemoryBus;
/// use ros2_services::{RawService, ServiceClient, ServiceEndpoint, TopicSpec};
/// use std::sync::Arc;
///
/// let bus = Arc::new(MemoryBus::new());
/// let endpoint = ServiceEndpoint::new(
///     "echo",
///     TopicSpec::new("rq/echoRequest", "demo::srv::dds_::Echo_Request_"),
///     TopicSpec::new("rr/echoReply", "demo::srv::dds_::Echo_Response_"),
/// );
/// let client = ServiceClient::<RawService>::new(bus, endpoint);
///
/// let pending = client.send_request(&b"ping".to_vec()).unwrap();
/// assert_eq!(pending.id(), 1);
///
/// client.close();
/// assert!(pending.blocking_wait().is_err());
/// ```
pub struct ServiceClient<D: ServiceDefinition = RawService> {
    endpoint: ServiceEndpoint,
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    lifecycle: Lifecycle,

    /// Request publication + reply subscription, present while started
    channels: RwLock<Option<ClientChannels>>,

    /// Next sequence number (starts at 1)
    sequence: AtomicU64,

    /// State shared with the reply listener
    shared: Arc<ClientShared>,

    _definition: PhantomData<fn() -> D>,
}

struct ClientChannels {
    origin: Guid,
    requests: Box<dyn Publication>,
    replies: Box<dyn Subscription>,
}

struct ClientShared {
    service_name: String,
    pending: CorrelationTable<Vec<u8>>,
    /// First protocol fault or channel failure; poisons the client
    fault: Mutex<Option<ServiceError>>,
    metrics: Arc<ServiceMetrics>,
}

impl<D: ServiceDefinition> ServiceClient<D> {
    /// Create a client with default configuration and its own metrics.
    pub fn new(transport: Arc<dyn Transport>, endpoint: ServiceEndpoint) -> Self {
        let metrics = Arc::new(ServiceMetrics::new(endpoint.service_name.clone()));
        Self::with_config(transport, endpoint, ServiceConfig::default(), metrics)
    }

    /// Create a client with explicit configuration and metrics context.
    pub fn with_config(
        transport: Arc<dyn Transport>,
        endpoint: ServiceEndpoint,
        config: ServiceConfig,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let shared = Arc::new(ClientShared {
            service_name: endpoint.service_name.clone(),
            pending: CorrelationTable::new(),
            fault: Mutex::new(None),
            metrics,
        });
        Self {
            endpoint,
            transport,
            config,
            lifecycle: Lifecycle::new(),
            channels: RwLock::new(None),
            sequence: AtomicU64::new(1),
            shared,
            _definition: PhantomData,
        }
    }

    /// Bind the request and reply channels.
    ///
    /// No-op when already started; fails with `AlreadyClosed` after close.
    pub fn start(&self) -> ServiceResult<()> {
        if self.lifecycle.start_with(|| self.bind())? {
            log::info!("ServiceClient '{}' started", self.endpoint.service_name);
        }
        Ok(())
    }

    fn bind(&self) -> ServiceResult<()> {
        let request_topic = &self.endpoint.request;
        let reply_topic = &self.endpoint.reply;

        log::debug!(
            "Registering publisher for {} with type {}",
            request_topic.name,
            request_topic.type_name
        );
        let requests = self
            .transport
            .publish(request_topic, &self.config.request_qos)?;
        let origin = Guid::new(self.transport.guid_prefix(), requests.entity_id());

        log::debug!(
            "Registering subscriber for {} with type {}",
            reply_topic.name,
            reply_topic.type_name
        );
        let listener = Arc::new(ReplyListener {
            shared: Arc::clone(&self.shared),
            origin,
        });
        let replies = match self
            .transport
            .subscribe(reply_topic, &self.config.reply_qos, listener)
        {
            Ok(replies) => replies,
            Err(e) => {
                requests.close();
                return Err(e.into());
            }
        };

        *self.channels.write() = Some(ClientChannels {
            origin,
            requests,
            replies,
        });
        Ok(())
    }

    /// Publish `request` and return a handle to its eventual response.
    ///
    /// Returns as soon as the request is handed to the transport. Starts
    /// the client on first use.
    pub fn send_request(&self, request: &D::Request) -> ServiceResult<PendingReply<D::Response>> {
        if let Some(fault) = self.fault() {
            return Err(fault);
        }
        self.start()?;

        let payload = D::encode_request(request)?;
        let id = self.sequence.fetch_add(1, Ordering::Relaxed);

        // Register before publishing so a fast reply always finds its slot
        let rx = self.shared.pending.register(id)?;
        if self.lifecycle.is_closed() {
            self.shared.pending.fail(id, ServiceError::AlreadyClosed);
            return Err(ServiceError::AlreadyClosed);
        }
        // The fault is recorded before fail_all, so a poison racing with
        // register either shows up here or fails the slot itself
        if let Some(fault) = self.fault() {
            self.shared.pending.fail(id, fault.clone());
            return Err(fault);
        }

        let submitted = {
            let channels = self.channels.read();
            match channels.as_ref() {
                Some(channels) => {
                    let identity = SampleIdentity::new(channels.origin, id);
                    let params = self.config.identity_slots.tag(&identity);
                    channels
                        .requests
                        .submit(DataMessage::new(params, payload))
                        .map_err(ServiceError::from)
                }
                None => Err(ServiceError::AlreadyClosed),
            }
        };
        if let Err(e) = submitted {
            self.shared.pending.fail(id, e.clone());
            return Err(e);
        }

        self.shared.metrics.record_request_sent();
        log::debug!(
            "Submitted request {} for {}",
            id,
            self.endpoint.service_name
        );

        Ok(PendingReply {
            id,
            rx,
            decode: D::decode_response,
        })
    }

    /// Close the client: unbind channels and fail every pending request
    /// with [`ServiceError::ServiceClosed`]. Idempotent.
    pub fn close(&self) {
        let previous = self.lifecycle.close_with(|| {
            if let Some(channels) = self.channels.write().take() {
                channels.requests.close();
                channels.replies.cancel();
            }
            let failed = self.shared.pending.fail_all(&ServiceError::ServiceClosed);
            if failed > 0 {
                log::debug!(
                    "ServiceClient '{}' failed {} pending request(s) on close",
                    self.endpoint.service_name,
                    failed
                );
            }
        });
        if previous != LifecycleState::Closed {
            log::info!("ServiceClient '{}' closed", self.endpoint.service_name);
        }
    }

    /// Protocol fault or channel failure that poisoned this client, if any.
    pub fn fault(&self) -> Option<ServiceError> {
        self.shared.fault.lock().clone()
    }

    /// Identity origin of this client.
    ///
    /// Fails with `NotStarted` before the channels are bound and with
    /// `AlreadyClosed` once they are released.
    pub fn origin(&self) -> ServiceResult<Guid> {
        self.lifecycle.ensure_started()?;
        self.channels
            .read()
            .as_ref()
            .map(|c| c.origin)
            .ok_or(ServiceError::AlreadyClosed)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn service_name(&self) -> &str {
        &self.endpoint.service_name
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.shared.metrics
    }
}

impl<D: ServiceDefinition> Drop for ServiceClient<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receive path of the reply channel.
struct ReplyListener {
    shared: Arc<ClientShared>,
    origin: Guid,
}

impl ReplyListener {
    fn handle(&self, message: DataMessage) {
        let shared = &self.shared;
        let found = match find_identity(&message.parameters) {
            Ok(Some(found)) => found,
            Ok(None) => {
                log::warn!(
                    "Received response without identity on {}, ignoring it",
                    shared.service_name
                );
                shared.metrics.record_response_unmatched();
                return;
            }
            Err(e) if e.is_protocol_fault() => {
                log::error!("Protocol fault on {}: {}", shared.service_name, e);
                shared.poison(e);
                return;
            }
            Err(e) => {
                log::warn!(
                    "Dropping response on {}: {}",
                    shared.service_name,
                    e
                );
                shared.metrics.record_response_unmatched();
                return;
            }
        };

        let id = found.identity.sequence;
        if found.identity.origin != self.origin {
            // Reply channel is shared by every client of the service
            log::trace!(
                "Response {} addressed to {}, not to this client",
                id,
                found.identity.origin
            );
            shared.metrics.record_response_unmatched();
            return;
        }

        let Some(data) = message.data else {
            log::warn!("Response {} has no data in it", id);
            let missing = CodecError::Invalid("response without payload".to_string());
            shared.pending.fail(id, missing.into());
            return;
        };

        if shared.pending.resolve(id, data) {
            log::debug!("Received result for request {}", id);
            shared.metrics.record_response_received();
        } else {
            log::warn!(
                "Cannot match received response with any known requests. Ignoring response {}...",
                id
            );
            shared.metrics.record_response_unmatched();
        }
    }
}

impl ClientShared {
    /// Record `error` as the client's fault and fail everything pending.
    fn poison(&self, error: ServiceError) {
        if error.is_protocol_fault() {
            self.metrics.record_protocol_fault();
        }
        self.fault.lock().get_or_insert_with(|| error.clone());
        self.pending.fail_all(&error);
    }
}

impl SampleListener for ReplyListener {
    fn on_next(&self, message: DataMessage, demand: &dyn Demand) {
        self.handle(message);
        demand.request(1);
    }

    fn on_error(&self, error: TransportError) {
        log::error!(
            "Reply channel of {} failed: {}",
            self.shared.service_name,
            error
        );
        self.shared.poison(ServiceError::Transport(error));
    }
}

/// Deferred response of one request.
///
/// Resolves to the decoded response, or to an error when the client
/// closes, the reply channel fails, or a protocol fault is detected.
/// Never resolves if the server does not answer.
#[must_use = "a PendingReply does nothing unless awaited"]
pub struct PendingReply<T> {
    id: u64,
    rx: SlotReceiver<Vec<u8>>,
    decode: fn(&[u8]) -> Result<T, CodecError>,
}

impl<T> PendingReply<T> {
    /// Sequence number assigned to the request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the current thread until the response arrives.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_wait(self) -> ServiceResult<T> {
        let decode = self.decode;
        Self::finish(self.rx.blocking_recv(), decode)
    }

    fn finish(
        received: Result<ServiceResult<Vec<u8>>, tokio::sync::oneshot::error::RecvError>,
        decode: fn(&[u8]) -> Result<T, CodecError>,
    ) -> ServiceResult<T> {
        match received {
            Ok(Ok(bytes)) => decode(&bytes).map_err(ServiceError::from),
            Ok(Err(e)) => Err(e),
            // Slot dropped without completion: the client went away
            Err(_) => Err(ServiceError::ServiceClosed),
        }
    }
}

impl<T> Future for PendingReply<T> {
    type Output = ServiceResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let decode = self.decode;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| Self::finish(received, decode))
    }
}

impl<T> std::fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").field("id", &self.id).finish()
    }
}
