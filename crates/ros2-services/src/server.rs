// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service server (replier).
//!
//! The ServiceServer receives requests, runs the handler for each one on
//! the blocking pool of a tokio runtime, and publishes the reply tagged
//! with the identity copied from the request.

use crate::config::ServiceConfig;
use crate::definition::ServiceDefinition;
use crate::error::{ServiceError, ServiceResult, TransportError};
use crate::identity::{find_identity, IdentityMatch};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::metrics::ServiceMetrics;
use crate::transport::{
    DataMessage, Demand, Publication, SampleListener, ServiceEndpoint, Subscription, Transport,
};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// Error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler trait for processing service requests.
///
/// Implement this trait to define your service logic. Any
/// `Fn(Request) -> Result<Response, HandlerError>` closure works as well.
pub trait ServiceHandler<D: ServiceDefinition>: Send + Sync + 'static {
    /// Compute the response for one request.
    ///
    /// An error (or a panic) suppresses the reply; the client is not
    /// notified.
    fn handle(&self, request: D::Request) -> Result<D::Response, HandlerError>;
}

impl<D, F> ServiceHandler<D> for F
where
    D: ServiceDefinition,
    F: Fn(D::Request) -> Result<D::Response, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: D::Request) -> Result<D::Response, HandlerError> {
        self(request)
    }
}

/// Server for handling service requests.
///
/// Requests are taken one at a time from the transport and processed
/// concurrently on the runtime's blocking pool, so replies may be
/// published in a different order than requests arrived.
///
/// # Example
///
/// ```
/// use ros2_services::transport::memory::MemoryBus;
/// use ros2_services::{HandlerError, RawService, ServiceEndpoint, ServiceServer, TopicSpec};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = Arc::new(MemoryBus::new());
/// let endpoint = ServiceEndpoint::new(
///     "echo",
///     TopicSpec::new("rq/echoRequest", "demo::srv::dds_::Echo_Request_"),
///     TopicSpec::new("rr/echoReply", "demo::srv::dds_::Echo_Response_"),
/// );
///
/// let handler = |payload: Vec<u8>| -> Result<Vec<u8>, HandlerError> { Ok(payload) };
/// let server = ServiceServer::<RawService>::new(bus, endpoint, handler)?;
/// server.start()?;
/// assert!(server.is_running());
/// server.close();
/// # Ok(())
/// # }
/// ```
pub struct ServiceServer<D: ServiceDefinition> {
    endpoint: ServiceEndpoint,
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    lifecycle: Lifecycle,

    /// Reply publication + request subscription, present while started
    channels: Mutex<Option<ServerChannels>>,

    /// Handler, runtime and counters shared with the request listener
    dispatch: Arc<Dispatch<D>>,
}

struct ServerChannels {
    replies: Arc<dyn Publication>,
    requests: Box<dyn Subscription>,
}

impl<D: ServiceDefinition> ServiceServer<D> {
    /// Create a server on the current tokio runtime.
    ///
    /// Fails with [`ServiceError::NoRuntime`] outside of a runtime context.
    pub fn new<H: ServiceHandler<D>>(
        transport: Arc<dyn Transport>,
        endpoint: ServiceEndpoint,
        handler: H,
    ) -> ServiceResult<Self> {
        let runtime = Handle::try_current().map_err(|_| ServiceError::NoRuntime)?;
        let metrics = Arc::new(ServiceMetrics::new(endpoint.service_name.clone()));
        Ok(Self::with_config(
            transport,
            endpoint,
            handler,
            ServiceConfig::default(),
            metrics,
            runtime,
        ))
    }

    /// Create a server with explicit configuration, metrics context and
    /// runtime handle.
    pub fn with_config<H: ServiceHandler<D>>(
        transport: Arc<dyn Transport>,
        endpoint: ServiceEndpoint,
        handler: H,
        config: ServiceConfig,
        metrics: Arc<ServiceMetrics>,
        runtime: Handle,
    ) -> Self {
        let dispatch = Arc::new(Dispatch {
            service_name: endpoint.service_name.clone(),
            handler: Arc::new(handler),
            runtime,
            metrics,
            slow_threshold: config.slow_handler_threshold(),
            replies: Mutex::new(None),
            fault: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            requests_processed: AtomicU64::new(0),
        });
        Self {
            endpoint,
            transport,
            config,
            lifecycle: Lifecycle::new(),
            channels: Mutex::new(None),
            dispatch,
        }
    }

    /// Bind the reply publication, then subscribe to requests.
    ///
    /// No-op when already started; fails with `AlreadyClosed` after close.
    pub fn start(&self) -> ServiceResult<()> {
        if self.lifecycle.start_with(|| self.bind())? {
            log::info!("ServiceServer '{}' started", self.endpoint.service_name);
            log::info!("  Request topic: {}", self.endpoint.request.name);
            log::info!("  Reply topic: {}", self.endpoint.reply.name);
        }
        Ok(())
    }

    fn bind(&self) -> ServiceResult<()> {
        let reply_topic = &self.endpoint.reply;
        let request_topic = &self.endpoint.request;

        log::debug!(
            "Registering publisher for {} with type {}",
            reply_topic.name,
            reply_topic.type_name
        );
        let replies: Arc<dyn Publication> = Arc::from(
            self.transport
                .publish(reply_topic, &self.config.reply_qos)?,
        );
        *self.dispatch.replies.lock() = Some(Arc::clone(&replies));

        log::debug!(
            "Registering subscriber for {} with type {}",
            request_topic.name,
            request_topic.type_name
        );
        let listener = Arc::new(RequestListener {
            dispatch: Arc::clone(&self.dispatch),
        });
        let requests = match self
            .transport
            .subscribe(request_topic, &self.config.request_qos, listener)
        {
            Ok(requests) => requests,
            Err(e) => {
                self.dispatch.replies.lock().take();
                replies.close();
                return Err(e.into());
            }
        };

        *self.channels.lock() = Some(ServerChannels { replies, requests });
        Ok(())
    }

    /// Stop receiving requests and unbind both channels. Idempotent.
    ///
    /// Handlers already running are not interrupted; their replies are
    /// discarded.
    pub fn close(&self) {
        let previous = self.lifecycle.close_with(|| {
            self.dispatch.shutdown.store(true, Ordering::Release);
            self.dispatch.replies.lock().take();
            if let Some(channels) = self.channels.lock().take() {
                channels.requests.cancel();
                channels.replies.close();
            }
        });
        if previous == LifecycleState::Started {
            log::info!(
                "ServiceServer '{}' stopped ({} requests processed)",
                self.endpoint.service_name,
                self.requests_processed()
            );
        }
    }

    /// Number of requests answered so far.
    pub fn requests_processed(&self) -> u64 {
        self.dispatch.requests_processed.load(Ordering::Relaxed)
    }

    /// Most recent protocol fault (disagreeing identity slots) seen on the
    /// request channel. The offending request is dropped; serving continues.
    pub fn fault(&self) -> Option<ServiceError> {
        self.dispatch.fault.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_started()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn service_name(&self) -> &str {
        &self.endpoint.service_name
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.dispatch.metrics
    }
}

impl<D: ServiceDefinition> Drop for ServiceServer<D> {
    fn drop(&mut self) {
        self.close();
    }
}

struct Dispatch<D: ServiceDefinition> {
    service_name: String,
    handler: Arc<dyn ServiceHandler<D>>,
    runtime: Handle,
    metrics: Arc<ServiceMetrics>,
    slow_threshold: Option<Duration>,
    replies: Mutex<Option<Arc<dyn Publication>>>,
    /// Most recent protocol fault seen on the request channel
    fault: Mutex<Option<ServiceError>>,
    shutdown: AtomicBool,
    requests_processed: AtomicU64,
}

impl<D: ServiceDefinition> Dispatch<D> {
    fn submit(self: &Arc<Self>, found: IdentityMatch, payload: Vec<u8>) {
        let this = Arc::clone(self);
        // Detached: close does not wait for in-flight handlers
        drop(
            self.runtime
                .spawn_blocking(move || this.process(found, payload)),
        );
    }

    fn process(&self, found: IdentityMatch, payload: Vec<u8>) {
        let id = found.identity.sequence;
        log::debug!("Processing request: seq={}", id);

        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| self.execute(&payload)));
        let elapsed = started.elapsed();
        self.metrics.record_handler_time(elapsed);
        if let Some(threshold) = self.slow_threshold {
            if elapsed > threshold {
                log::warn!(
                    "Handler of {} took {:?} for request {}",
                    self.service_name,
                    elapsed,
                    id
                );
            }
        }

        let response = match result {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                self.metrics.record_request_failed();
                log::error!("Service handler exception for request {}: {}", id, e);
                return;
            }
            Err(_) => {
                self.metrics.record_request_failed();
                log::error!("Service handler panicked on request {}", id);
                return;
            }
        };

        if self.shutdown.load(Ordering::Acquire) {
            log::debug!(
                "{} closed, discarding reply to request {}",
                self.service_name,
                id
            );
            return;
        }
        let Some(replies) = self.replies.lock().clone() else {
            return;
        };

        let reply = DataMessage::new(found.reply_parameters(), response);
        match replies.submit(reply) {
            Ok(()) => {
                self.metrics.record_reply_sent();
                self.requests_processed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Replied to request {}", id);
            }
            Err(e) => {
                self.metrics.record_request_failed();
                log::error!("Failed to send reply to request {}: {}", id, e);
            }
        }
    }

    fn execute(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let request = D::decode_request(payload)?;
        let response = self.handler.handle(request)?;
        Ok(D::encode_response(&response)?)
    }
}

/// Receive path of the request channel.
struct RequestListener<D: ServiceDefinition> {
    dispatch: Arc<Dispatch<D>>,
}

impl<D: ServiceDefinition> RequestListener<D> {
    fn handle(&self, message: DataMessage) {
        let dispatch = &self.dispatch;
        dispatch.metrics.record_request_received();

        let found = match find_identity(&message.parameters) {
            Ok(Some(found)) => found,
            Ok(None) => {
                log::warn!(
                    "Received request without identity on {}, ignoring it",
                    dispatch.service_name
                );
                dispatch.metrics.record_request_dropped();
                return;
            }
            Err(e) if e.is_protocol_fault() => {
                log::error!("Protocol fault on {}: {}", dispatch.service_name, e);
                dispatch.metrics.record_protocol_fault();
                dispatch.metrics.record_request_dropped();
                *dispatch.fault.lock() = Some(e);
                return;
            }
            Err(e) => {
                log::warn!("Dropping request on {}: {}", dispatch.service_name, e);
                dispatch.metrics.record_request_dropped();
                return;
            }
        };

        let Some(payload) = message.data else {
            log::warn!(
                "Request {} has no data in it, ignoring it",
                found.identity.sequence
            );
            dispatch.metrics.record_request_dropped();
            return;
        };

        dispatch.submit(found, payload);
    }
}

impl<D: ServiceDefinition> SampleListener for RequestListener<D> {
    fn on_next(&self, message: DataMessage, demand: &dyn Demand) {
        self.handle(message);
        demand.request(1);
    }

    fn on_error(&self, error: TransportError) {
        log::error!(
            "Request channel of {} failed: {}",
            self.dispatch.service_name,
            error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::RawService;
    use crate::guid::Guid;
    use crate::identity::{
        IdentitySlots, SampleIdentity, PID_FASTDDS_SAMPLE_IDENTITY, PID_RELATED_SAMPLE_IDENTITY,
    };
    use crate::qos::QosProfile;
    use crate::transport::memory::MemoryBus;
    use crate::transport::{Parameters, TopicSpec};
    use crossbeam::channel::{unbounded, Receiver, Sender};

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint::new(
            "echo",
            TopicSpec::new("rq/echoRequest", "Echo_Request_"),
            TopicSpec::new("rr/echoReply", "Echo_Response_"),
        )
    }

    struct Tap(Sender<DataMessage>);

    impl SampleListener for Tap {
        fn on_next(&self, message: DataMessage, demand: &dyn Demand) {
            let _ = self.0.send(message);
            demand.request(1);
        }
        fn on_error(&self, _error: TransportError) {}
    }

    /// Raw request publisher plus a tap on the reply topic.
    fn peer(bus: &MemoryBus) -> (Box<dyn Publication>, Box<dyn Subscription>, Receiver<DataMessage>) {
        let (tx, rx) = unbounded();
        let tap = bus
            .subscribe(&endpoint().reply, &QosProfile::rpc(), Arc::new(Tap(tx)))
            .unwrap();
        let requests = bus.publish(&endpoint().request, &QosProfile::rpc()).unwrap();
        (requests, tap, rx)
    }

    fn request(id: u64, slots: IdentitySlots, data: &[u8]) -> DataMessage {
        let origin = Guid::new([7; 12], [0, 0, 1, 3]);
        DataMessage::new(slots.tag(&SampleIdentity::new(origin, id)), data.to_vec())
    }

    fn echo_server(bus: &Arc<MemoryBus>) -> ServiceServer<RawService> {
        let handler = |payload: Vec<u8>| -> Result<Vec<u8>, HandlerError> {
            if payload == b"fail" {
                return Err("refused".into());
            }
            if payload == b"panic" {
                panic!("handler bug");
            }
            Ok(payload)
        };
        let server =
            ServiceServer::new(Arc::clone(bus) as Arc<dyn Transport>, endpoint(), handler).unwrap();
        server.start().unwrap();
        server
    }

    #[test]
    fn new_requires_runtime() {
        let bus = Arc::new(MemoryBus::new());
        let handler = |p: Vec<u8>| -> Result<Vec<u8>, HandlerError> { Ok(p) };
        let result = ServiceServer::<RawService>::new(bus, endpoint(), handler);
        assert!(matches!(result, Err(ServiceError::NoRuntime)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reply_echoes_every_identity_slot() {
        let bus = Arc::new(MemoryBus::new());
        let server = echo_server(&bus);
        let (requests, _tap, replies) = peer(&bus);

        requests
            .submit(request(9, IdentitySlots::Both, b"hello"))
            .unwrap();

        let reply = tokio::task::spawn_blocking(move || replies.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data.as_deref(), Some(&b"hello"[..]));
        assert!(reply.parameters.contains_key(&PID_FASTDDS_SAMPLE_IDENTITY));
        assert!(reply.parameters.contains_key(&PID_RELATED_SAMPLE_IDENTITY));
        let found = find_identity(&reply.parameters).unwrap().unwrap();
        assert_eq!(found.identity.sequence, 9);

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.requests_processed() < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.requests_processed(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_failures_are_isolated() {
        let bus = Arc::new(MemoryBus::new());
        let server = echo_server(&bus);
        let (requests, _tap, replies) = peer(&bus);

        requests.submit(request(1, IdentitySlots::Legacy, b"fail")).unwrap();
        requests.submit(request(2, IdentitySlots::Legacy, b"panic")).unwrap();
        requests.submit(request(3, IdentitySlots::Legacy, b"ok")).unwrap();

        let reply = tokio::task::spawn_blocking(move || replies.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        let found = find_identity(&reply.parameters).unwrap().unwrap();
        assert_eq!(found.identity.sequence, 3);
        assert!(server.is_running());

        // Failures are counted once the handlers have finished
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let snap = server.metrics().snapshot();
            if snap.requests_failed == 2 && snap.replies_sent == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snap = server.metrics().snapshot();
        assert_eq!(snap.requests_failed, 2);
        assert_eq!(snap.replies_sent, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_without_identity_are_dropped() {
        let bus = Arc::new(MemoryBus::new());
        let server = echo_server(&bus);
        let (requests, _tap, replies) = peer(&bus);

        requests
            .submit(DataMessage::new(Parameters::new(), b"anonymous".to_vec()))
            .unwrap();
        let mut truncated = Parameters::new();
        truncated.insert(PID_FASTDDS_SAMPLE_IDENTITY, vec![0; 12]);
        requests
            .submit(DataMessage::new(truncated, b"short".to_vec()))
            .unwrap();
        requests
            .submit(DataMessage {
                parameters: IdentitySlots::Legacy.tag(&SampleIdentity::new(Guid::zero(), 4)),
                data: None,
            })
            .unwrap();
        requests.submit(request(5, IdentitySlots::Legacy, b"ok")).unwrap();

        let reply = tokio::task::spawn_blocking(move || replies.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(find_identity(&reply.parameters).unwrap().unwrap().identity.sequence, 5);

        let snap = server.metrics().snapshot();
        assert_eq!(snap.requests_received, 4);
        assert_eq!(snap.requests_dropped, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disagreeing_identity_slots_are_reported_and_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let server = echo_server(&bus);
        let (requests, _tap, replies) = peer(&bus);
        assert!(server.fault().is_none());

        let origin = Guid::new([7; 12], [0, 0, 1, 3]);
        let mut params = Parameters::new();
        params.insert(
            PID_FASTDDS_SAMPLE_IDENTITY,
            SampleIdentity::new(origin, 1).encode().to_vec(),
        );
        params.insert(
            PID_RELATED_SAMPLE_IDENTITY,
            SampleIdentity::new(origin, 2).encode().to_vec(),
        );
        requests
            .submit(DataMessage::new(params, b"confused".to_vec()))
            .unwrap();
        requests.submit(request(3, IdentitySlots::Legacy, b"ok")).unwrap();

        let (first, second) = tokio::task::spawn_blocking(move || {
            let first = replies.recv_timeout(Duration::from_secs(2));
            let second = replies.recv_timeout(Duration::from_millis(200));
            (first, second)
        })
        .await
        .unwrap();
        let found = find_identity(&first.unwrap().parameters).unwrap().unwrap();
        assert_eq!(found.identity.sequence, 3);
        assert!(second.is_err());

        assert!(matches!(
            server.fault(),
            Some(ServiceError::IdentityMismatch { .. })
        ));
        let snap = server.metrics().snapshot();
        assert_eq!(snap.protocol_faults, 1);
        assert_eq!(snap.requests_dropped, 1);
        assert!(server.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_unbinds_channels() {
        let bus = Arc::new(MemoryBus::new());
        let server = echo_server(&bus);
        assert_eq!(bus.subscriber_count("rq/echoRequest"), 1);

        server.close();
        server.close();
        assert_eq!(server.state(), LifecycleState::Closed);
        assert_eq!(bus.subscriber_count("rq/echoRequest"), 0);
        assert_eq!(server.start(), Err(ServiceError::AlreadyClosed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reply_after_close_is_discarded() {
        let bus = Arc::new(MemoryBus::new());
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let handler = move |payload: Vec<u8>| -> Result<Vec<u8>, HandlerError> {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Ok(payload)
        };
        let server = ServiceServer::<RawService>::new(
            Arc::clone(&bus) as Arc<dyn Transport>,
            endpoint(),
            handler,
        )
        .unwrap();
        server.start().unwrap();
        let (requests, _tap, replies) = peer(&bus);

        requests.submit(request(1, IdentitySlots::Legacy, b"late")).unwrap();
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();

        server.close();
        release_tx.send(()).unwrap();

        let late = tokio::task::spawn_blocking(move || {
            replies.recv_timeout(Duration::from_millis(200))
        })
        .await
        .unwrap();
        assert!(late.is_err());
        assert_eq!(server.requests_processed(), 0);
    }
}
