// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process pub/sub bus.
//!
//! Implements [`Transport`] without any network: publications fan out to
//! every live subscription of the same topic inside this process. Each
//! subscription owns a delivery thread that honours the credit protocol
//! (one `on_next` per granted credit, never two concurrently).
//!
//! # Architecture
//!
//! ```text
//! Publication.submit()
//!       v
//! BusInner.topics[name] -> SubscriberSlot.queue (crossbeam, unbounded)
//!       v
//! delivery thread: recv -> wait credit -> listener.on_next()
//! ```
//!
//! Intended for tests, demos and intra-process services.

use super::{
    DataMessage, Demand, Publication, SampleListener, Subscription, TopicSpec, Transport,
};
use crate::error::TransportError;
use crate::guid::{generate_prefix, EntityId, GuidPrefix};
use crate::qos::QosProfile;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

/// RTPS entity kind: user writer, no key
const ENTITY_KIND_WRITER: u8 = 0x03;
/// RTPS entity kind: user reader, no key
const ENTITY_KIND_READER: u8 = 0x04;

/// In-process transport shared by every engine bound to it.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    prefix: GuidPrefix,
    next_entity: AtomicU32,
    topics: RwLock<HashMap<String, TopicEntry>>,
}

struct TopicEntry {
    type_name: String,
    subscribers: Vec<Arc<SubscriberSlot>>,
}

enum Delivery {
    Message(DataMessage),
    Error(TransportError),
    Stop,
}

struct SubscriberSlot {
    entity_id: EntityId,
    queue: Sender<Delivery>,
    credit: Arc<Credit>,
}

/// Outstanding delivery credit of one subscription.
struct Credit {
    available: Mutex<u64>,
    cond: Condvar,
    cancelled: AtomicBool,
}

impl Credit {
    fn new(initial: u64) -> Self {
        Self {
            available: Mutex::new(initial),
            cond: Condvar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Block until one credit is available. Returns false once cancelled.
    fn acquire(&self) -> bool {
        let mut available = self.available.lock();
        while *available == 0 && !self.is_cancelled() {
            self.cond.wait(&mut available);
        }
        if self.is_cancelled() {
            return false;
        }
        *available -= 1;
        true
    }

    fn cancel(&self) {
        let _guard = self.available.lock();
        self.cancelled.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Demand for Credit {
    fn request(&self, n: u32) {
        let mut available = self.available.lock();
        *available = available.saturating_add(u64::from(n));
        self.cond.notify_one();
    }
}

impl MemoryBus {
    /// Create a bus with a freshly generated participant prefix.
    pub fn new() -> Self {
        Self::with_prefix(generate_prefix())
    }

    /// Create a bus with a fixed participant prefix.
    pub fn with_prefix(prefix: GuidPrefix) -> Self {
        Self {
            inner: Arc::new(BusInner {
                prefix,
                next_entity: AtomicU32::new(1),
                topics: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Signal a channel-level error to every subscription of `topic`.
    ///
    /// The affected subscriptions are detached; their listeners receive
    /// `on_error` and no further messages.
    pub fn inject_error(&self, topic: &str, error: TransportError) {
        let slots = match self.inner.topics.write().get_mut(topic) {
            Some(entry) => std::mem::take(&mut entry.subscribers),
            None => return,
        };
        log::debug!(
            "[memory-bus] failing {} subscriber(s) on '{}': {}",
            slots.len(),
            topic,
            error
        );
        for slot in slots {
            // Receiver gone means the delivery thread already exited
            let _ = slot.queue.send(Delivery::Error(error.clone()));
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusInner {
    fn next_entity_id(&self, kind: u8) -> EntityId {
        let n = self.next_entity.fetch_add(1, Ordering::Relaxed);
        let bytes = n.to_be_bytes();
        [bytes[1], bytes[2], bytes[3], kind]
    }

    /// Bind `topic` to its type, or check it against the existing binding.
    fn bind_topic(&self, topic: &TopicSpec) -> Result<(), TransportError> {
        let mut topics = self.topics.write();
        let entry = topics
            .entry(topic.name.clone())
            .or_insert_with(|| TopicEntry {
                type_name: topic.type_name.clone(),
                subscribers: Vec::new(),
            });
        if entry.type_name != topic.type_name {
            return Err(TransportError::TypeMismatch {
                topic: topic.name.clone(),
                existing: entry.type_name.clone(),
                requested: topic.type_name.clone(),
            });
        }
        Ok(())
    }

    fn remove_subscriber(&self, topic: &str, entity_id: EntityId) {
        if let Some(entry) = self.topics.write().get_mut(topic) {
            entry.subscribers.retain(|s| s.entity_id != entity_id);
        }
    }
}

impl Transport for MemoryBus {
    fn guid_prefix(&self) -> GuidPrefix {
        self.inner.prefix
    }

    fn publish(
        &self,
        topic: &TopicSpec,
        _qos: &QosProfile,
    ) -> Result<Box<dyn Publication>, TransportError> {
        self.inner.bind_topic(topic)?;
        let entity_id = self.inner.next_entity_id(ENTITY_KIND_WRITER);
        log::debug!(
            "[memory-bus] publisher {:02x?} on '{}' ({})",
            entity_id,
            topic.name,
            topic.type_name
        );
        Ok(Box::new(MemoryPublication {
            bus: Arc::clone(&self.inner),
            topic: topic.name.clone(),
            entity_id,
            closed: AtomicBool::new(false),
        }))
    }

    fn subscribe(
        &self,
        topic: &TopicSpec,
        _qos: &QosProfile,
        listener: Arc<dyn SampleListener>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.inner.bind_topic(topic)?;
        let entity_id = self.inner.next_entity_id(ENTITY_KIND_READER);
        let (tx, rx) = channel::unbounded();
        let credit = Arc::new(Credit::new(1));

        let thread_credit = Arc::clone(&credit);
        let thread_topic = topic.name.clone();
        thread::Builder::new()
            .name(format!("memory-bus-{}", topic.name))
            .spawn(move || run_delivery(&thread_topic, rx, listener, thread_credit))
            .map_err(|e| TransportError::Channel {
                topic: topic.name.clone(),
                reason: format!("cannot spawn delivery thread: {}", e),
            })?;

        let slot = Arc::new(SubscriberSlot {
            entity_id,
            queue: tx,
            credit,
        });
        if let Some(entry) = self.inner.topics.write().get_mut(&topic.name) {
            entry.subscribers.push(Arc::clone(&slot));
        }
        log::debug!(
            "[memory-bus] subscriber {:02x?} on '{}' ({})",
            entity_id,
            topic.name,
            topic.type_name
        );

        Ok(Box::new(MemorySubscription {
            bus: Arc::clone(&self.inner),
            topic: topic.name.clone(),
            slot,
        }))
    }
}

/// Delivery loop of one subscription.
fn run_delivery(
    topic: &str,
    rx: Receiver<Delivery>,
    listener: Arc<dyn SampleListener>,
    credit: Arc<Credit>,
) {
    while let Ok(delivery) = rx.recv() {
        match delivery {
            Delivery::Message(message) => {
                if !credit.acquire() {
                    break;
                }
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    listener.on_next(message, credit.as_ref());
                }));
                if result.is_err() {
                    log::error!("[memory-bus] listener on '{}' panicked", topic);
                    // The listener never got to grant the next credit
                    credit.request(1);
                }
            }
            Delivery::Error(error) => {
                if !credit.is_cancelled() {
                    listener.on_error(error);
                }
                break;
            }
            Delivery::Stop => break,
        }
    }
    log::debug!("[memory-bus] delivery thread for '{}' exiting", topic);
}

struct MemoryPublication {
    bus: Arc<BusInner>,
    topic: String,
    entity_id: EntityId,
    closed: AtomicBool,
}

impl Publication for MemoryPublication {
    fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    fn submit(&self, message: DataMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::PublicationClosed(self.topic.clone()));
        }
        let topics = self.bus.topics.read();
        if let Some(entry) = topics.get(&self.topic) {
            for slot in &entry.subscribers {
                // Receiver gone means the subscription is being torn down
                let _ = slot.queue.send(Delivery::Message(message.clone()));
            }
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("[memory-bus] publisher on '{}' closed", self.topic);
        }
    }
}

struct MemorySubscription {
    bus: Arc<BusInner>,
    topic: String,
    slot: Arc<SubscriberSlot>,
}

impl Subscription for MemorySubscription {
    fn entity_id(&self) -> EntityId {
        self.slot.entity_id
    }

    fn cancel(&self) {
        if self.slot.credit.is_cancelled() {
            return;
        }
        self.slot.credit.cancel();
        self.bus.remove_subscriber(&self.topic, self.slot.entity_id);
        let _ = self.slot.queue.send(Delivery::Stop);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Parameters;
    use std::time::Duration;

    struct Collect {
        tx: Sender<Vec<u8>>,
        auto_request: bool,
        errors: Sender<TransportError>,
    }

    impl SampleListener for Collect {
        fn on_next(&self, message: DataMessage, demand: &dyn Demand) {
            let _ = self.tx.send(message.data.unwrap_or_default());
            if self.auto_request {
                demand.request(1);
            }
        }

        fn on_error(&self, error: TransportError) {
            let _ = self.errors.send(error);
        }
    }

    fn listener(auto_request: bool) -> (Arc<Collect>, Receiver<Vec<u8>>, Receiver<TransportError>) {
        let (tx, rx) = channel::unbounded();
        let (etx, erx) = channel::unbounded();
        (
            Arc::new(Collect {
                tx,
                auto_request,
                errors: etx,
            }),
            rx,
            erx,
        )
    }

    fn topic() -> TopicSpec {
        TopicSpec::new("rt/chatter", "std_msgs::msg::dds_::String_")
    }

    #[test]
    fn delivers_to_all_subscribers() {
        let bus = MemoryBus::new();
        let (l1, rx1, _) = listener(true);
        let (l2, rx2, _) = listener(true);
        let _s1 = bus.subscribe(&topic(), &QosProfile::rpc(), l1).unwrap();
        let _s2 = bus.subscribe(&topic(), &QosProfile::rpc(), l2).unwrap();
        let publication = bus.publish(&topic(), &QosProfile::rpc()).unwrap();

        publication
            .submit(DataMessage::new(Parameters::new(), vec![1, 2]))
            .unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(rx1.recv_timeout(timeout).unwrap(), vec![1, 2]);
        assert_eq!(rx2.recv_timeout(timeout).unwrap(), vec![1, 2]);
    }

    #[test]
    fn honours_credit() {
        let bus = MemoryBus::new();
        let (l, rx, _) = listener(false);
        let _sub = bus.subscribe(&topic(), &QosProfile::rpc(), l).unwrap();
        let publication = bus.publish(&topic(), &QosProfile::rpc()).unwrap();

        for i in 0..3u8 {
            publication
                .submit(DataMessage::new(Parameters::new(), vec![i]))
                .unwrap();
        }

        // Initial credit of one, never replenished
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![0]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn rejects_type_mismatch() {
        let bus = MemoryBus::new();
        let _p = bus.publish(&topic(), &QosProfile::rpc()).unwrap();
        let other = TopicSpec::new("rt/chatter", "other::Type");
        let err = bus.publish(&other, &QosProfile::rpc()).err().unwrap();
        assert!(matches!(err, TransportError::TypeMismatch { .. }));
    }

    #[test]
    fn closed_publication_rejects_submit() {
        let bus = MemoryBus::new();
        let publication = bus.publish(&topic(), &QosProfile::rpc()).unwrap();
        publication.close();
        let err = publication.submit(DataMessage::default()).unwrap_err();
        assert!(matches!(err, TransportError::PublicationClosed(_)));
    }

    #[test]
    fn cancel_detaches_subscriber() {
        let bus = MemoryBus::new();
        let (l, _rx, _) = listener(true);
        let sub = bus.subscribe(&topic(), &QosProfile::rpc(), l).unwrap();
        assert_eq!(bus.subscriber_count("rt/chatter"), 1);
        sub.cancel();
        assert_eq!(bus.subscriber_count("rt/chatter"), 0);
    }

    #[test]
    fn inject_error_reaches_listener() {
        let bus = MemoryBus::new();
        let (l, _rx, errors) = listener(true);
        let _sub = bus.subscribe(&topic(), &QosProfile::rpc(), l).unwrap();

        bus.inject_error("rt/chatter", TransportError::Shutdown);

        let err = errors.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(err, TransportError::Shutdown);
        assert_eq!(bus.subscriber_count("rt/chatter"), 0);
    }

    #[test]
    fn entity_ids_are_distinct() {
        let bus = MemoryBus::with_prefix([7; 12]);
        let p1 = bus.publish(&topic(), &QosProfile::rpc()).unwrap();
        let p2 = bus.publish(&topic(), &QosProfile::rpc()).unwrap();
        assert_ne!(p1.entity_id(), p2.entity_id());
        assert_eq!(p1.entity_id()[3], ENTITY_KIND_WRITER);
        assert_eq!(bus.guid_prefix(), [7; 12]);
    }
}
