//! Parameter table: latest values, subscriptions and local publications
//!
//! Every parameter has at most one current value, overwritten in place by
//! each update. Subscribers are kept per parameter in a copy-on-write list:
//! a delivery clones the `Arc` of the list at its start, so (un)registering
//! while a delivery is running only affects the next one. Unregistering also
//! clears the subscriber's active flag, which the running delivery checks
//! before each call.
//!
//! Values published locally are stored immediately and then queued for the
//! dispatch worker, so local subscribers are notified on the same thread as
//! for values received from the bus. Every update carries a sequence stamp
//! taken when it entered the node; an update older than the stored value is
//! not stored, and one older than the last delivered update is not delivered.

mod catalogue;

pub use catalogue::{find_by_name, standard_catalogue, ParameterDefinition};

use crate::codec::{CanasMessage, DataType, DecodeError, ParameterValue};
use crate::stats::NodeStats;
use crate::sync::Event;
use crate::types::{from_ns, next_sequence, now_ns, NodeError, Result, Timestamp};
use crossbeam::queue::ArrayQueue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result returned by a subscriber
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Subscriber callback, run on the dispatch thread
pub type Handler = Arc<dyn Fn(&ParameterUpdate) -> HandlerResult + Send + Sync>;

/// One value update as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterUpdate {
    /// Parameter identifier
    pub id: u16,
    /// Node that produced the value
    pub node_id: u8,
    /// The new value
    pub value: ParameterValue,
    /// Message code of the frame (per-parameter counter of the sender)
    pub message_code: u8,
    /// Arrival time, or publish time for local values
    pub timestamp_ns: u64,
    /// Order in which the update entered the node
    pub sequence: u64,
    /// True when published by this node
    pub local: bool,
}

impl ParameterUpdate {
    /// Build an update from a received message
    pub fn from_message(message: &CanasMessage, timestamp_ns: u64, sequence: u64) -> Self {
        Self {
            id: message.id,
            node_id: message.node_id,
            value: message.value,
            message_code: message.message_code,
            timestamp_ns,
            sequence,
            local: false,
        }
    }

    /// Timestamp as a date-time
    pub fn timestamp(&self) -> Timestamp {
        from_ns(self.timestamp_ns)
    }
}

/// Handle returned by [`ParameterTable::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    parameter_id: u16,
    id: u64,
}

impl SubscriptionHandle {
    /// Parameter this subscription listens to
    pub fn parameter_id(&self) -> u16 {
        self.parameter_id
    }
}

/// Point-in-time view of a parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSnapshot {
    pub value: ParameterValue,
    /// Time since the value was last updated
    pub age: Duration,
    /// True when `age` exceeds the parameter's staleness limit
    pub stale: bool,
    pub node_id: u8,
    pub timestamp: Timestamp,
}

/// How a locally owned parameter is put on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Retransmit the latest value at this interval
    pub interval: Option<Duration>,
    /// Transmit as soon as the value is published
    pub on_change: bool,
}

impl PublishPolicy {
    /// Periodic transmission only
    pub fn periodic(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            on_change: false,
        }
    }

    /// Transmit on every publish
    pub fn on_change() -> Self {
        Self {
            interval: None,
            on_change: true,
        }
    }
}

struct Subscriber {
    id: u64,
    owner: String,
    handler: Handler,
    active: AtomicBool,
}

struct Publication {
    policy: PublishPolicy,
    next_due: Option<Instant>,
    pending: bool,
    message_code: u8,
}

#[derive(Default)]
struct ParameterEntry {
    name: Option<String>,
    datatype: Option<DataType>,
    stale_after: Option<Duration>,
    value: Option<ParameterValue>,
    node_id: u8,
    timestamp_ns: u64,
    // Sequence of the stored value and of the last delivered update
    sequence: u64,
    delivered: u64,
    updated_at: Option<Instant>,
    subscribers: Arc<Vec<Arc<Subscriber>>>,
    publication: Option<Publication>,
}

impl ParameterEntry {
    /// Lock the data type on first use and reject anything else afterwards
    fn accept(&mut self, id: u16, datatype: DataType) -> std::result::Result<(), DecodeError> {
        match self.datatype {
            Some(expected) if expected != datatype => Err(DecodeError::TypeMismatch {
                id,
                expected,
                actual: datatype,
            }),
            Some(_) => Ok(()),
            None => {
                self.datatype = Some(datatype);
                Ok(())
            }
        }
    }

    fn store(&mut self, update: &ParameterUpdate) {
        self.value = Some(update.value);
        self.node_id = update.node_id;
        self.timestamp_ns = update.timestamp_ns;
        self.sequence = update.sequence;
        self.updated_at = Some(Instant::now());
    }

    /// Claim delivery of `update`, false if a newer one was already delivered
    fn claim_delivery(&mut self, update: &ParameterUpdate) -> bool {
        if update.sequence <= self.delivered {
            return false;
        }
        self.delivered = update.sequence;
        true
    }
}

/// Counts from one delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Shared parameter state of a node
pub struct ParameterTable {
    node_id: u8,
    entries: RwLock<HashMap<u16, ParameterEntry>>,
    next_subscription: AtomicU64,
    local: ArrayQueue<ParameterUpdate>,
    dispatch_wake: Arc<Event>,
    publish_wake: Arc<Event>,
    stats: Arc<NodeStats>,
}

impl ParameterTable {
    /// Create a table for the node `node_id`
    ///
    /// `dispatch_wake` is set when a local update is queued for delivery,
    /// `publish_wake` when an on-change parameter needs transmitting.
    pub fn new(
        node_id: u8,
        local_length: usize,
        dispatch_wake: Arc<Event>,
        publish_wake: Arc<Event>,
        stats: Arc<NodeStats>,
    ) -> Self {
        Self {
            node_id,
            entries: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            local: ArrayQueue::new(local_length.max(1)),
            dispatch_wake,
            publish_wake,
            stats,
        }
    }

    /// Node id stamped on local publications
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Fix the data type (and name, staleness) of a parameter
    pub fn define(&self, definition: &ParameterDefinition) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.entry(definition.id).or_default();
        entry.accept(definition.id, definition.datatype)?;
        entry.name = Some(definition.name.clone());
        entry.stale_after = definition.stale_after;
        Ok(())
    }

    /// Data type locked for a parameter, if any
    pub fn datatype(&self, parameter_id: u16) -> Option<DataType> {
        self.entries.read().get(&parameter_id).and_then(|e| e.datatype)
    }

    /// Name of a defined parameter
    pub fn name(&self, parameter_id: u16) -> Option<String> {
        self.entries
            .read()
            .get(&parameter_id)
            .and_then(|e| e.name.clone())
    }

    /// Identifiers with a definition, a value or subscribers
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Subscribe `handler` to updates of `parameter_id`
    ///
    /// `owner` tags the subscription in logs.
    pub fn register(&self, parameter_id: u16, owner: &str, handler: Handler) -> SubscriptionHandle {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            owner: owner.to_string(),
            handler,
            active: AtomicBool::new(true),
        });

        let mut entries = self.entries.write();
        let entry = entries.entry(parameter_id).or_default();
        let mut list = Vec::with_capacity(entry.subscribers.len() + 1);
        list.extend(entry.subscribers.iter().cloned());
        list.push(subscriber);
        entry.subscribers = Arc::new(list);

        log::debug!("'{}' subscribed to parameter {}", owner, parameter_id);
        SubscriptionHandle { parameter_id, id }
    }

    /// Remove a subscription, returning false if it was already gone
    pub fn unregister(&self, handle: SubscriptionHandle) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&handle.parameter_id) else {
            return false;
        };
        let Some(found) = entry.subscribers.iter().find(|s| s.id == handle.id) else {
            return false;
        };

        found.active.store(false, Ordering::Release);
        log::debug!(
            "'{}' unsubscribed from parameter {}",
            found.owner,
            handle.parameter_id
        );
        let list: Vec<Arc<Subscriber>> = entry
            .subscribers
            .iter()
            .filter(|s| s.id != handle.id)
            .cloned()
            .collect();
        entry.subscribers = Arc::new(list);
        true
    }

    /// Number of subscribers of a parameter
    pub fn subscriber_count(&self, parameter_id: u16) -> usize {
        self.entries
            .read()
            .get(&parameter_id)
            .map_or(0, |e| e.subscribers.len())
    }

    /// Take ownership of a parameter for transmission
    ///
    /// A periodic parameter is first transmitted one interval from now.
    /// A zero interval is rejected with `Config`.
    pub fn own(&self, parameter_id: u16, policy: PublishPolicy) -> Result<()> {
        if policy.interval == Some(Duration::ZERO) {
            return Err(NodeError::Config(format!(
                "parameter {} has a zero publish interval",
                parameter_id
            )));
        }
        let mut entries = self.entries.write();
        let entry = entries.entry(parameter_id).or_default();
        let message_code = entry.publication.as_ref().map_or(0, |p| p.message_code);
        entry.publication = Some(Publication {
            policy,
            next_due: policy.interval.map(|i| Instant::now() + i),
            pending: false,
            message_code,
        });
        log::info!("Publishing parameter {} with {:?}", parameter_id, policy);
        Ok(())
    }

    /// Stop transmitting a parameter
    pub fn disown(&self, parameter_id: u16) -> bool {
        self.entries
            .write()
            .get_mut(&parameter_id)
            .and_then(|e| e.publication.take())
            .is_some()
    }

    /// Publish a value from this node
    ///
    /// Stores the value and queues it for local subscribers and for
    /// transmission. A parameter without a publish policy is owned on-change
    /// from its first publication. When the local queue is full nothing is
    /// stored or transmitted and `QueueFull` is returned.
    pub fn publish_local(&self, parameter_id: u16, value: ParameterValue) -> Result<()> {
        let on_change = {
            let mut entries = self.entries.write();
            let entry = entries.entry(parameter_id).or_default();
            entry.accept(parameter_id, value.datatype())?;

            // Stamped and queued under the table lock: queue order is store order
            let update = ParameterUpdate {
                id: parameter_id,
                node_id: self.node_id,
                value,
                message_code: 0,
                timestamp_ns: now_ns(),
                sequence: next_sequence(),
                local: true,
            };
            if self.local.push(update).is_err() {
                log::warn!("Local update queue full, parameter {} not published", parameter_id);
                return Err(NodeError::QueueFull("local"));
            }
            entry.store(&update);

            let publication = entry.publication.get_or_insert_with(|| {
                log::debug!("Parameter {} owned on-change by first publish", parameter_id);
                Publication {
                    policy: PublishPolicy::on_change(),
                    next_due: None,
                    pending: false,
                    message_code: 0,
                }
            });
            if publication.policy.on_change {
                publication.pending = true;
            }
            publication.policy.on_change
        };

        self.dispatch_wake.set();
        if on_change {
            self.publish_wake.set();
        }
        Ok(())
    }

    /// Latest value of a parameter without waiting
    pub fn get_latest(&self, parameter_id: u16) -> Option<ParameterSnapshot> {
        let entries = self.entries.read();
        let entry = entries.get(&parameter_id)?;
        let value = entry.value?;
        let age = entry.updated_at.map_or(Duration::ZERO, |t| t.elapsed());

        Some(ParameterSnapshot {
            value,
            age,
            stale: entry.stale_after.map_or(false, |limit| age > limit),
            node_id: entry.node_id,
            timestamp: from_ns(entry.timestamp_ns),
        })
    }

    /// Next queued local update
    pub(crate) fn next_local(&self) -> Option<ParameterUpdate> {
        self.local.pop()
    }

    /// Store a received update and notify subscribers (dispatch thread)
    ///
    /// An update older than the stored value is neither stored nor delivered.
    pub(crate) fn deliver_remote(&self, update: &ParameterUpdate) -> std::result::Result<Delivery, DecodeError> {
        let subscribers = {
            let mut entries = self.entries.write();
            let entry = entries.entry(update.id).or_default();
            entry.accept(update.id, update.value.datatype())?;
            if update.sequence > entry.sequence {
                entry.store(update);
            }
            if !entry.claim_delivery(update) {
                log::debug!("Parameter {}: superseded update from node {} skipped", update.id, update.node_id);
                return Ok(Delivery::default());
            }
            entry.subscribers.clone()
        };
        Ok(self.notify(&subscribers, update))
    }

    /// Notify subscribers of an already stored local update (dispatch thread)
    pub(crate) fn deliver_local(&self, update: &ParameterUpdate) -> Delivery {
        let subscribers = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(&update.id) else {
                return Delivery::default();
            };
            if !entry.claim_delivery(update) {
                log::debug!("Parameter {}: superseded local update skipped", update.id);
                return Delivery::default();
            }
            entry.subscribers.clone()
        };
        self.notify(&subscribers, update)
    }

    fn notify(&self, subscribers: &[Arc<Subscriber>], update: &ParameterUpdate) -> Delivery {
        let mut delivery = Delivery::default();

        for subscriber in subscribers {
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(update))) {
                Ok(Ok(())) => {
                    self.stats.delivered();
                    delivery.delivered += 1;
                }
                Ok(Err(e)) => {
                    self.stats.handler_failed();
                    delivery.failed += 1;
                    log::warn!(
                        "Handler '{}' failed on parameter {}: {}",
                        subscriber.owner,
                        update.id,
                        e
                    );
                }
                Err(_) => {
                    self.stats.handler_failed();
                    delivery.failed += 1;
                    log::error!(
                        "Handler '{}' panicked on parameter {}",
                        subscriber.owner,
                        update.id
                    );
                }
            }
        }
        delivery
    }

    /// Collect the messages due for transmission at `now`
    ///
    /// Appends to `out` and returns the earliest future due time of any
    /// periodic parameter.
    pub(crate) fn collect_due(&self, now: Instant, out: &mut Vec<CanasMessage>) -> Option<Instant> {
        let mut entries = self.entries.write();
        let mut next_wake: Option<Instant> = None;

        for (&id, entry) in entries.iter_mut() {
            let Some(publication) = entry.publication.as_mut() else {
                continue;
            };

            let periodic_due = publication.next_due.map_or(false, |due| now >= due);
            if let Some(value) = entry.value {
                if publication.pending || periodic_due {
                    out.push(CanasMessage::new(
                        id,
                        self.node_id,
                        0,
                        publication.message_code,
                        value,
                    ));
                    publication.message_code = publication.message_code.wrapping_add(1);
                    publication.pending = false;
                }
            }

            if let (Some(interval), Some(due)) = (publication.policy.interval, publication.next_due) {
                if periodic_due {
                    let mut next = due + interval;
                    if next <= now {
                        next = now + interval;
                    }
                    publication.next_due = Some(next);
                }
            }
            if let Some(due) = publication.next_due {
                next_wake = Some(next_wake.map_or(due, |w| w.min(due)));
            }
        }
        next_wake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn table() -> ParameterTable {
        ParameterTable::new(
            7,
            16,
            Arc::new(Event::auto()),
            Arc::new(Event::auto()),
            Arc::new(NodeStats::new()),
        )
    }

    fn update(id: u16, value: ParameterValue) -> ParameterUpdate {
        ParameterUpdate {
            id,
            node_id: 3,
            value,
            message_code: 0,
            timestamp_ns: now_ns(),
            sequence: next_sequence(),
            local: false,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Handler {
        let log = log.clone();
        let tag = tag.to_string();
        Arc::new(move |u: &ParameterUpdate| -> HandlerResult {
            log.lock().push(format!("{}:{}", tag, u.value));
            Ok(())
        })
    }

    #[test]
    fn test_registration_order() {
        let t = table();
        let log = Arc::new(Mutex::new(Vec::new()));
        t.register(1034, "a", recorder(&log, "a"));
        t.register(1034, "b", recorder(&log, "b"));

        let d = t.deliver_remote(&update(1034, ParameterValue::UShort(1013))).unwrap();
        assert_eq!(d, Delivery { delivered: 2, failed: 0 });
        assert_eq!(*log.lock(), vec!["a:1013", "b:1013"]);
    }

    #[test]
    fn test_type_locks_on_first_update() {
        let t = table();
        t.deliver_remote(&update(500, ParameterValue::Short(1))).unwrap();
        assert_eq!(t.datatype(500), Some(DataType::Short));

        let err = t.deliver_remote(&update(500, ParameterValue::Float(1.0))).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { id: 500, .. }));
        assert_eq!(t.get_latest(500).unwrap().value, ParameterValue::Short(1));
    }

    #[test]
    fn test_definition_rejects_other_types() {
        let t = table();
        t.define(&ParameterDefinition::new(1034, "qnh", DataType::UShort)).unwrap();
        assert!(t.deliver_remote(&update(1034, ParameterValue::Float(1013.0))).is_err());
        assert!(matches!(
            t.publish_local(1034, ParameterValue::Short(1)),
            Err(NodeError::Decode(DecodeError::TypeMismatch { .. }))
        ));
        assert_eq!(t.name(1034).as_deref(), Some("qnh"));
    }

    #[test]
    fn test_unregister() {
        let t = table();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = t.register(300, "gauge", recorder(&log, "g"));

        assert!(t.unregister(handle));
        assert!(!t.unregister(handle));
        t.deliver_remote(&update(300, ParameterValue::Float(1.0))).unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(t.subscriber_count(300), 0);
    }

    #[test]
    fn test_handler_failures_are_isolated() {
        let t = table();
        let log = Arc::new(Mutex::new(Vec::new()));
        t.register(300, "err", Arc::new(|_: &ParameterUpdate| -> HandlerResult { Err("bad value".into()) }));
        t.register(300, "panic", Arc::new(|_: &ParameterUpdate| -> HandlerResult { panic!("widget bug") }));
        t.register(300, "ok", recorder(&log, "ok"));

        let d = t.deliver_remote(&update(300, ParameterValue::Float(2.0))).unwrap();
        assert_eq!(d, Delivery { delivered: 1, failed: 2 });
        assert_eq!(log.lock().len(), 1);
        assert_eq!(t.stats.snapshot().handler_failures, 2);
    }

    #[test]
    fn test_get_latest_staleness() {
        let t = table();
        assert!(t.get_latest(315).is_none());

        t.define(
            &ParameterDefinition::new(315, "ias", DataType::Float)
                .with_stale_after(Duration::from_millis(20)),
        )
        .unwrap();
        t.deliver_remote(&update(315, ParameterValue::Float(95.0))).unwrap();

        let fresh = t.get_latest(315).unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.node_id, 3);

        std::thread::sleep(Duration::from_millis(40));
        assert!(t.get_latest(315).unwrap().stale);
    }

    #[test]
    fn test_publish_local_queues_update() {
        let t = table();
        t.publish_local(1034, ParameterValue::UShort(1013)).unwrap();

        let queued = t.next_local().unwrap();
        assert!(queued.local);
        assert_eq!(queued.node_id, 7);
        assert_eq!(t.get_latest(1034).unwrap().value, ParameterValue::UShort(1013));
        assert!(t.publish_wake.is_set());
    }

    #[test]
    fn test_local_queue_full() {
        let t = ParameterTable::new(
            7,
            1,
            Arc::new(Event::auto()),
            Arc::new(Event::auto()),
            Arc::new(NodeStats::new()),
        );
        t.publish_local(1, ParameterValue::UChar(1)).unwrap();
        assert!(matches!(
            t.publish_local(1, ParameterValue::UChar(2)),
            Err(NodeError::QueueFull("local"))
        ));

        // The rejected value is neither stored nor transmitted
        assert_eq!(t.get_latest(1).unwrap().value, ParameterValue::UChar(1));
        let mut out = Vec::new();
        t.collect_due(Instant::now(), &mut out);
        let sent: Vec<ParameterValue> = out.iter().map(|m| m.value).collect();
        assert_eq!(sent, vec![ParameterValue::UChar(1)]);

        // Once drained, publishing works again
        assert_eq!(t.next_local().unwrap().value, ParameterValue::UChar(1));
        assert!(t.next_local().is_none());
        t.publish_local(1, ParameterValue::UChar(3)).unwrap();
        assert_eq!(t.get_latest(1).unwrap().value, ParameterValue::UChar(3));
    }

    #[test]
    fn test_older_update_is_not_stored_or_delivered() {
        let t = table();
        let log = Arc::new(Mutex::new(Vec::new()));
        t.register(500, "gauge", recorder(&log, "g"));

        // Received before the local publish, dispatched after it
        let early = update(500, ParameterValue::Short(2));
        t.publish_local(500, ParameterValue::Short(1)).unwrap();
        let local = t.next_local().unwrap();
        assert!(local.sequence > early.sequence);

        t.deliver_local(&local);
        assert_eq!(t.deliver_remote(&early).unwrap(), Delivery::default());
        assert_eq!(*log.lock(), vec!["g:1"]);
        assert_eq!(t.get_latest(500).unwrap().value, ParameterValue::Short(1));

        // A later update goes through
        t.deliver_remote(&update(500, ParameterValue::Short(3))).unwrap();
        assert_eq!(*log.lock(), vec!["g:1", "g:3"]);
        assert_eq!(t.get_latest(500).unwrap().value, ParameterValue::Short(3));
    }

    #[test]
    fn test_concurrent_local_publishes_arrive_in_order() {
        let t = Arc::new(ParameterTable::new(
            7,
            1024,
            Arc::new(Event::auto()),
            Arc::new(Event::auto()),
            Arc::new(NodeStats::new()),
        ));
        let threads: Vec<_> = (0..4)
            .map(|n| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        t.publish_local(600, ParameterValue::ULong(n * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut last = 0;
        let mut final_value = None;
        while let Some(update) = t.next_local() {
            assert!(update.sequence > last);
            last = update.sequence;
            final_value = Some(update.value);
        }
        assert_eq!(t.get_latest(600).map(|s| s.value), final_value);
    }

    #[test]
    fn test_on_change_is_collected_once() {
        let t = table();
        t.publish_local(1034, ParameterValue::UShort(1013)).unwrap();

        let mut out = Vec::new();
        assert_eq!(t.collect_due(Instant::now(), &mut out), None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].node_id, 7);
        assert_eq!(out[0].message_code, 0);

        out.clear();
        t.collect_due(Instant::now(), &mut out);
        assert!(out.is_empty());

        t.publish_local(1034, ParameterValue::UShort(1012)).unwrap();
        t.collect_due(Instant::now(), &mut out);
        assert_eq!(out[0].message_code, 1);
    }

    #[test]
    fn test_periodic_schedule() {
        let t = table();
        let interval = Duration::from_millis(1000);
        t.own(1034, PublishPolicy::periodic(interval)).unwrap();
        t.publish_local(1034, ParameterValue::UShort(1013)).unwrap();

        let start = Instant::now();
        let mut out = Vec::new();
        let next = t.collect_due(start, &mut out).unwrap();
        assert!(out.is_empty());
        assert!(next > start);

        t.collect_due(next, &mut out);
        assert_eq!(out.len(), 1);
        let after = t.collect_due(next, &mut out).unwrap();
        assert_eq!(after, next + interval);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let t = table();
        assert!(matches!(
            t.own(1034, PublishPolicy::periodic(Duration::ZERO)),
            Err(NodeError::Config(_))
        ));

        // Nothing is owned, so a publish falls back to on-change
        t.publish_local(1034, ParameterValue::UShort(1013)).unwrap();
        let mut out = Vec::new();
        assert_eq!(t.collect_due(Instant::now(), &mut out), None);
        assert_eq!(out.len(), 1);
        assert!(t.collect_due(Instant::now(), &mut out).is_none());
        assert_eq!(out.len(), 1);
    }
}
