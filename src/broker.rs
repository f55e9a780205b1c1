//! Topic Registry, Replay Cache, and Dispatcher.
//!
//! Grounded on `original_source/python/aiomemq.py`'s module-level `topics`/
//! `topics_reverse`/`caches`/`indexs` dicts and their `handle_subscribe`/
//! `handle_unsubscribe`/`handle_send` functions, restructured into one
//! `Broker` struct guarded by a single `Mutex` the way the teacher bundles
//! all shared state into one `Arc<ServerState>` (`oxidb-server/src/
//! main.rs`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Mutex;

use rand::Rng;
use serde_json::{json, Value};

use crate::command::Delivery;
use crate::error::BrokerError;

/// Unique id for a connection, handed out once at accept time.
pub type ConnId = u64;

/// Capacity of each connection's outbound queue. A connection that can't
/// keep up with its queue drains is only punished on its own deliveries;
/// it never blocks dispatch to other subscribers.
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

fn next_conn_id() -> ConnId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
struct CachedMessage {
    topic: String,
    msg: String,
    delivery: Delivery,
    index: u64,
}

impl CachedMessage {
    fn to_value(&self) -> Value {
        json!({
            "command": "send",
            "topic": self.topic,
            "msg": self.msg,
            "delivery": self.delivery,
            "index": self.index,
        })
    }
}

#[derive(Default)]
struct Topic {
    subscribers: HashSet<ConnId>,
    next_index: u64,
    cache: VecDeque<CachedMessage>,
}

struct Connection {
    tx: SyncSender<Value>,
    subscribed_topics: HashSet<String>,
}

struct State {
    topics: HashMap<String, Topic>,
    connections: HashMap<ConnId, Connection>,
    cache_size: usize,
}

/// The shared broker engine. One instance is created at startup and
/// handed to every connection handler behind an `Arc`.
pub struct Broker {
    state: Mutex<State>,
}

impl Broker {
    pub fn new(cache_size: usize) -> Self {
        Broker {
            state: Mutex::new(State {
                topics: HashMap::new(),
                connections: HashMap::new(),
                cache_size,
            }),
        }
    }

    /// Register a new connection and return its id and outbound receiver.
    pub fn register(&self) -> (ConnId, std::sync::mpsc::Receiver<Value>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(OUTBOUND_QUEUE_CAPACITY);
        let id = next_conn_id();
        let mut state = self.state.lock().unwrap();
        state.connections.insert(
            id,
            Connection {
                tx,
                subscribed_topics: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Remove a connection's subscriptions from every topic it belonged to,
    /// then drop its handle entirely. Matches `handle_client`'s `finally`
    /// block in the source.
    pub fn cleanup(&self, conn: ConnId) {
        let mut state = self.state.lock().unwrap();
        if let Some(connection) = state.connections.remove(&conn) {
            for topic in connection.subscribed_topics {
                if let Some(t) = state.topics.get_mut(&topic) {
                    t.subscribers.remove(&conn);
                }
            }
        }
    }

    /// Enqueue a reply directly to one connection, bypassing topic
    /// dispatch. Used by the connection handler to report framing/
    /// validation errors, which never involve a topic.
    pub fn reply_direct(&self, conn: ConnId, value: Value) {
        let state = self.state.lock().unwrap();
        send_to(&state, conn, value);
    }

    /// `subscribe(conn, topic, last_seen, cache)`. Always succeeds once the
    /// connection is registered; idempotent on re-subscribe.
    pub fn subscribe(
        &self,
        conn: ConnId,
        topic: &str,
        last_seen: Option<i64>,
        cache_flag: Option<bool>,
    ) {
        let last_seen = last_seen.unwrap_or(-1);
        let replay = cache_flag.unwrap_or(true);

        let mut state = self.state.lock().unwrap();

        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .insert(conn);
        if let Some(connection) = state.connections.get_mut(&conn) {
            connection.subscribed_topics.insert(topic.to_string());
        }

        send_to(&state, conn, json!({"success": true}));

        if replay {
            let t = state.topics.get(topic).unwrap();
            let to_send: Vec<Value> = t
                .cache
                .iter()
                .filter(|e| e.index as i64 > last_seen)
                .map(CachedMessage::to_value)
                .collect();
            for msg in to_send {
                send_to(&state, conn, msg);
            }

            let cache_size = state.cache_size;
            let t = state.topics.get_mut(topic).unwrap();
            let rebuilt: VecDeque<CachedMessage> = t
                .cache
                .iter()
                .filter(|e| e.index as i64 <= last_seen || e.delivery == Delivery::All)
                .cloned()
                .collect();
            t.cache = rebuilt;
            while t.cache.len() > cache_size {
                t.cache.pop_front();
            }
        }
    }

    /// `unsubscribe(conn, topic)`. Returns an error if `conn` was not
    /// subscribed to `topic`, matching the source's `KeyError` on
    /// `set.remove` (see DESIGN.md Open Question resolution).
    pub fn unsubscribe(&self, conn: ConnId, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();

        let was_subscribed = state
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .contains(&conn);
        if !was_subscribed {
            return Err(BrokerError::Internal);
        }

        state.topics.get_mut(topic).unwrap().subscribers.remove(&conn);
        if let Some(connection) = state.connections.get_mut(&conn) {
            connection.subscribed_topics.remove(topic);
        }

        send_to(&state, conn, json!({"success": true}));
        Ok(())
    }

    /// `send(conn, topic, msg, delivery, cache)`. Always assigns an index
    /// and always acknowledges the publisher, regardless of recipient
    /// count.
    pub fn send(
        &self,
        conn: ConnId,
        topic: &str,
        msg: &str,
        delivery: Delivery,
        cache_flag: Option<bool>,
    ) {
        let mut state = self.state.lock().unwrap();

        let index = {
            let t = state.topics.entry(topic.to_string()).or_default();
            let index = t.next_index;
            t.next_index += 1;
            index
        };

        let cached = CachedMessage {
            topic: topic.to_string(),
            msg: msg.to_string(),
            delivery,
            index,
        };

        let recipients: Vec<ConnId> = match delivery {
            Delivery::All => state
                .topics
                .get(topic)
                .map(|t| t.subscribers.iter().copied().collect())
                .unwrap_or_default(),
            Delivery::One => {
                let subs = state
                    .topics
                    .get(topic)
                    .map(|t| t.subscribers.iter().copied().collect::<Vec<_>>())
                    .unwrap_or_default();
                if subs.is_empty() {
                    Vec::new()
                } else {
                    let pick = rand::rng().random_range(0..subs.len());
                    vec![subs[pick]]
                }
            }
        };

        // `delivery="one"` never caches, regardless of the `cache` flag or
        // recipient count — matches the source's unconditional override.
        if delivery == Delivery::All && cache_flag.unwrap_or(true) {
            let cache_size = state.cache_size;
            let t = state.topics.get_mut(topic).unwrap();
            t.cache.push_back(cached.clone());
            while t.cache.len() > cache_size {
                t.cache.pop_front();
            }
        }

        let payload = cached.to_value();
        for recipient in recipients {
            send_to(&state, recipient, payload.clone());
        }

        send_to(&state, conn, json!({"success": true}));
    }
}

/// Enqueue a message onto `conn`'s outbound channel. The publisher is
/// never made to wait on a slow or dead subscriber: a disconnected
/// connection drops the message silently, while a full queue (a
/// subscriber whose writer thread can't keep up) drops it with a log
/// line, since that's a distinct, diagnosable condition.
fn send_to(state: &State, conn: ConnId, value: Value) {
    use std::sync::mpsc::TrySendError;

    if let Some(connection) = state.connections.get(&conn) {
        if let Err(TrySendError::Full(_)) = connection.tx.try_send(value) {
            eprintln!("outbound queue full for connection {conn}, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &std::sync::mpsc::Receiver<Value>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(v) = rx.try_recv() {
            out.push(v);
        }
        out
    }

    #[test]
    fn simple_send_stamps_index_zero() {
        let broker = Broker::new(100);
        let (sub, sub_rx) = broker.register();
        let (pub_, pub_rx) = broker.register();

        broker.subscribe(sub, "t", None, None);
        assert_eq!(drain(&sub_rx), vec![json!({"success": true})]);

        broker.send(pub_, "t", "hello", Delivery::All, None);
        assert_eq!(drain(&pub_rx), vec![json!({"success": true})]);
        assert_eq!(
            drain(&sub_rx),
            vec![json!({"command":"send","topic":"t","msg":"hello","delivery":"all","index":0})]
        );
    }

    #[test]
    fn index_increments_regardless_of_subscribers() {
        let broker = Broker::new(100);
        let (pub_, pub_rx) = broker.register();
        broker.send(pub_, "nobody-listening", "a", Delivery::All, None);
        broker.send(pub_, "nobody-listening", "b", Delivery::All, None);
        drain(&pub_rx);
        let (sub, sub_rx) = broker.register();
        broker.subscribe(sub, "nobody-listening", None, None);
        let msgs = drain(&sub_rx);
        // success + both cached replays
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["index"], 0);
        assert_eq!(msgs[2]["index"], 1);
    }

    #[test]
    fn cache_eviction_keeps_only_most_recent() {
        let broker = Broker::new(2);
        let (pub_, pub_rx) = broker.register();
        for i in 0..5 {
            broker.send(pub_, "t", &format!("hello{i}"), Delivery::All, None);
        }
        drain(&pub_rx);

        let (sub, sub_rx) = broker.register();
        broker.subscribe(sub, "t", None, None);
        let msgs = drain(&sub_rx);
        assert_eq!(msgs[0], json!({"success": true}));
        assert_eq!(msgs[1]["index"], 3);
        assert_eq!(msgs[1]["msg"], "hello3");
        assert_eq!(msgs[2]["index"], 4);
        assert_eq!(msgs[2]["msg"], "hello4");
        assert_eq!(msgs.len(), 3);
    }

    #[test]
    fn delivery_one_never_caches() {
        let broker = Broker::new(2);
        let (pub_, pub_rx) = broker.register();
        for i in 0..4 {
            broker.send(pub_, "t", &format!("one{i}"), Delivery::One, None);
        }
        broker.send(pub_, "t", "hello4", Delivery::All, None);
        drain(&pub_rx);

        let (sub, sub_rx) = broker.register();
        broker.subscribe(sub, "t", None, None);
        let msgs = drain(&sub_rx);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1]["index"], 4);
        assert_eq!(msgs[1]["msg"], "hello4");

        let (sub2, sub2_rx) = broker.register();
        broker.subscribe(sub2, "t", None, None);
        let msgs2 = drain(&sub2_rx);
        assert_eq!(msgs2.len(), 2);
        assert_eq!(msgs2[1]["index"], 4);
    }

    #[test]
    fn last_seen_filters_replay() {
        let broker = Broker::new(10);
        let (pub_, pub_rx) = broker.register();
        for i in 0..5 {
            broker.send(pub_, "t", &format!("m{i}"), Delivery::All, None);
        }
        drain(&pub_rx);

        let (sub, sub_rx) = broker.register();
        broker.subscribe(sub, "t", Some(2), None);
        let msgs = drain(&sub_rx);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["index"], 3);
        assert_eq!(msgs[2]["index"], 4);

        let (sub2, sub2_rx) = broker.register();
        broker.subscribe(sub2, "t", Some(4), None);
        let msgs2 = drain(&sub2_rx);
        assert_eq!(msgs2, vec![json!({"success": true})]);
    }

    #[test]
    fn unsubscribe_without_subscribe_is_internal_error() {
        let broker = Broker::new(10);
        let (conn, _rx) = broker.register();
        assert_eq!(
            broker.unsubscribe(conn, "never-subscribed").unwrap_err(),
            BrokerError::Internal
        );
    }

    #[test]
    fn subscribe_unsubscribe_roundtrip() {
        let broker = Broker::new(10);
        let (conn, rx) = broker.register();
        broker.subscribe(conn, "t", None, None);
        broker.unsubscribe(conn, "t").unwrap();
        drain(&rx);

        // A send to "t" now reaches nobody, but still assigns index 0.
        let (pub_, pub_rx) = broker.register();
        broker.send(pub_, "t", "x", Delivery::All, None);
        drain(&pub_rx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cleanup_removes_from_subscriber_sets() {
        let broker = Broker::new(10);
        let (conn, _rx) = broker.register();
        broker.subscribe(conn, "t", None, None);
        broker.cleanup(conn);

        let (pub_, pub_rx) = broker.register();
        broker.send(pub_, "t", "x", Delivery::All, None);
        let acks = drain(&pub_rx);
        assert_eq!(acks, vec![json!({"success": true})]);
    }

    #[test]
    fn empty_topic_name_is_accepted() {
        let broker = Broker::new(10);
        let (conn, rx) = broker.register();
        broker.subscribe(conn, "", None, None);
        drain(&rx);
        let (pub_, pub_rx) = broker.register();
        broker.send(pub_, "", "hi", Delivery::All, None);
        drain(&pub_rx);
        let msgs = drain(&rx);
        assert_eq!(msgs[0]["topic"], "");
    }
}
