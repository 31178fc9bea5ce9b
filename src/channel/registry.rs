//! Subscription bookkeeping for the channel client.
//!
//! [`Registry`] is the synchronous heart of the client: it owns the
//! subscriptions, one-shot requests, the set of channels actually subscribed
//! on the wire and the queue of messages waiting for the socket to open.
//! It performs no I/O. Frames to write accumulate in an outbox drained by
//! the socket task; callbacks to run come back as [`Delivery`] values.

use std::collections::{HashSet, VecDeque};

use super::protocol::{parse_frame, Command, InboundMessage, RequestParams};
use super::{ChannelError, ConnectionState, ErrorListener, Listener};

#[derive(Debug, Clone)]
struct Subscription {
    params: RequestParams,
    key: String,
    listener: Listener,
    on_error: Option<ErrorListener>,
    quiet: bool,
}

#[derive(Debug)]
struct PendingRequest {
    params: RequestParams,
    key: String,
    listener: Listener,
    on_error: Option<ErrorListener>,
}

/// A callback invocation produced by the registry, run outside its lock.
#[derive(Debug)]
pub enum Delivery {
    /// Deliver a message to a listener.
    Message(Listener, InboundMessage),
    /// Report a transport error to an error listener.
    Error(ErrorListener, ChannelError),
}

impl Delivery {
    /// Invoke the callback.
    pub fn run(self) {
        match self {
            Self::Message(listener, msg) => listener.call(&msg),
            Self::Error(listener, err) => listener.call(&err),
        }
    }
}

/// Subscription and send-queue state of one channel client.
#[derive(Debug, Default)]
pub struct Registry {
    state: ConnectionState,
    /// Bumped whenever a new connection generation starts or the caller
    /// closes; lets the socket task detect that it has been superseded.
    generation: u64,
    subscriptions: Vec<Subscription>,
    requests: Vec<PendingRequest>,
    subscribed: HashSet<String>,
    messages_on_open: Vec<String>,
    outbox: VecDeque<String>,
}

impl Registry {
    /// Create an empty, disconnected registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current connection generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a raw protocol line.
    ///
    /// While open the line goes to the outbox. Otherwise it waits in the
    /// messages-on-open queue until the next socket opens; only a
    /// caller-side close discards that queue. A line identical to one
    /// already waiting is not queued twice.
    pub fn send(&mut self, message: String) {
        if self.messages_on_open.contains(&message) {
            return;
        }
        match self.state {
            ConnectionState::Open => self.outbox.push_back(message),
            ConnectionState::Connecting
            | ConnectionState::Closing
            | ConnectionState::Disconnected => self.messages_on_open.push(message),
        }
    }

    /// Take every frame ready to be written.
    pub fn take_outbox(&mut self) -> Vec<String> {
        self.outbox.drain(..).collect()
    }

    /// Start a new connection generation.
    ///
    /// The subscribed set is cleared so subscriptions are re-issued on open.
    /// Lines queued while no socket was open are kept for the new one.
    /// Requests whose `GET` already went out on the previous socket can no
    /// longer be answered: they are dropped and their error callbacks are
    /// returned. Requests still queued go out with the new connection.
    pub fn begin_connect(&mut self) -> Vec<Delivery> {
        let was_open = self.state == ConnectionState::Open;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.subscribed.clear();
        self.outbox.clear();

        if !was_open || self.requests.is_empty() {
            return Vec::new();
        }
        log::debug!(
            "[Channel] Dropping {} unanswered request(s) from previous connection",
            self.requests.len()
        );
        let err = ChannelError::Closed;
        self.requests
            .drain(..)
            .filter_map(|req| req.on_error.map(|cb| Delivery::Error(cb, err.clone())))
            .collect()
    }

    /// Socket opened: write `greeting` (the connection's control state),
    /// then flush the messages-on-open queue behind it.
    pub fn mark_open(&mut self, greeting: Vec<String>) {
        self.state = ConnectionState::Open;
        let queued = std::mem::take(&mut self.messages_on_open);
        for line in greeting.into_iter().chain(queued) {
            if !self.outbox.contains(&line) {
                self.outbox.push_back(line);
            }
        }
    }

    /// Caller-initiated close. No callbacks fire.
    pub fn mark_closed(&mut self) {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.subscribed.clear();
        self.messages_on_open.clear();
        self.outbox.clear();
        self.requests.clear();
    }

    /// The socket failed or the server closed it.
    ///
    /// Every pending request is dropped after its error callback fires;
    /// every subscription's error callback fires once. Subscriptions stay
    /// registered for replay.
    pub fn connection_lost(&mut self, err: &ChannelError) -> Vec<Delivery> {
        self.state = ConnectionState::Disconnected;
        self.subscribed.clear();
        self.messages_on_open.clear();
        self.outbox.clear();

        let mut deliveries: Vec<Delivery> = self
            .requests
            .drain(..)
            .filter_map(|req| req.on_error.map(|cb| Delivery::Error(cb, err.clone())))
            .collect();
        deliveries.extend(
            self.subscriptions
                .iter()
                .filter_map(|sub| sub.on_error.clone())
                .map(|cb| Delivery::Error(cb, err.clone())),
        );
        deliveries
    }

    /// Issue a one-shot `GET`.
    ///
    /// A previous pending request with the same channel key and listener is
    /// replaced.
    pub fn get(
        &mut self,
        params: RequestParams,
        listener: Listener,
        on_error: Option<ErrorListener>,
    ) {
        let key = params.channel_key();
        self.requests
            .retain(|req| !(req.key == key && req.listener.same(&listener)));
        self.send(Command::Get(&params).to_string());
        self.requests.push(PendingRequest {
            params,
            key,
            listener,
            on_error,
        });
    }

    /// Register a listener for a channel.
    ///
    /// The (channel key, listener) pair is stored at most once. Unless
    /// `quiet`, a channel not yet subscribed on the wire gets `GET` then
    /// `SUB`. With no socket at all nothing is queued: every subscription is
    /// replayed once the next connection opens.
    pub fn subscribe(
        &mut self,
        params: RequestParams,
        listener: Listener,
        on_error: Option<ErrorListener>,
        quiet: bool,
    ) {
        let key = params.channel_key();
        self.subscriptions
            .retain(|sub| !(sub.key == key && sub.listener.same(&listener)));

        let has_socket = self.state != ConnectionState::Disconnected;
        if !quiet && has_socket && !self.subscribed.contains(&key) {
            self.send(Command::Get(&params).to_string());
            self.send(Command::Sub(&params).to_string());
            self.subscribed.insert(key.clone());
        }

        self.subscriptions.push(Subscription {
            params,
            key,
            listener,
            on_error,
            quiet,
        });
    }

    /// Remove listeners of a channel.
    ///
    /// With `listener` only that exact listener is removed, otherwise all
    /// of them. `DEL` is sent once the channel has no listener left and at
    /// least one removed listener was not quiet. A channel never subscribed
    /// on the wire is dropped silently.
    pub fn unsubscribe(&mut self, key: &str, listener: Option<&Listener>) {
        let mut removed_loud = false;
        let mut removed_any = false;
        self.subscriptions.retain(|sub| {
            let hit = sub.key == key && listener.map_or(true, |l| sub.listener.same(l));
            if hit {
                removed_any = true;
                removed_loud |= !sub.quiet;
            }
            !hit
        });

        if !removed_any {
            return;
        }

        let still_listening = self.subscriptions.iter().any(|sub| sub.key == key);
        // Only channels subscribed on the current connection need a `DEL`.
        if !still_listening && removed_loud && self.subscribed.remove(key) {
            self.send(Command::Del(key).to_string());
        }
    }

    /// Re-register every current subscription, preserving `quiet`.
    ///
    /// Runs after open; channels not yet subscribed on this connection get
    /// their `GET`/`SUB` again.
    pub fn resubscribe_all(&mut self) {
        let snapshot = self.subscriptions.clone();
        for sub in snapshot {
            self.subscribe(sub.params, sub.listener, sub.on_error, sub.quiet);
        }
    }

    /// Route one inbound text frame.
    ///
    /// Malformed frames are logged and dropped. A pending request is
    /// answered at most once and removed as soon as it matches.
    pub fn dispatch(&mut self, text: &str) -> Vec<Delivery> {
        let messages = match parse_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("[Channel] {} ({})", e, truncate(text, 100));
                return Vec::new();
            }
        };

        let mut deliveries = Vec::new();
        for msg in messages {
            for sub in &self.subscriptions {
                if msg.matches(&sub.key, sub.params.id.as_deref()) {
                    deliveries.push(Delivery::Message(sub.listener.clone(), msg.clone()));
                }
            }

            let mut i = 0;
            while i < self.requests.len() {
                let req = &self.requests[i];
                if msg.matches(&req.key, req.params.id.as_deref()) {
                    let req = self.requests.remove(i);
                    deliveries.push(Delivery::Message(req.listener, msg.clone()));
                } else {
                    i += 1;
                }
            }
        }
        deliveries
    }

    /// Number of listeners registered for a channel key.
    #[must_use]
    pub fn listener_count(&self, key: &str) -> usize {
        self.subscriptions.iter().filter(|sub| sub.key == key).count()
    }

    /// Number of one-shot requests waiting for an answer.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Whether `GET`/`SUB` went out for this key on the current connection.
    #[must_use]
    pub fn is_subscribed(&self, key: &str) -> bool {
        self.subscribed.contains(key)
    }
}

/// Prefix of `text` at most `max` bytes long, cut on a char boundary.
fn truncate(text: &str, max: usize) -> &str {
    let mut idx = max.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    &text[..idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_listener() -> (Listener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener = Listener::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (listener, count)
    }

    fn open_registry() -> Registry {
        let mut registry = Registry::new();
        registry.begin_connect();
        registry.mark_open(Vec::new());
        registry
    }

    fn frame(source: &str, reference: serde_json::Value) -> String {
        json!({
            "source": source,
            "timestamp": 0,
            "client_reference": reference,
            "content": {}
        })
        .to_string()
    }

    fn run_all(deliveries: Vec<Delivery>) {
        for d in deliveries {
            d.run();
        }
    }

    #[test]
    fn test_subscribe_twice_is_idempotent() {
        let mut registry = open_registry();
        let (listener, _) = counting_listener();
        let params = RequestParams::new("trajectory");

        registry.subscribe(params.clone(), listener.clone(), None, false);
        registry.subscribe(params, listener, None, false);

        assert_eq!(registry.listener_count("trajectory"), 1);
        assert_eq!(registry.take_outbox(), ["GET trajectory", "SUB trajectory"]);
    }

    #[test]
    fn test_second_listener_shares_wire_subscription() {
        let mut registry = open_registry();
        let (a, _) = counting_listener();
        let (b, _) = counting_listener();
        let params = RequestParams::new("trajectory");

        registry.subscribe(params.clone(), a, None, false);
        registry.subscribe(params, b, None, false);

        assert_eq!(registry.listener_count("trajectory"), 2);
        assert_eq!(registry.take_outbox().len(), 2);
    }

    #[test]
    fn test_quiet_subscribe_sends_nothing() {
        let mut registry = open_registry();
        let (listener, _) = counting_listener();
        registry.subscribe(RequestParams::new("trajectory"), listener, None, true);

        assert!(registry.take_outbox().is_empty());
        assert!(!registry.is_subscribed("trajectory"));
    }

    #[test]
    fn test_unsubscribe_quiet_never_sends_del() {
        let mut registry = open_registry();
        let (listener, _) = counting_listener();
        registry.subscribe(RequestParams::new("trajectory"), listener.clone(), None, true);
        registry.unsubscribe("trajectory", Some(&listener));

        assert!(registry.take_outbox().is_empty());
        assert_eq!(registry.listener_count("trajectory"), 0);
    }

    #[test]
    fn test_unsubscribe_last_loud_listener_sends_one_del() {
        let mut registry = open_registry();
        let (a, _) = counting_listener();
        let (b, _) = counting_listener();
        registry.subscribe(RequestParams::new("trajectory"), a.clone(), None, false);
        registry.subscribe(RequestParams::new("trajectory"), b.clone(), None, true);
        registry.take_outbox();

        registry.unsubscribe("trajectory", Some(&a));
        assert!(registry.take_outbox().is_empty(), "quiet listener still attached");

        registry.unsubscribe("trajectory", Some(&b));
        assert!(registry.take_outbox().is_empty(), "remaining listener was quiet");

        registry.subscribe(RequestParams::new("trajectory"), a.clone(), None, false);
        registry.take_outbox();
        registry.unsubscribe("trajectory", None);
        registry.unsubscribe("trajectory", None);
        assert_eq!(registry.take_outbox(), ["DEL trajectory"]);
        assert!(!registry.is_subscribed("trajectory"));
    }

    #[test]
    fn test_unsubscribe_unknown_channel_is_noop() {
        let mut registry = open_registry();
        registry.unsubscribe("nothing", None);
        assert!(registry.take_outbox().is_empty());
    }

    #[test]
    fn test_get_fires_at_most_once() {
        let mut registry = open_registry();
        let (listener, count) = counting_listener();
        registry.get(RequestParams::new("station").with_args("8503000"), listener, None);
        assert_eq!(registry.take_outbox(), ["GET station 8503000"]);

        run_all(registry.dispatch(&frame("station 8503000", serde_json::Value::Null)));
        run_all(registry.dispatch(&frame("station 8503000", serde_json::Value::Null)));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_requests(), 0);
    }

    #[test]
    fn test_get_same_listener_replaces_previous() {
        let mut registry = open_registry();
        let (listener, count) = counting_listener();
        let params = RequestParams::new("stopsequence_sbb_1");
        registry.get(params.clone(), listener.clone(), None);
        registry.get(params, listener, None);
        assert_eq!(registry.pending_requests(), 1);

        run_all(registry.dispatch(&frame("stopsequence_sbb_1", serde_json::Value::Null)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_gets_on_distinct_channels() {
        let mut registry = open_registry();
        let (a, count_a) = counting_listener();
        let (b, count_b) = counting_listener();
        registry.get(RequestParams::new("station").with_args("1"), a, None);
        registry.get(RequestParams::new("station").with_args("2"), b, None);

        run_all(registry.dispatch(&frame("station 2", serde_json::Value::Null)));
        assert_eq!(count_a.load(Ordering::SeqCst), 0);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_requests(), 1);
    }

    #[test]
    fn test_dispatch_respects_client_reference() {
        let mut registry = open_registry();
        let (listener, count) = counting_listener();
        let params = RequestParams::new("full_trajectory_sbb_1").with_id("5");
        registry.subscribe(params, listener, None, false);
        assert_eq!(
            registry.take_outbox(),
            ["GET full_trajectory_sbb_1 5", "SUB full_trajectory_sbb_1 5"]
        );

        run_all(registry.dispatch(&frame("full_trajectory_sbb_1", json!(4))));
        run_all(registry.dispatch(&frame("full_trajectory_sbb_1", json!("5"))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_frame_reaches_inner_listener_only() {
        let mut registry = open_registry();
        let (trajectory, count_traj) = counting_listener();
        let (buffer, count_buffer) = counting_listener();
        registry.subscribe(RequestParams::new("trajectory"), trajectory, None, false);
        registry.subscribe(RequestParams::new("buffer"), buffer, None, false);

        let batched = json!({
            "source": "buffer",
            "timestamp": 0,
            "client_reference": null,
            "content": [
                {"source": "trajectory", "timestamp": 0, "client_reference": null, "content": {}},
                {"source": "trajectory", "timestamp": 1, "client_reference": null, "content": {}}
            ]
        })
        .to_string();
        run_all(registry.dispatch(&batched));

        assert_eq!(count_traj.load(Ordering::SeqCst), 2);
        assert_eq!(count_buffer.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut registry = open_registry();
        let (listener, count) = counting_listener();
        registry.subscribe(RequestParams::new("trajectory"), listener, None, false);
        assert!(registry.dispatch("{\"source\": \"trajectory\"").is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_messages_queue_until_open_without_duplicates() {
        let mut registry = Registry::new();
        registry.begin_connect();
        registry.send("GET station 1".to_string());
        registry.send("GET station 1".to_string());
        registry.send("PROJECTION EPSG:3857".to_string());
        assert!(registry.take_outbox().is_empty());

        registry.mark_open(vec![
            "PROJECTION EPSG:3857".to_string(),
            "BBOX 0 0 1 1".to_string(),
        ]);
        assert_eq!(
            registry.take_outbox(),
            ["PROJECTION EPSG:3857", "BBOX 0 0 1 1", "GET station 1"]
        );
    }

    #[test]
    fn test_send_while_disconnected_waits_for_next_open() {
        let mut registry = Registry::new();
        registry.send("PING".to_string());
        registry.send("PING".to_string());
        assert!(registry.take_outbox().is_empty());

        assert!(registry.begin_connect().is_empty());
        registry.mark_open(Vec::new());
        assert_eq!(registry.take_outbox(), ["PING"]);
    }

    #[test]
    fn test_get_in_reconnect_gap_goes_out_on_next_connection() {
        let mut registry = open_registry();
        run_all(registry.connection_lost(&ChannelError::Closed));

        let (listener, count) = counting_listener();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let on_error = ErrorListener::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        registry.get(
            RequestParams::new("station").with_args("1"),
            listener,
            Some(on_error),
        );

        run_all(registry.begin_connect());
        registry.mark_open(Vec::new());
        assert_eq!(registry.take_outbox(), ["GET station 1"]);
        assert_eq!(registry.pending_requests(), 1);

        run_all(registry.dispatch(&frame("station 1", serde_json::Value::Null)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_switching_connection_fails_requests_already_sent() {
        let mut registry = open_registry();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let on_error = ErrorListener::new(move |err| {
            assert_eq!(*err, ChannelError::Closed);
            e.fetch_add(1, Ordering::SeqCst);
        });
        let (listener, count) = counting_listener();
        registry.get(RequestParams::new("station"), listener, Some(on_error));
        assert_eq!(registry.take_outbox(), ["GET station"]);

        run_all(registry.begin_connect());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_requests(), 0);

        registry.mark_open(Vec::new());
        assert!(registry.take_outbox().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscribe_while_disconnected_replays_once_on_open() {
        let mut registry = Registry::new();
        let (listener, _) = counting_listener();
        registry.subscribe(RequestParams::new("trajectory"), listener, None, false);
        assert!(!registry.is_subscribed("trajectory"));

        registry.begin_connect();
        registry.mark_open(Vec::new());
        registry.resubscribe_all();
        assert_eq!(registry.take_outbox(), ["GET trajectory", "SUB trajectory"]);
    }

    #[test]
    fn test_reconnect_replays_loud_subscriptions_only() {
        let mut registry = open_registry();
        let (loud, _) = counting_listener();
        let (quiet, _) = counting_listener();
        registry.subscribe(RequestParams::new("trajectory"), loud, None, false);
        registry.subscribe(RequestParams::new("deleted_vehicles"), quiet, None, true);
        registry.take_outbox();

        let errors = registry.connection_lost(&ChannelError::Closed);
        assert!(errors.is_empty());

        registry.begin_connect();
        registry.mark_open(Vec::new());
        registry.resubscribe_all();

        assert_eq!(registry.take_outbox(), ["GET trajectory", "SUB trajectory"]);
        assert_eq!(registry.listener_count("trajectory"), 1);
        assert_eq!(registry.listener_count("deleted_vehicles"), 1);
    }

    #[test]
    fn test_connection_lost_reports_each_error_listener_once() {
        let mut registry = open_registry();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let on_error = ErrorListener::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        let (listener, _) = counting_listener();
        registry.subscribe(
            RequestParams::new("trajectory"),
            listener.clone(),
            Some(on_error.clone()),
            false,
        );
        registry.get(RequestParams::new("station"), listener, Some(on_error));

        run_all(registry.connection_lost(&ChannelError::Closed));
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(registry.pending_requests(), 0);
        assert_eq!(registry.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_close_clears_queue_and_bumps_generation() {
        let mut registry = Registry::new();
        registry.begin_connect();
        let generation = registry.generation();
        registry.send("RESET".to_string());
        registry.mark_closed();
        assert!(registry.generation() > generation);

        registry.begin_connect();
        registry.mark_open(Vec::new());
        assert!(registry.take_outbox().is_empty());
    }
}
