//! The bus client and its network thread.
//!
//! `BusClient` is the only I/O boundary between a service and the broker. It
//! owns the rumqttc session: one dedicated network thread drives the event
//! connection, tracks the link state, classifies failures, applies
//! exponential backoff between reconnect attempts and replays the recorded
//! subscription set after every re-established session.
//!
//! Inbound messages are handed to a single sink installed once at startup.
//! The sink runs on the network thread and must not block; services install a
//! closure that parses and enqueues into their command queue.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use rumqttc::{Client, ConnectReturnCode, Connection, Event, Packet, QoS, RecvTimeoutError};
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff,
    client::{status_topic, ClientBuilder},
    config::BusConfig,
    error::{BusError, FailureKind},
    state::LinkState,
};

/// How long `connect()` waits for the session to establish.
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// Default ceiling on waiting for a publish acknowledgment.
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll granularity of the network thread; bounds shutdown latency.
const NET_POLL: Duration = Duration::from_millis(500);

/// Handler invoked for every inbound message matching a subscription.
pub type InboundSink = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Publish acknowledgment bookkeeping.
///
/// Every QoS 1 publish takes a ticket (`issued`); the network thread bumps
/// `acked` for each PUBACK. A publisher holding ticket N is acknowledged
/// once `acked` reaches N: the broker acks every issued publish exactly
/// once, and the session retransmits unacked messages across reconnects, so
/// counting is enough without per-packet correlation.
#[derive(Default)]
struct AckLedger {
    issued: u64,
    acked: u64,
}

/// State shared between client handles and the network thread.
struct LinkShared {
    state: Mutex<LinkState>,
    state_cv: Condvar,
    last_failure: Mutex<Option<(FailureKind, String)>>,
    subscriptions: Mutex<BTreeSet<String>>,
    acks: Mutex<AckLedger>,
    ack_cv: Condvar,
    running: AtomicBool,
}

impl LinkShared {
    fn set_state(&self, next: LinkState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!("bus link: {} -> {}", *state, next);
            *state = next;
        }
        self.state_cv.notify_all();
    }
}

/// A service's connection to the message bus.
pub struct BusClient {
    client: Client,
    client_id: String,
    status_topic: String,
    shared: Arc<LinkShared>,
    sink: Arc<OnceLock<InboundSink>>,
    connection: Mutex<Option<Connection>>,
    net_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BusClient {
    /// Creates a client from a validated config. The last will is installed
    /// here, before any connect, and never changes afterwards.
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        let endpoint = config.check()?;
        let (builder, client_id) = ClientBuilder::from_config(&config, &endpoint)?;
        let (client, connection) = builder.build();

        Ok(BusClient {
            client,
            status_topic: status_topic(&client_id),
            client_id,
            shared: Arc::new(LinkShared {
                state: Mutex::new(LinkState::Disconnected),
                state_cv: Condvar::new(),
                last_failure: Mutex::new(None),
                subscriptions: Mutex::new(BTreeSet::new()),
                acks: Mutex::new(AckLedger::default()),
                ack_cv: Condvar::new(),
                running: AtomicBool::new(true),
            }),
            sink: Arc::new(OnceLock::new()),
            connection: Mutex::new(Some(connection)),
            net_thread: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Topic carrying this service's heartbeat and last will.
    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    pub fn state(&self) -> LinkState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs the single inbound message handler. Must be called before
    /// `connect()`; a second installation is an error.
    pub fn set_inbound_sink(&self, sink: InboundSink) -> Result<(), BusError> {
        self.sink
            .set(sink)
            .map_err(|_| BusError::Config("inbound sink already installed".into()))
    }

    /// Starts the network thread and blocks until the session is established,
    /// up to 5 s. Credential rejection and trust failures abort the wait
    /// early; transient transport errors keep retrying until the deadline.
    ///
    /// After a successful connect, reconnection is automatic for the lifetime
    /// of the client.
    pub fn connect(&self) -> Result<(), BusError> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(connection) = connection else {
            // Already connected once; the network thread owns reconnection.
            return if self.state().is_connected() {
                Ok(())
            } else {
                Err(BusError::Transport("connect() already in progress".into()))
            };
        };

        self.shared.set_state(LinkState::Connecting);

        let handle = {
            let client = self.client.clone();
            let shared = Arc::clone(&self.shared);
            let sink = Arc::clone(&self.sink);
            thread::Builder::new()
                .name("bus-net".into())
                .spawn(move || network_loop(connection, client, shared, sink))
                .map_err(|e| BusError::Transport(format!("cannot spawn network thread: {e}")))?
        };
        *self
            .net_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.wait_for_session()
    }

    fn wait_for_session(&self) -> Result<(), BusError> {
        let deadline = Instant::now() + CONNECT_DEADLINE;
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        loop {
            if state.is_connected() {
                return Ok(());
            }

            // Auth and TLS rejections are not transient; fail fast instead of
            // burning the rest of the deadline.
            if let Some((kind, detail)) = self
                .shared
                .last_failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
            {
                if matches!(kind, FailureKind::Auth | FailureKind::Tls) {
                    return Err(kind.into_error(detail));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let failure = self
                    .shared
                    .last_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                return Err(match failure {
                    Some((kind, detail)) => kind.into_error(detail),
                    None => BusError::Transport(
                        "timed out waiting for broker session".into(),
                    ),
                });
            }

            let (guard, _timeout) = self
                .shared
                .state_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Subscribes at QoS 1. Idempotent; the topic is recorded so the network
    /// thread can replay it after a reconnect.
    pub fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        {
            let mut subs = self
                .shared
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !subs.insert(topic.to_string()) {
                return Ok(());
            }
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| BusError::Subscribe(format!("{topic}: {e}")))?;
        info!("subscribed to {topic}");
        Ok(())
    }

    /// Publishes a JSON payload at QoS 1, not retained, and blocks until the
    /// broker acknowledges it or the default 10 s ceiling expires. Fails
    /// with `Publish` on timeout or session loss.
    pub fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<(), BusError> {
        self.publish_with_deadline(topic, payload, PUBLISH_ACK_TIMEOUT)
    }

    /// Publishes at QoS 1 and waits up to `deadline` for the broker's
    /// acknowledgment. Redelivery across reconnects stays with the session;
    /// this only decides how long the caller is willing to block before
    /// abandoning the wait with a `Publish` error.
    pub fn publish_with_deadline(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        deadline: Duration,
    ) -> Result<(), BusError> {
        // With no session there is nothing that could ever acknowledge;
        // fail fast instead of sleeping out the deadline.
        if matches!(self.state(), LinkState::Disconnected) {
            return Err(BusError::Publish(format!("{topic}: no active session")));
        }

        let bytes = serde_json::to_vec(payload)?;
        let ticket = {
            let mut ledger = self
                .shared
                .acks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            ledger.issued += 1;
            ledger.issued
        };

        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .map_err(|e| BusError::Publish(format!("{topic}: {e}")))?;

        let expiry = Instant::now() + deadline;
        let mut ledger = self
            .shared
            .acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while ledger.acked < ticket {
            if !self.shared.running.load(Ordering::Relaxed) {
                return Err(BusError::Publish(format!(
                    "{topic}: client shut down before acknowledgment"
                )));
            }
            let now = Instant::now();
            if now >= expiry {
                return Err(BusError::Publish(format!(
                    "{topic}: no acknowledgment within {}s",
                    deadline.as_secs()
                )));
            }
            let wait = (expiry - now).min(NET_POLL);
            let (guard, _timeout) = self
                .shared
                .ack_cv
                .wait_timeout(ledger, wait)
                .unwrap_or_else(PoisonError::into_inner);
            ledger = guard;
        }
        Ok(())
    }

    /// Terminates the session and joins the network thread. A clean
    /// disconnect does not fire the last will. Idempotent.
    pub fn disconnect(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        // Wake publishers blocked on acknowledgment so they abandon promptly.
        self.shared.ack_cv.notify_all();
        if let Err(e) = self.client.disconnect() {
            debug!("disconnect request not delivered: {e}");
        }
        let handle = self
            .net_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("bus network thread panicked");
            }
        }
        self.shared.set_state(LinkState::Disconnected);
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Drives the rumqttc event connection until shutdown.
fn network_loop(
    mut connection: Connection,
    client: Client,
    shared: Arc<LinkShared>,
    sink: Arc<OnceLock<InboundSink>>,
) {
    let mut backoff = Backoff::default();

    while shared.running.load(Ordering::Relaxed) {
        match connection.recv_timeout(NET_POLL) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("bus session established");
                    backoff.reset();
                    shared.set_state(LinkState::Connected);
                    replay_subscriptions(&client, &shared);
                } else {
                    warn!("broker refused session: {:?}", ack.code);
                }
            }
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                trace!(
                    "inbound message on {} ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                match sink.get() {
                    Some(handler) => handler(&publish.topic, &publish.payload),
                    None => error!("no inbound sink installed; dropping message on {}", publish.topic),
                }
            }
            Ok(Ok(Event::Incoming(Packet::PubAck(ack)))) => {
                trace!("publish acknowledged (pkid {})", ack.pkid);
                let mut ledger = shared
                    .acks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                ledger.acked += 1;
                drop(ledger);
                shared.ack_cv.notify_all();
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                let kind = FailureKind::classify(&err);
                let detail = err.to_string();
                warn!("bus session lost: {detail}");
                *shared
                    .last_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some((kind, detail.clone()));
                shared.set_state(LinkState::Lost(detail));

                if !shared.running.load(Ordering::Relaxed) {
                    break;
                }
                let delay = backoff.next_sleep();
                debug!(
                    "reconnect attempt {} in {:.1}s",
                    backoff.attempt(),
                    delay.as_secs_f64()
                );
                interruptible_sleep(delay, &shared.running);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    shared.set_state(LinkState::Disconnected);
    debug!("bus network thread exiting");
}

/// Sleeps in short slices so a shutdown request interrupts a long backoff
/// delay within one poll interval.
fn interruptible_sleep(total: Duration, running: &AtomicBool) {
    let mut remaining = total;
    while remaining > Duration::ZERO && running.load(Ordering::Relaxed) {
        let slice = remaining.min(Duration::from_millis(100));
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

/// Re-issues every recorded subscription on a fresh session.
fn replay_subscriptions(client: &Client, shared: &LinkShared) {
    let subs = shared
        .subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for topic in subs {
        match client.subscribe(&topic, QoS::AtLeastOnce) {
            Ok(()) => debug!("replayed subscription to {topic}"),
            Err(e) => error!("failed to replay subscription to {topic}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(id: &str) -> BusClient {
        BusClient::new(BusConfig::new("tcp://localhost:1883", id)).unwrap()
    }

    #[test]
    fn new_client_starts_disconnected() {
        let bus = test_client("test_client");
        assert_eq!(bus.state(), LinkState::Disconnected);
        assert_eq!(bus.status_topic(), "home/services/test_client/status");
    }

    #[test]
    fn empty_client_id_falls_back_to_uuid() {
        let bus = BusClient::new(BusConfig::new("tcp://localhost:1883", "")).unwrap();
        assert!(!bus.client_id().is_empty());
        assert!(bus.status_topic().starts_with("home/services/"));
        assert!(bus.status_topic().ends_with("/status"));
    }

    #[test]
    fn sink_can_only_be_installed_once() {
        let bus = test_client("sink_once");
        assert!(bus.set_inbound_sink(Box::new(|_, _| {})).is_ok());
        let err = bus.set_inbound_sink(Box::new(|_, _| {})).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn subscribe_is_idempotent_before_connect() {
        let bus = test_client("sub_idem");
        // First subscribe records the topic and enqueues the request; the
        // second is a recorded no-op.
        let first = bus.subscribe("home/services/sub_idem/command");
        let second = bus.subscribe("home/services/sub_idem/command");
        assert!(first.is_ok());
        assert!(second.is_ok());
        let subs = bus.shared.subscriptions.lock().unwrap();
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn connect_times_out_against_dead_endpoint() {
        // Port 1 on localhost refuses immediately; the 5 s deadline expires
        // with a transport classification.
        let bus = BusClient::new(BusConfig::new("tcp://127.0.0.1:1", "timeout_client")).unwrap();
        let started = Instant::now();
        let err = bus.connect().unwrap_err();
        assert!(matches!(err, BusError::Transport(_)));
        assert!(started.elapsed() >= CONNECT_DEADLINE);
        bus.disconnect();
    }

    #[test]
    fn publish_without_session_fails_fast() {
        let bus = test_client("pub_nosess");
        let started = Instant::now();
        let err = bus
            .publish(
                "home/services/pub_nosess/status",
                &serde_json::json!({ "status": "online" }),
            )
            .unwrap_err();
        assert!(matches!(err, BusError::Publish(_)));
        // No session means no acknowledgment wait at all.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let bus = test_client("disc_idem");
        bus.disconnect();
        bus.disconnect();
        assert_eq!(bus.state(), LinkState::Disconnected);
    }
}
