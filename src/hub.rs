// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! [`MessagingService`] is the public messaging hub facade: send-one-way, send-request-reply
//! (+ failure variant), the verb-handler registry, the peer version table, latency subscribers
//! and dropped-message accounting. It is constructed once by the server bootstrap and shared by
//! `Arc` -- there is no process-wide singleton access.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::sync::RwLock;

use crate::{
    callback_registry::{CallbackRegistry, TimeoutReporter},
    config::MessagingConfig,
    error::{BindError, MessagingError},
    inbound_connection::InboundConnection,
    listener::Listener,
    message::{CallbackInfo, MessageId, MessageIn, MessageOut, ResponseCallback},
    metrics::{DroppedMessageCounters, TimeoutCounters},
    outbound_connection::{OutboundConnection, PreferredIpResolver},
    shutdown::{Shutdown, ShutdownSignal},
    stage::StageDispatcher,
    verb::{Stage, Verb},
};

const LOG_TARGET: &str = "cluster_messaging::hub";

/// The protocol version this build speaks. `get_version` never returns anything higher.
pub const CURRENT_VERSION: u8 = 1;

/// Handles an inbound message on its mapped stage. Registered once per verb at startup.
#[async_trait]
pub trait VerbHandler: Send + Sync {
    async fn do_verb(&self, message: MessageIn, id: MessageId);
}

/// Bridges round-trip timing back to the (out-of-scope) cluster membership / failure-detector
/// layer, which is the messaging core's sole reason for tracking latency at all.
pub trait LatencySubscriber: Send + Sync {
    fn on_round_trip(&self, peer: SocketAddr, latency: Duration);
    fn on_timeout(&self, peer: SocketAddr);
}

/// Consulted by the listener before any bytes are read from an accepted socket.
#[async_trait]
pub trait InternodeAuthenticator: Send + Sync {
    async fn authenticate(&self, peer: SocketAddr) -> bool;
}

/// The default authenticator for tests and single-node setups: accepts everyone.
pub struct AllowAllAuthenticator;

#[async_trait]
impl InternodeAuthenticator for AllowAllAuthenticator {
    async fn authenticate(&self, _peer: SocketAddr) -> bool {
        true
    }
}

/// Read-only accessors for the management surface described in spec section 6. Cheap, point-in-
/// time snapshots; never a network endpoint in its own right.
pub struct MessagingStats {
    hub: Arc<MessagingServiceInner>,
}

impl MessagingStats {
    pub async fn pending_messages(&self, peer: SocketAddr) -> u64 {
        self.hub.outbound.read().await.get(&peer).map(|c| c.pending_messages()).unwrap_or(0)
    }

    pub async fn completed_messages(&self, peer: SocketAddr) -> u64 {
        self.hub.outbound.read().await.get(&peer).map(|c| c.completed_messages()).unwrap_or(0)
    }

    /// Timeouts attributed to this specific connection, as opposed to [`Self::total_timeouts`]
    /// which is the hub-wide count across every peer.
    pub async fn connection_timeouts(&self, peer: SocketAddr) -> u64 {
        self.hub.outbound.read().await.get(&peer).map(|c| c.timeouts()).unwrap_or(0)
    }

    pub async fn dropped_messages(&self, verb: Verb) -> u64 {
        self.hub.dropped_counters.get(verb).await
    }

    pub fn total_timeouts(&self) -> u64 {
        self.hub.timeout_counters.total()
    }

    pub async fn timeouts_per_host(&self) -> HashMap<SocketAddr, u64> {
        self.hub.timeout_counters.per_host().await
    }

    pub async fn known_version(&self, peer: SocketAddr) -> Option<u8> {
        self.hub.peer_versions.read().await.get(&peer).copied()
    }

    /// Number of callbacks currently resident in the registry, awaiting a reply or expiry.
    pub async fn pending_callbacks(&self) -> usize {
        self.hub.callback_registry.len().await
    }
}

struct MessagingServiceInner {
    config: MessagingConfig,
    /// This node's own reachable endpoint, advertised to peers in the connection preamble so
    /// replies are routed to it instead of an outbound connection's ephemeral source port.
    /// Initialized from `config.broadcast_address`/`config.storage_port` and corrected once the
    /// listener actually binds, since `storage_port` may be `0` (bind-to-any).
    advertised_addr: RwLock<SocketAddr>,
    verb_handlers: RwLock<HashMap<Verb, Arc<dyn VerbHandler>>>,
    outbound: Arc<RwLock<HashMap<SocketAddr, Arc<OutboundConnection>>>>,
    callback_registry: Arc<CallbackRegistry>,
    peer_versions: RwLock<HashMap<SocketAddr, u8>>,
    id_counter: AtomicU64,
    stage_dispatcher: Arc<StageDispatcher>,
    dropped_counters: Arc<DroppedMessageCounters>,
    timeout_counters: Arc<TimeoutCounters>,
    latency_subscribers: Arc<RwLock<Vec<Arc<dyn LatencySubscriber>>>>,
    preferred_ip: Option<PreferredIpResolver>,
    authenticator: Arc<dyn InternodeAuthenticator>,
    shutdown_signal: ShutdownSignal,
}

/// The messaging core's public facade. One instance per node, constructed once by the server
/// bootstrap and handed around as `Arc<MessagingService>`.
pub struct MessagingService {
    inner: Arc<MessagingServiceInner>,
    shutdown: Shutdown,
}

impl MessagingService {
    pub fn new(config: MessagingConfig, authenticator: Arc<dyn InternodeAuthenticator>) -> Arc<Self> {
        Self::with_preferred_ip(config, authenticator, None)
    }

    pub fn with_preferred_ip(
        config: MessagingConfig,
        authenticator: Arc<dyn InternodeAuthenticator>,
        preferred_ip: Option<PreferredIpResolver>,
    ) -> Arc<Self> {
        let shutdown = Shutdown::new();
        let shutdown_signal = shutdown.to_signal();

        let timeout_counters = Arc::new(TimeoutCounters::new());
        let dropped_counters = Arc::new(DroppedMessageCounters::new());
        let stage_dispatcher = StageDispatcher::new(shutdown_signal.clone());
        let latency_subscribers: Arc<RwLock<Vec<Arc<dyn LatencySubscriber>>>> = Arc::new(RwLock::new(Vec::new()));

        let outbound: Arc<RwLock<HashMap<SocketAddr, Arc<OutboundConnection>>>> = Arc::new(RwLock::new(HashMap::new()));

        let reporter_timeout_counters = timeout_counters.clone();
        let reporter_latency_subscribers = latency_subscribers.clone();
        let reporter_stage_dispatcher = stage_dispatcher.clone();
        let reporter: TimeoutReporter = {
            let reporter_outbound = outbound.clone();
            Arc::new(move |id, info: CallbackInfo, elapsed| {
                let timeout_counters = reporter_timeout_counters.clone();
                let latency_subscribers = reporter_latency_subscribers.clone();
                let stage_dispatcher = reporter_stage_dispatcher.clone();
                let outbound = reporter_outbound.clone();
                let target = info.target;
                let wants_failure = info.wants_failure;
                trace!(target: LOG_TARGET, "callback {} to {} timed out after {:?}", id, target, elapsed);
                tokio::spawn(async move {
                    for subscriber in latency_subscribers.read().await.iter() {
                        subscriber.on_timeout(target);
                    }
                    timeout_counters.increment(target).await;
                    if let Some(conn) = outbound.read().await.get(&target) {
                        conn.increment_timeout();
                    }
                    if wants_failure {
                        stage_dispatcher.submit(
                            Stage::InternalResponse,
                            Box::pin(async move {
                                info.notify_failure(target);
                            }),
                        );
                    }
                });
            })
        };
        let callback_registry = CallbackRegistry::new(reporter);
        tokio::spawn(callback_registry.clone().run_sweeper(shutdown_signal.clone()));
        tokio::spawn(crate::metrics::run_drop_logger(
            dropped_counters.clone(),
            config.drop_log_interval,
            shutdown_signal.clone(),
        ));

        let advertised_addr = RwLock::new(SocketAddr::new(config.broadcast_address, config.storage_port));

        let inner = Arc::new(MessagingServiceInner {
            config,
            advertised_addr,
            verb_handlers: RwLock::new(HashMap::new()),
            outbound,
            callback_registry,
            peer_versions: RwLock::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            stage_dispatcher,
            dropped_counters,
            timeout_counters,
            latency_subscribers,
            preferred_ip,
            authenticator,
            shutdown_signal,
        });

        Arc::new(Self { inner, shutdown })
    }

    pub fn stats(&self) -> MessagingStats {
        MessagingStats { hub: self.inner.clone() }
    }

    /// Installs a handler for `verb`. Fails if one is already registered -- duplicate
    /// registration is a programming error, caught at startup rather than routed around.
    pub async fn register_verb_handler(&self, verb: Verb, handler: Arc<dyn VerbHandler>) -> Result<(), MessagingError> {
        let mut guard = self.inner.verb_handlers.write().await;
        if guard.contains_key(&verb) {
            return Err(MessagingError::DuplicateVerbHandler(verb));
        }
        guard.insert(verb, handler);
        Ok(())
    }

    fn allocate_id(&self) -> MessageId {
        self.inner.id_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// The endpoint this node advertises to peers in its connection preamble.
    pub async fn advertised_addr(&self) -> SocketAddr {
        *self.inner.advertised_addr.read().await
    }

    /// Corrects the advertised port once the listener has actually bound, for the case where
    /// `config.storage_port` was `0` and the OS assigned the real port.
    pub(crate) async fn set_advertised_port(&self, port: u16) {
        let mut guard = self.inner.advertised_addr.write().await;
        *guard = SocketAddr::new(guard.ip(), port);
    }

    async fn connection_for(&self, endpoint: SocketAddr) -> Arc<OutboundConnection> {
        if let Some(existing) = self.inner.outbound.read().await.get(&endpoint) {
            return existing.clone();
        }
        let mut guard = self.inner.outbound.write().await;
        // Re-check under the write lock: concurrent callers racing to create a connection for
        // the same endpoint must converge on a single instance.
        if let Some(existing) = guard.get(&endpoint) {
            return existing.clone();
        }
        let conn = OutboundConnection::spawn(
            endpoint,
            CURRENT_VERSION,
            self.inner.config.connect_timeout,
            self.inner.config.rpc_timeout,
            self.advertised_addr().await,
            self.inner.preferred_ip.clone(),
            self.inner.dropped_counters.clone(),
            self.inner.shutdown_signal.clone(),
        );
        guard.insert(endpoint, conn.clone());
        conn
    }

    /// Fire-and-forget send. Allocates an id if one isn't already known to the caller.
    pub async fn send_one_way(&self, msg: MessageOut, to: SocketAddr) -> MessageId {
        let id = self.allocate_id();
        self.send_one_way_with_id(msg, id, to).await;
        id
    }

    pub async fn send_one_way_with_id(&self, msg: MessageOut, id: MessageId, to: SocketAddr) {
        let conn = self.connection_for(to).await;
        conn.enqueue(id, msg);
    }

    /// Sends `msg` reusing an existing id, for reply correlation.
    pub async fn send_reply(&self, msg: MessageOut, id: MessageId, to: SocketAddr) {
        self.send_one_way_with_id(msg, id, to).await;
    }

    /// Registers a callback and sends a request-reply message. Returns the allocated id; the
    /// caller consumes the reply through `callback`, not by polling.
    pub async fn send_rr<T, C>(
        &self,
        msg: MessageOut,
        to: SocketAddr,
        callback: C,
        timeout: Option<Duration>,
    ) -> Result<MessageId, MessagingError>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        C: ResponseCallback<T> + 'static,
    {
        let id = self.allocate_id();
        let callback = Arc::new(callback);
        let wants_failure = callback.wants_failure_callback();

        let dispatch_cb = callback.clone();
        let dispatch: Box<dyn FnOnce(MessageIn) + Send> = Box::new(move |message: MessageIn| match message.decode_payload::<T>() {
            Ok(payload) => dispatch_cb.on_response(message.from, payload),
            Err(e) => warn!(target: LOG_TARGET, "failed to decode reply payload: {}", e),
        });
        let failure_cb = callback.clone();
        let on_failure: Box<dyn FnOnce(SocketAddr) + Send> = Box::new(move |target| failure_cb.on_failure(target));

        let info = CallbackInfo::new(to, wants_failure, dispatch, on_failure);
        let ttl = timeout.or(msg.timeout).unwrap_or(self.inner.config.rpc_timeout);
        self.inner.callback_registry.put(id, info, ttl).await?;

        let msg = if wants_failure { msg.mark_failure_callback_requested() } else { msg };
        self.send_one_way_with_id(msg, id, to).await;
        Ok(id)
    }

    /// The hub's own dispatch for inbound frames: looks up the stage for `message.verb` and
    /// submits the verb handler, or -- for `REQUEST_RESPONSE`/`INTERNAL_RESPONSE` -- routes the
    /// reply through the callback registry by id, recording round-trip latency for subscribers.
    /// An id with no live callback is dropped silently.
    pub(crate) async fn dispatch_inbound(&self, message: MessageIn, id: MessageId) {
        if matches!(message.verb, Verb::RequestResponse | Verb::InternalResponse) {
            let age = self.inner.callback_registry.get_age(id).await;
            match self.inner.callback_registry.remove(id).await {
                Some(info) => {
                    let from = info.target;
                    if let Some(age) = age {
                        let subscribers = self.inner.latency_subscribers.read().await;
                        for subscriber in subscribers.iter() {
                            subscriber.on_round_trip(from, age);
                        }
                    }
                    info.deliver(message);
                },
                None => {
                    trace!(target: LOG_TARGET, "dropping reply {} to unknown/expired callback", id);
                },
            }
            return;
        }

        let handler = self.inner.verb_handlers.read().await.get(&message.verb).cloned();
        match handler {
            Some(handler) => {
                let stage = message.verb.stage();
                self.inner.stage_dispatcher.submit(
                    stage,
                    Box::pin(async move {
                        handler.do_verb(message, id).await;
                    }),
                );
            },
            None => {
                warn!(target: LOG_TARGET, "no verb handler registered for {:?}, dropping message {}", message.verb, id);
            },
        }
    }

    pub(crate) async fn record_peer_version(&self, peer: SocketAddr, version: u8) {
        self.inner.peer_versions.write().await.insert(peer, version);
    }

    pub async fn remove_version(&self, peer: SocketAddr) {
        self.inner.peer_versions.write().await.remove(&peer);
    }

    /// `min(known_version, CURRENT_VERSION)`, or `CURRENT_VERSION` if the peer is unknown.
    pub async fn get_version(&self, peer: SocketAddr) -> u8 {
        match self.inner.peer_versions.read().await.get(&peer) {
            Some(v) => (*v).min(CURRENT_VERSION),
            None => CURRENT_VERSION,
        }
    }

    /// Resets the outbound connection to `peer`, discarding anything still queued.
    pub async fn convict(&self, peer: SocketAddr) {
        if let Some(conn) = self.inner.outbound.read().await.get(&peer) {
            conn.reset();
        }
    }

    /// Retargets the outbound connection keyed by `old` to dial `new` instead, without draining
    /// any other state. Implemented by replacing the table entry with a freshly spawned
    /// connection under the same key, since `OutboundConnection`'s endpoint is immutable once
    /// spawned.
    pub async fn reconnect(&self, old: SocketAddr, new: SocketAddr) {
        let advertised = self.advertised_addr().await;
        let mut guard = self.inner.outbound.write().await;
        if guard.remove(&old).is_some() {
            let conn = OutboundConnection::spawn(
                new,
                CURRENT_VERSION,
                self.inner.config.connect_timeout,
                self.inner.config.rpc_timeout,
                advertised,
                self.inner.preferred_ip.clone(),
                self.inner.dropped_counters.clone(),
                self.inner.shutdown_signal.clone(),
            );
            guard.insert(old, conn);
        }
    }

    pub async fn subscribe_latency(&self, subscriber: Arc<dyn LatencySubscriber>) {
        self.inner.latency_subscribers.write().await.push(subscriber);
    }

    /// Binds the plaintext storage port (and, per `internode_encryption`, the SSL storage port)
    /// and begins accepting connections. Returns a handle whose `wait_until_listening` resolves
    /// once the bind has completed.
    pub async fn listen(self: &Arc<Self>) -> Result<Listener, BindError> {
        Listener::bind(self.clone(), self.inner.shutdown_signal.clone()).await
    }

    pub(crate) fn authenticator(&self) -> Arc<dyn InternodeAuthenticator> {
        self.inner.authenticator.clone()
    }

    pub(crate) fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    pub(crate) async fn spawn_inbound(self: &Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr, shutdown: ShutdownSignal) {
        let hub = self.clone();
        tokio::spawn(async move {
            InboundConnection::run(stream, peer, hub, shutdown).await;
        });
    }

    /// Quiesces the callback registry (waits for every entry to be delivered or to expire) and
    /// closes all listeners. No new sends are accepted once this returns.
    pub async fn shutdown(&self) {
        debug!(target: LOG_TARGET, "messaging service shutting down");
        self.inner.callback_registry.shutdown_blocking().await;
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl VerbHandler for NoopHandler {
        async fn do_verb(&self, _message: MessageIn, _id: MessageId) {}
    }

    fn config() -> MessagingConfig {
        let mut config = MessagingConfig::default();
        config.listen_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config
    }

    #[tokio::test]
    async fn duplicate_verb_registration_is_rejected() {
        let hub = MessagingService::new(config(), Arc::new(AllowAllAuthenticator));
        hub.register_verb_handler(Verb::Echo, Arc::new(NoopHandler)).await.unwrap();
        let err = hub.register_verb_handler(Verb::Echo, Arc::new(NoopHandler)).await.unwrap_err();
        assert!(matches!(err, MessagingError::DuplicateVerbHandler(Verb::Echo)));
    }

    #[tokio::test]
    async fn get_version_is_clamped_to_current_and_defaults_when_unknown() {
        let hub = MessagingService::new(config(), Arc::new(AllowAllAuthenticator));
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100);

        // Unknown peer: assume current.
        assert_eq!(hub.get_version(peer).await, CURRENT_VERSION);

        // A peer claiming a version newer than this build is clamped down to CURRENT_VERSION.
        hub.record_peer_version(peer, CURRENT_VERSION + 50).await;
        assert_eq!(hub.get_version(peer).await, CURRENT_VERSION);

        // A peer claiming an older version is reported as-is, not clamped upward.
        hub.record_peer_version(peer, 0).await;
        assert_eq!(hub.get_version(peer).await, 0);

        hub.remove_version(peer).await;
        assert_eq!(hub.get_version(peer).await, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn allocated_ids_are_monotonically_increasing() {
        let hub = MessagingService::new(config(), Arc::new(AllowAllAuthenticator));
        let first = hub.allocate_id();
        let second = hub.allocate_id();
        assert!(second > first);
    }
}
