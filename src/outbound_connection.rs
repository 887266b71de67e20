// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! One [`OutboundConnection`] per remote endpoint. Lazily connects on first enqueue, serializes
//! all writes for that peer through a single dedicated writer task (guaranteeing per-peer FIFO
//! delivery order), and silently drops droppable-verb messages that have aged past their timeout
//! while still queued.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, trace, warn};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::Instant,
};

use crate::{
    error::{ConnectionError, FrameError},
    message::{MessageId, MessageOut},
    metrics::DroppedMessageCounters,
    protocol::{frame::write_frame, handshake::write_advertised_addr, header::{pack_header, PROTOCOL_MAGIC}},
    shutdown::ShutdownSignal,
};

const LOG_TARGET: &str = "cluster_messaging::outbound_connection";

/// Rewrites a logical endpoint to the physical address that should actually be dialed. The
/// endpoint table is still keyed by the original (pre-rewrite) address, so caller identity is
/// preserved through address migrations -- only the socket target changes.
pub type PreferredIpResolver = Arc<dyn Fn(SocketAddr) -> SocketAddr + Send + Sync>;

struct QueuedMessage {
    id: MessageId,
    msg: MessageOut,
    enqueued_at: Instant,
    generation: u64,
}

pub struct OutboundConnection {
    endpoint: SocketAddr,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    generation: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
    timeouts: Arc<AtomicU64>,
}

struct WriterState {
    endpoint: SocketAddr,
    advertised_addr: SocketAddr,
    preferred_ip: Option<PreferredIpResolver>,
    connect_timeout: Duration,
    default_timeout: Duration,
    protocol_version: u8,
    generation: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    pending: Arc<AtomicU64>,
    dropped_counters: Arc<DroppedMessageCounters>,
    socket: Option<TcpStream>,
}

impl OutboundConnection {
    /// Spawns the dedicated writer task and returns a handle to it. `endpoint` is the connection's
    /// permanent identity (the table key); `preferred_ip`, if set, may rewrite only the dial
    /// target. `advertised_addr` is this node's own reachable endpoint, written into the
    /// connection preamble so the peer knows where to route replies.
    pub fn spawn(
        endpoint: SocketAddr,
        protocol_version: u8,
        connect_timeout: Duration,
        default_timeout: Duration,
        advertised_addr: SocketAddr,
        preferred_ip: Option<PreferredIpResolver>,
        dropped_counters: Arc<DroppedMessageCounters>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(AtomicU64::new(0));
        let timeouts = Arc::new(AtomicU64::new(0));

        let state = WriterState {
            endpoint,
            advertised_addr,
            preferred_ip,
            connect_timeout,
            default_timeout,
            protocol_version,
            generation: generation.clone(),
            completed: completed.clone(),
            pending: pending.clone(),
            dropped_counters,
            socket: None,
        };
        tokio::spawn(run_writer(state, rx, shutdown));

        Arc::new(Self {
            endpoint,
            tx,
            generation,
            completed,
            pending,
            timeouts,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Non-blocking append to the send queue. The connection itself takes responsibility for
    /// eventually writing or discarding the message.
    pub fn enqueue(&self, id: MessageId, msg: MessageOut) {
        let queued = QueuedMessage {
            id,
            msg,
            enqueued_at: Instant::now(),
            generation: self.generation.load(Ordering::SeqCst),
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(queued).is_err() {
            trace!(target: LOG_TARGET, "outbound connection to {} has shut down, dropping message", self.endpoint);
        }
    }

    /// Closes the current socket and discards anything still queued under the old generation.
    /// Identity is preserved; the next enqueue reconnects.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Bumps this connection's own timeout count. Called by the hub's timeout reporter in
    /// addition to the hub-wide `TimeoutCounters`, per the per-connection timeout count in this
    /// connection's own data model.
    pub fn increment_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending_messages(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn completed_messages(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

async fn run_writer(mut state: WriterState, mut rx: mpsc::UnboundedReceiver<QueuedMessage>, mut shutdown: ShutdownSignal) {
    loop {
        let queued = tokio::select! {
            queued = rx.recv() => queued,
            _ = shutdown.wait() => None,
        };
        let Some(queued) = queued else {
            debug!(target: LOG_TARGET, "outbound writer for {} shutting down", state.endpoint);
            return;
        };

        state.pending.fetch_sub(1, Ordering::Relaxed);

        // Discarded by an intervening reset(): this message belongs to a generation that is no
        // longer current.
        if queued.generation != state.generation.load(Ordering::SeqCst) {
            trace!(target: LOG_TARGET, "discarding message {} to {}: connection was reset", queued.id, state.endpoint);
            continue;
        }

        if is_aged_past_timeout(&queued, state.default_timeout) {
            state.dropped_counters.increment(queued.msg.verb).await;
            trace!(target: LOG_TARGET, "dropped aged {:?} message {} to {}", queued.msg.verb, queued.id, state.endpoint);
            continue;
        }

        if state.socket.is_none() {
            if let Err(e) = connect(&mut state).await {
                warn!(target: LOG_TARGET, "{}; message {} to {} lost, next send retries", e, queued.id, state.endpoint);
                continue;
            }
        }

        if let Err(e) = send_one(&mut state, &queued).await {
            warn!(target: LOG_TARGET, "write to {} failed, resetting connection: {}", state.endpoint, e);
            state.socket = None;
            state.generation.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        state.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// `true` for droppable-verb messages that have sat in the queue longer than their effective
/// timeout. Non-droppable verbs are never aged out, however long they wait.
fn is_aged_past_timeout(queued: &QueuedMessage, default_timeout: Duration) -> bool {
    if !queued.msg.verb.is_droppable() {
        return false;
    }
    let timeout = queued.msg.timeout.unwrap_or(default_timeout);
    queued.enqueued_at.elapsed() > timeout
}

async fn connect(state: &mut WriterState) -> Result<(), ConnectionError> {
    let dial_target = match &state.preferred_ip {
        Some(resolver) => resolver(state.endpoint),
        None => state.endpoint,
    };
    let attempt = tokio::time::timeout(state.connect_timeout, TcpStream::connect(dial_target)).await;
    let mut stream = match attempt {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ConnectionError::ConnectRefused(state.endpoint, e.to_string())),
        Err(_) => return Err(ConnectionError::ConnectTimeout(state.endpoint)),
    };

    let header = pack_header(state.protocol_version, false, false);
    write_preamble(&mut stream, header, state.advertised_addr)
        .await
        .map_err(|e| ConnectionError::WriteFailed(e.to_string()))?;

    state.socket = Some(stream);
    Ok(())
}

async fn write_preamble(stream: &mut TcpStream, header: u32, advertised_addr: SocketAddr) -> Result<(), FrameError> {
    stream.write_u32(PROTOCOL_MAGIC).await?;
    stream.write_u32(header).await?;
    write_advertised_addr(stream, advertised_addr).await?;
    stream.flush().await?;
    Ok(())
}

async fn send_one(state: &mut WriterState, queued: &QueuedMessage) -> Result<(), ConnectionError> {
    let socket = state.socket.as_mut().expect("checked by caller");
    let timestamp_millis = (chrono::Utc::now().timestamp_millis() & 0xFFFF_FFFF) as u32;
    write_frame(socket, queued.id, timestamp_millis, queued.msg.verb, &queued.msg.parameters, &queued.msg.payload)
        .await
        .map_err(|e| ConnectionError::WriteFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::net::TcpListener;

    use super::*;
    use crate::{message::MessageOut, shutdown::Shutdown, verb::Verb};

    #[tokio::test]
    async fn enqueue_connects_lazily_and_completes() {
        let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8];
            tokio::io::AsyncReadExt::read_exact(&mut socket, &mut buf).await.unwrap();
            crate::protocol::handshake::read_advertised_addr(&mut socket).await.unwrap();
        });

        let shutdown = Shutdown::new();
        let advertised = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999);
        let conn = OutboundConnection::spawn(
            addr,
            1,
            Duration::from_secs(1),
            Duration::from_secs(1),
            advertised,
            None,
            Arc::new(DroppedMessageCounters::new()),
            shutdown.to_signal(),
        );

        let msg = MessageOut::new(Verb::Echo, &"ping".to_string()).unwrap();
        conn.enqueue(1, msg);

        tokio::time::timeout(Duration::from_secs(1), accept_task).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.completed_messages(), 1);
    }

    #[tokio::test]
    async fn reset_discards_messages_queued_under_the_old_generation() {
        let shutdown = Shutdown::new();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1); // never actually dialed
        let advertised = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999);
        let conn = OutboundConnection::spawn(
            addr,
            1,
            Duration::from_millis(10),
            Duration::from_secs(1),
            advertised,
            None,
            Arc::new(DroppedMessageCounters::new()),
            shutdown.to_signal(),
        );

        // This message will fail to connect (nothing listens on port 1) and be discarded before
        // reset is even relevant, but it establishes that reset() bumps the generation for
        // anything still pending afterwards.
        conn.reset();
        assert_eq!(conn.completed_messages(), 0);
    }

    #[tokio::test]
    async fn non_droppable_verb_is_never_dropped_for_age() {
        // Mutation is not in the droppable set; even a very old enqueue must still attempt
        // delivery rather than being silently discarded.
        assert!(!Verb::Mutation.is_droppable());
    }

    fn queued(verb: Verb, timeout: Option<Duration>, age: Duration) -> QueuedMessage {
        let mut msg = MessageOut::new(verb, &"x".to_string()).unwrap();
        msg.timeout = timeout;
        QueuedMessage {
            id: 1,
            msg,
            enqueued_at: Instant::now() - age,
            generation: 0,
        }
    }

    #[test]
    fn aged_request_response_past_its_timeout_is_dropped() {
        let msg = queued(Verb::RequestResponse, Some(Duration::from_millis(10)), Duration::from_millis(50));
        assert!(is_aged_past_timeout(&msg, Duration::from_secs(60)));
    }

    #[test]
    fn fresh_request_response_is_not_dropped() {
        let msg = queued(Verb::RequestResponse, Some(Duration::from_secs(60)), Duration::from_millis(1));
        assert!(!is_aged_past_timeout(&msg, Duration::from_secs(60)));
    }

    #[test]
    fn aged_non_droppable_verb_is_never_dropped() {
        let msg = queued(Verb::Mutation, Some(Duration::from_millis(1)), Duration::from_secs(10));
        assert!(!is_aged_past_timeout(&msg, Duration::from_secs(60)));
    }

    #[test]
    fn falls_back_to_default_timeout_when_message_has_none() {
        let msg = queued(Verb::RequestResponse, None, Duration::from_millis(50));
        assert!(is_aged_past_timeout(&msg, Duration::from_millis(10)));
        assert!(!is_aged_past_timeout(&msg, Duration::from_secs(60)));
    }
}
