// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Per-accepted-socket reader: validates the protocol magic, reads the peer's advertised reachable
//! address and negotiated version, then loops reading framed messages and handing each to the hub
//! for dispatch. Owns its socket and in-flight parse buffer exclusively; nothing else ever touches
//! them.

use std::net::SocketAddr;

use log::{trace, warn};
use tokio::{net::TcpStream, time::Instant};

use crate::{
    hub::MessagingService,
    protocol::{
        frame::read_frame,
        handshake::read_advertised_addr,
        header::{unpack_version, PROTOCOL_MAGIC},
    },
    shutdown::ShutdownSignal,
};
use std::sync::Arc;

const LOG_TARGET: &str = "cluster_messaging::inbound_connection";

pub struct InboundConnection;

impl InboundConnection {
    /// Drives one accepted socket until it closes, EOF's, sends a malformed frame, or shutdown is
    /// triggered. Authentication has already happened in the listener before this is called.
    pub async fn run(mut stream: TcpStream, peer: SocketAddr, hub: Arc<MessagingService>, mut shutdown: ShutdownSignal) {
        use tokio::io::AsyncReadExt;

        let mut magic_buf = [0u8; 4];
        if stream.read_exact(&mut magic_buf).await.is_err() {
            trace!(target: LOG_TARGET, "connection from {} closed before magic", peer);
            return;
        }
        let magic = u32::from_be_bytes(magic_buf);
        if magic != PROTOCOL_MAGIC {
            warn!(target: LOG_TARGET, "bad magic {:#010x} from {}, closing", magic, peer);
            return;
        }

        let mut header_buf = [0u8; 4];
        if stream.read_exact(&mut header_buf).await.is_err() {
            trace!(target: LOG_TARGET, "connection from {} closed before header", peer);
            return;
        }
        let header = u32::from_be_bytes(header_buf);
        let version = unpack_version(header);

        // The connecting peer's own reachable address, not the ephemeral source port of this
        // socket -- replies are routed to this address, and nothing listens on the source port.
        let peer_addr = match read_advertised_addr(&mut stream).await {
            Ok(addr) => addr,
            Err(e) => {
                trace!(target: LOG_TARGET, "closing connection from {}: malformed advertised address: {}", peer, e);
                return;
            },
        };
        hub.record_peer_version(peer_addr, version).await;

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut stream) => frame,
                _ = shutdown.wait() => {
                    trace!(target: LOG_TARGET, "inbound connection from {} shutting down", peer);
                    return;
                }
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    trace!(target: LOG_TARGET, "closing connection from {}: {}", peer, e);
                    return;
                },
            };

            let message = crate::message::MessageIn {
                from: peer_addr,
                verb: frame.verb,
                payload: frame.payload,
                parameters: frame.parameters,
                version,
                arrival: Instant::now(),
            };
            hub.dispatch_inbound(message, frame.id).await;
        }
    }
}
