// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Accepts inbound sockets on the configured storage port (and, when internode encryption is
//! enabled, the SSL storage port too), authenticates each peer before a single byte is read, and
//! spawns an [`InboundConnection`] reader task per accepted socket.

use std::{net::SocketAddr, sync::Arc};

use log::{trace, warn};
use tokio::{
    net::{TcpListener as TokioTcpListener, TcpSocket},
    sync::watch,
};

use crate::{config::InternodeEncryption, error::BindError, hub::MessagingService, shutdown::ShutdownSignal};

const LOG_TARGET: &str = "cluster_messaging::listener";
const ACCEPT_BACKLOG: u32 = 1024;

/// A live, already-bound listener. `wait_until_listening` resolves once the bind has completed;
/// by the time `MessagingService::listen` returns a `Listener` it always has, but the watch
/// channel is exercised directly by tests that want to assert on the one-shot signal itself.
pub struct Listener {
    listening: watch::Receiver<bool>,
    local_addr: SocketAddr,
}

impl Listener {
    pub(crate) async fn bind(hub: Arc<MessagingService>, shutdown: ShutdownSignal) -> Result<Listener, BindError> {
        let config = hub.config();
        let bind_addr = SocketAddr::new(config.listen_address, config.storage_port);
        let plaintext = bind_with_reuseaddr(bind_addr).await?;
        let local_addr = plaintext.local_addr().map_err(|e| BindError::from_io(bind_addr, e))?;
        // `storage_port` may have been 0 (bind-to-any); what we actually advertise to peers must
        // be the port the OS really assigned, not the configured placeholder.
        hub.set_advertised_port(local_addr.port()).await;

        let ssl_listener = if config.internode_encryption != InternodeEncryption::None {
            let ssl_addr = SocketAddr::new(config.listen_address, config.ssl_storage_port);
            Some(bind_with_reuseaddr(ssl_addr).await?)
        } else {
            None
        };

        let (listening_tx, listening_rx) = watch::channel(false);
        let _ = listening_tx.send(true);

        tokio::spawn(accept_loop(plaintext, hub.clone(), shutdown.clone()));
        if let Some(ssl_listener) = ssl_listener {
            tokio::spawn(accept_loop(ssl_listener, hub, shutdown));
        }

        Ok(Listener {
            listening: listening_rx,
            local_addr,
        })
    }

    /// Resolves once the listener has bound. Safe to call (and await) repeatedly.
    pub async fn wait_until_listening(&self) {
        let mut rx = self.listening.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn bind_with_reuseaddr(addr: SocketAddr) -> Result<TokioTcpListener, BindError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| BindError::from_io(addr, e))?;
    socket.set_reuseaddr(true).map_err(|e| BindError::from_io(addr, e))?;
    socket.bind(addr).map_err(|e| BindError::from_io(addr, e))?;
    socket.listen(ACCEPT_BACKLOG).map_err(|e| BindError::from_io(addr, e))
}

async fn accept_loop(listener: TokioTcpListener, hub: Arc<MessagingService>, mut shutdown: ShutdownSignal) {
    let local_addr = listener.local_addr().ok();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait() => {
                trace!(target: LOG_TARGET, "listener on {:?} shutting down", local_addr);
                return;
            }
        };
        match accepted {
            Ok((stream, peer)) => {
                let authenticator = hub.authenticator();
                if !authenticator.authenticate(peer).await {
                    trace!(target: LOG_TARGET, "rejecting unauthenticated peer {}", peer);
                    continue;
                }
                hub.spawn_inbound(stream, peer, shutdown.clone()).await;
            },
            Err(e) => {
                warn!(target: LOG_TARGET, "accept failed: {}", e);
            },
        }
    }
}
