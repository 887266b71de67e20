// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

use std::{net::IpAddr, sync::Arc, time::Duration};

use crate::{
    config::MessagingConfig,
    handlers::EchoHandler,
    hub::{AllowAllAuthenticator, MessagingService},
    listener::Listener,
    verb::Verb,
};

/// An in-process messaging node bound to an ephemeral loopback port, with the built-in `ECHO`
/// handler pre-registered. Used by integration tests to exercise real TCP round trips without
/// depending on external network configuration.
pub struct TestNode {
    pub hub: Arc<MessagingService>,
    pub listener: Listener,
}

impl TestNode {
    /// Spawns a node listening on `127.0.0.1:0` with a short default RPC timeout suited to tests.
    pub async fn spawn() -> Self {
        Self::spawn_with_config(|c| {
            c.rpc_timeout = Duration::from_secs(2);
        })
        .await
    }

    pub async fn spawn_with_config(configure: impl FnOnce(&mut MessagingConfig)) -> Self {
        let mut config = MessagingConfig::default();
        config.listen_address = IpAddr::from([127, 0, 0, 1]);
        config.storage_port = 0;
        config.drop_log_interval = Duration::from_millis(50);
        configure(&mut config);

        let hub = MessagingService::new(config, Arc::new(AllowAllAuthenticator));
        hub.register_verb_handler(Verb::Echo, EchoHandler::new(&hub)).await.unwrap();

        let listener = hub.listen().await.expect("test node bind should not fail");
        listener.wait_until_listening().await;

        Self { hub, listener }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr()
    }
}
