// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Built-in verb handlers that ship with the core rather than belonging to a specific
//! application layer. `EchoHandler` backs the end-to-end liveness scenario in spec section 8:
//! ECHO in, the same payload back out over `REQUEST_RESPONSE` under the original id.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::trace;

use crate::{
    hub::{MessagingService, VerbHandler},
    message::{MessageIn, MessageOut},
    verb::Verb,
};

const LOG_TARGET: &str = "cluster_messaging::handlers::echo";

/// Replies to every `ECHO` it receives with a `REQUEST_RESPONSE` carrying the same payload back
/// to the sender, correlated by the original id. Holds only a `Weak` reference to the hub so
/// registering it does not keep the hub alive past the caller's own `Arc`.
pub struct EchoHandler {
    hub: Weak<MessagingService>,
}

impl EchoHandler {
    pub fn new(hub: &Arc<MessagingService>) -> Arc<Self> {
        Arc::new(Self { hub: Arc::downgrade(hub) })
    }
}

#[async_trait]
impl VerbHandler for EchoHandler {
    async fn do_verb(&self, message: MessageIn, id: u64) {
        let Some(hub) = self.hub.upgrade() else {
            trace!(target: LOG_TARGET, "hub gone, dropping echo from {}", message.from);
            return;
        };
        let reply = MessageOut::from_raw(Verb::RequestResponse, message.payload.clone());
        hub.send_reply(reply, id, message.from).await;
    }
}
