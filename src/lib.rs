// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Inter-node messaging fabric for a clustered storage server.
//!
//! This crate is the asynchronous request/response core that carries gossip, schema pulls, echo
//! probes and generic replies between peers: a verb-addressed dispatch protocol
//! ([`verb`], [`protocol`]), per-peer connection multiplexing with lazy connect and reset-on-
//! failure ([`outbound_connection`], [`inbound_connection`], [`listener`]), an expiring callback
//! registry with per-message timeout and failure notification ([`callback_registry`]), a
//! work-stage scheduler mapping verbs to worker pools ([`stage`]), and droppable-message
//! accounting ([`metrics`]). [`hub::MessagingService`] is the public facade tying all of the
//! above together.
//!
//! The surrounding cluster membership layer -- gossip's digest state machine, schema pull logic,
//! replication placement -- is out of scope; this crate only moves bytes between verbs and
//! stages, it does not interpret payloads.

pub mod callback_registry;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod inbound_connection;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod outbound_connection;
pub mod protocol;
pub mod shutdown;
pub mod stage;
pub mod test_utils;
pub mod verb;
