// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;

use crate::{error::FrameError, verb::Verb};

/// Correlates a request with its reply. Unique only among currently-outstanding callbacks, not
/// globally.
pub type MessageId = u64;

/// Sender wants a failure notification if no reply arrives before the callback expires.
pub const PARAM_CALLBACK: &str = "CAL_BAC";
/// This message is itself a failure notification rather than an ordinary reply.
pub const PARAM_FAILURE: &str = "FAIL";

pub type Parameters = HashMap<String, Bytes>;

/// An outgoing message: a verb, an already-serialized payload, free-form parameters, and an
/// optional per-message timeout overriding the hub's default RPC timeout.
#[derive(Debug, Clone)]
pub struct MessageOut {
    pub verb: Verb,
    pub payload: Bytes,
    pub parameters: Parameters,
    pub timeout: Option<Duration>,
}

impl MessageOut {
    /// Serializes `payload` with the crate's wire codec (`serde_json`, standing in for a
    /// verb-specific serializer supplied by an external collaborator).
    pub fn new<T: Serialize>(verb: Verb, payload: &T) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(payload).map_err(|e| FrameError::PayloadDecode(e.to_string()))?;
        Ok(Self {
            verb,
            payload: Bytes::from(payload),
            parameters: Parameters::new(),
            timeout: None,
        })
    }

    /// Builds a message from an already-encoded payload, e.g. for verbs whose serializer lives
    /// outside this crate.
    pub fn from_raw(verb: Verb, payload: Bytes) -> Self {
        Self {
            verb,
            payload,
            parameters: Parameters::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Bytes) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub(crate) fn mark_failure_callback_requested(mut self) -> Self {
        self.parameters.insert(PARAM_CALLBACK.to_string(), Bytes::from_static(b"1"));
        self
    }

    pub fn mark_as_failure_notification(mut self) -> Self {
        self.parameters.insert(PARAM_FAILURE.to_string(), Bytes::from_static(b"1"));
        self
    }

    pub fn is_failure_notification(&self) -> bool {
        self.parameters.contains_key(PARAM_FAILURE)
    }
}

/// The peer-side reconstruction of a [`MessageOut`] once it has been framed off the wire.
#[derive(Debug, Clone)]
pub struct MessageIn {
    pub from: SocketAddr,
    pub verb: Verb,
    pub payload: Bytes,
    pub parameters: Parameters,
    pub version: u8,
    pub arrival: Instant,
}

impl MessageIn {
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_slice(&self.payload).map_err(|e| FrameError::PayloadDecode(e.to_string()))
    }

    pub fn wants_failure_callback(&self) -> bool {
        self.parameters.contains_key(PARAM_CALLBACK)
    }

    pub fn is_failure_notification(&self) -> bool {
        self.parameters.contains_key(PARAM_FAILURE)
    }
}

/// The pending half of an outstanding request/response: everything the callback registry needs
/// to route a reply (or an expiry) back to caller code, with the concrete payload type erased.
///
/// Owned exclusively by the callback registry while resident; `CallbackRegistry::remove` is the
/// only way to get one back out.
pub struct CallbackInfo {
    pub target: SocketAddr,
    pub created_at: Instant,
    pub wants_failure: bool,
    dispatch: Box<dyn FnOnce(MessageIn) + Send>,
    on_failure: Box<dyn FnOnce(SocketAddr) + Send>,
}

impl CallbackInfo {
    pub fn new(
        target: SocketAddr,
        wants_failure: bool,
        dispatch: Box<dyn FnOnce(MessageIn) + Send>,
        on_failure: Box<dyn FnOnce(SocketAddr) + Send>,
    ) -> Self {
        Self {
            target,
            created_at: Instant::now(),
            wants_failure,
            dispatch,
            on_failure,
        }
    }

    /// Consumes the entry, delivering an arrived reply to the original caller's callback.
    pub fn deliver(self, message: MessageIn) {
        (self.dispatch)(message);
    }

    /// Consumes the entry, notifying the original caller's callback that no reply arrived in
    /// time. Only meaningful when `wants_failure` is set; the hub checks this before calling.
    pub fn notify_failure(self, target: SocketAddr) {
        (self.on_failure)(target);
    }
}

impl std::fmt::Debug for CallbackInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackInfo")
            .field("target", &self.target)
            .field("created_at", &self.created_at)
            .field("wants_failure", &self.wants_failure)
            .finish_non_exhaustive()
    }
}

/// A user-supplied continuation invoked either when a reply to a `send_rr` call arrives, or (for
/// failure-aware callbacks) when the request times out with no reply.
pub trait ResponseCallback<T>: Send + Sync + 'static {
    fn on_response(&self, from: SocketAddr, response: T);

    /// Default: not failure-aware. Override alongside [`ResponseCallback::wants_failure_callback`]
    /// to be notified of timeouts.
    fn on_failure(&self, _target: SocketAddr) {}

    fn wants_failure_callback(&self) -> bool {
        false
    }
}
