// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::io;

use crate::{message::MessageId, verb::Verb};

/// Errors surfaced synchronously by the messaging hub, i.e. at registration or send time rather than
/// somewhere deep in a connection's I/O loop.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("a handler is already registered for verb {0:?}")]
    DuplicateVerbHandler(Verb),
    #[error("callback id {0} is already live in the registry")]
    DuplicateCallbackId(MessageId),
    #[error("no verb handler registered for {0:?}")]
    NoVerbHandler(Verb),
    #[error("the messaging service is shutting down and no longer accepts new callbacks")]
    ShuttingDown,
    #[error("listener bind error: {0}")]
    Bind(#[from] BindError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Bind failures distinguished the way a config-validation layer needs them distinguished: a
/// transient "something else is already listening" versus a hard misconfiguration.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("address {0} is already in use")]
    AddressInUse(std::net::SocketAddr),
    #[error("cannot assign requested address {0}")]
    CannotAssignAddress(std::net::SocketAddr),
    #[error("io error binding listener: {0}")]
    Io(#[source] io::Error),
}

impl BindError {
    pub fn from_io(addr: std::net::SocketAddr, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => BindError::AddressInUse(addr),
            io::ErrorKind::AddrNotAvailable => BindError::CannotAssignAddress(addr),
            _ => BindError::Io(err),
        }
    }
}

/// Frame-level failures. A mismatch or truncation here always results in the connection closing;
/// nothing upstream is notified, per the drop-silently policy for malformed input.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad protocol magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },
    #[error("unknown verb ordinal {0}")]
    UnknownVerb(u32),
    #[error("no deserializer available for verb {0:?} (not a static-serializer verb and no pending callback)")]
    NoDeserializer(Verb),
    #[error("payload deserialization failed: {0}")]
    PayloadDecode(String),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("unknown advertised-address family {0}")]
    BadAddressFamily(u8),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures on the outbound connection's connect/write path. These never propagate to the
/// sender synchronously -- enqueue always succeeds or the message is silently discarded -- but
/// they are recorded so tests and operators can observe what happened.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ConnectionError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(std::net::SocketAddr),
    #[error("connect to {0} refused: {1}")]
    ConnectRefused(std::net::SocketAddr, String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("connection was reset")]
    Reset,
}
