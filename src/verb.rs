// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! The closed verb enumeration and its two static associations (stage, droppability). Wire
//! ordinals are load-bearing: new verbs are appended only, and the reserved slots below
//! (`1`, `10`) are never reassigned even though nothing in this implementation constructs them.

use std::convert::TryFrom;

use crate::error::FrameError;

/// A worker-pool identity. Verbs are mapped to exactly one stage so that, for example, gossip
/// traffic is never starved by a backlog of client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    RequestResponse,
    InternalResponse,
    Gossip,
    Mutation,
    Schema,
    Misc,
}

impl Stage {
    /// All stages, used to build the dispatcher at startup.
    pub const ALL: [Stage; 6] = [
        Stage::RequestResponse,
        Stage::InternalResponse,
        Stage::Gossip,
        Stage::Mutation,
        Stage::Schema,
        Stage::Misc,
    ];
}

/// Message kind identifier. The wire form is the ordinal recorded in [`Verb::ordinal`]; ordinals
/// `1` and `10` are reserved historical slots and intentionally have no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Mutation,
    GossipDigestSyn,
    GossipDigestAck,
    GossipDigestAck2,
    Echo,
    SchemaPull,
    SchemaPush,
    RequestResponse,
    InternalResponse,
}

impl Verb {
    pub fn ordinal(self) -> u32 {
        match self {
            Verb::Mutation => 0,
            // 1 is `_RESERVED_BINARY`, preserved so older peers never see it reassigned.
            Verb::GossipDigestSyn => 2,
            Verb::GossipDigestAck => 3,
            Verb::GossipDigestAck2 => 4,
            Verb::Echo => 5,
            Verb::SchemaPull => 6,
            Verb::SchemaPush => 7,
            Verb::RequestResponse => 8,
            Verb::InternalResponse => 9,
            // 10 is `_RESERVED_REPLICATION_FINISHED`, likewise preserved.
        }
    }

    /// The worker pool that executes this verb's handler.
    pub fn stage(self) -> Stage {
        match self {
            Verb::Mutation => Stage::Mutation,
            Verb::GossipDigestSyn | Verb::GossipDigestAck | Verb::GossipDigestAck2 => Stage::Gossip,
            Verb::Echo => Stage::Misc,
            Verb::SchemaPull | Verb::SchemaPush => Stage::Schema,
            Verb::RequestResponse => Stage::RequestResponse,
            Verb::InternalResponse => Stage::InternalResponse,
        }
    }

    /// `true` for verbs whose payload type is fixed at compile time rather than recovered from
    /// the originating request's callback.
    pub fn has_static_serializer(self) -> bool {
        !matches!(self, Verb::RequestResponse | Verb::InternalResponse)
    }

    /// `true` for verbs that may be silently dropped from an outbound queue once they have aged
    /// past their per-message timeout. Currently only `REQUEST_RESPONSE`.
    pub fn is_droppable(self) -> bool {
        matches!(self, Verb::RequestResponse)
    }

    pub const ALL: [Verb; 9] = [
        Verb::Mutation,
        Verb::GossipDigestSyn,
        Verb::GossipDigestAck,
        Verb::GossipDigestAck2,
        Verb::Echo,
        Verb::SchemaPull,
        Verb::SchemaPush,
        Verb::RequestResponse,
        Verb::InternalResponse,
    ];
}

impl TryFrom<u32> for Verb {
    type Error = FrameError;

    fn try_from(ordinal: u32) -> Result<Self, Self::Error> {
        match ordinal {
            0 => Ok(Verb::Mutation),
            2 => Ok(Verb::GossipDigestSyn),
            3 => Ok(Verb::GossipDigestAck),
            4 => Ok(Verb::GossipDigestAck2),
            5 => Ok(Verb::Echo),
            6 => Ok(Verb::SchemaPull),
            7 => Ok(Verb::SchemaPush),
            8 => Ok(Verb::RequestResponse),
            9 => Ok(Verb::InternalResponse),
            // 1 and 10 fall through to UnknownVerb like any other unassigned ordinal: they are
            // reserved, not constructible.
            other => Err(FrameError::UnknownVerb(other)),
        }
    }
}
