// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// Internode encryption posture. The core does not implement TLS itself -- key material loading
/// and the actual handshake are an external collaborator's job -- but the listener and outbound
/// connection both need to know which posture applies to decide whether to use the encrypted
/// storage port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternodeEncryption {
    None,
    All,
    Dc,
    Rack,
}

impl Default for InternodeEncryption {
    fn default() -> Self {
        InternodeEncryption::None
    }
}

/// Plain, `serde`-deserializable configuration surface for the messaging core. Loading this from
/// a file or the environment is explicitly out of scope here; callers construct it however their
/// own config layer sees fit and hand it to [`crate::hub::MessagingService::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Address the plaintext listener binds to.
    pub listen_address: IpAddr,
    /// Plaintext storage port.
    pub storage_port: u16,
    /// Encrypted storage port, bound in addition to `storage_port` when `internode_encryption`
    /// is not `None`.
    pub ssl_storage_port: u16,
    /// Address advertised to peers as this node's reachable endpoint; may differ from
    /// `listen_address` behind NAT.
    pub broadcast_address: IpAddr,
    /// Default callback TTL ("RPC timeout") used when a send does not specify a per-message
    /// timeout.
    pub rpc_timeout: Duration,
    /// Bound on how long a lazy outbound connect is allowed to take before it is considered
    /// failed.
    pub connect_timeout: Duration,
    /// Internode encryption posture.
    pub internode_encryption: InternodeEncryption,
    /// How often the drop logger emits a delta line per droppable verb.
    pub drop_log_interval: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::from([0, 0, 0, 0]),
            storage_port: 7000,
            ssl_storage_port: 7001,
            broadcast_address: IpAddr::from([127, 0, 0, 1]),
            rpc_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            internode_encryption: InternodeEncryption::None,
            drop_log_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_deserializable_round_trip() {
        let cfg = MessagingConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MessagingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.storage_port, back.storage_port);
        assert_eq!(cfg.internode_encryption, back.internode_encryption);
    }
}
