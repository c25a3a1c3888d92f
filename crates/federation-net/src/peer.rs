//! Peer addressing

use federation_core::types::{InstanceId, PeerRecord};
use serde::{Deserialize, Serialize};

/// Where to reach a remote instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Remote instance
    pub instance_id: InstanceId,
    /// Network address (`host:port`), if the transport needs one
    pub address: Option<String>,
}

impl PeerEndpoint {
    /// Endpoint for an instance reachable without an address (in-process)
    pub fn local(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            address: None,
        }
    }

    /// Endpoint with an explicit network address
    pub fn with_address(instance_id: InstanceId, address: impl Into<String>) -> Self {
        Self {
            instance_id,
            address: Some(address.into()),
        }
    }
}

impl From<&PeerRecord> for PeerEndpoint {
    fn from(record: &PeerRecord) -> Self {
        Self {
            instance_id: record.instance_id,
            address: record.address.clone(),
        }
    }
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.address {
            Some(addr) => write!(f, "{}@{}", self.instance_id, addr),
            None => write!(f, "{}", self.instance_id),
        }
    }
}
