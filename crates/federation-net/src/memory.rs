//! In-process transport
//!
//! [`MemoryNetwork`] routes frames between nodes living in the same process.
//! Links can be cut and nodes taken down to simulate partitions and
//! unreachable peers.

use crate::framing::Frame;
use crate::peer::PeerEndpoint;
use crate::transport::{Inbound, Transport, TransportError};
use async_trait::async_trait;
use federation_core::types::InstanceId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Shared switchboard for in-process nodes
#[derive(Default)]
pub struct MemoryNetwork {
    /// Attached nodes (weak, so the network never keeps a node alive)
    nodes: RwLock<HashMap<InstanceId, Weak<dyn Inbound>>>,
    /// Nodes that drop everything
    down: RwLock<HashSet<InstanceId>>,
    /// Cut links, stored in both directions
    blocked: RwLock<HashSet<(InstanceId, InstanceId)>>,
    /// Frames delivered per destination
    delivered: RwLock<HashMap<InstanceId, u64>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node's inbound handler under its instance id
    pub fn attach<I: Inbound + 'static>(&self, id: InstanceId, inbound: &Arc<I>) {
        let inbound: Arc<dyn Inbound> = inbound.clone();
        self.nodes.write().insert(id, Arc::downgrade(&inbound));
    }

    /// Remove a node entirely
    pub fn detach(&self, id: &InstanceId) {
        self.nodes.write().remove(id);
    }

    /// Transport handle for the node `local`
    pub fn transport(self: &Arc<Self>, local: InstanceId, timeout: Duration) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
            timeout,
        }
    }

    /// Take a node down (or bring it back up)
    pub fn set_down(&self, id: InstanceId, down: bool) {
        if down {
            self.down.write().insert(id);
        } else {
            self.down.write().remove(&id);
        }
    }

    /// Cut the link between two nodes
    pub fn partition(&self, a: InstanceId, b: InstanceId) {
        let mut blocked = self.blocked.write();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Restore the link between two nodes
    pub fn heal(&self, a: InstanceId, b: InstanceId) {
        let mut blocked = self.blocked.write();
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    /// Restore every cut link
    pub fn heal_all(&self) {
        self.blocked.write().clear();
    }

    /// Number of frames delivered to a node
    pub fn frames_delivered_to(&self, id: &InstanceId) -> u64 {
        self.delivered.read().get(id).copied().unwrap_or(0)
    }

    fn route(&self, from: InstanceId, to: &PeerEndpoint) -> Result<Arc<dyn Inbound>, TransportError> {
        let id = to.instance_id;
        {
            let down = self.down.read();
            if down.contains(&id) || down.contains(&from) {
                return Err(TransportError::Unreachable(to.clone()));
            }
        }
        if self.blocked.read().contains(&(from, id)) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        let inbound = self
            .nodes
            .read()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;

        *self.delivered.write().entry(id).or_insert(0) += 1;
        Ok(inbound)
    }
}

/// A node's view of the [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: InstanceId,
    timeout: Duration,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, to: &PeerEndpoint, frame: Frame) -> Result<Frame, TransportError> {
        let inbound = self.network.route(self.local, to)?;
        trace!("memory: {} -> {} ({:?})", self.local, to.instance_id, frame.frame_type);
        // The receiver runs in its own task, as it would behind a socket, so a
        // sender giving up does not cancel the receiver's processing.
        let handling = tokio::spawn(async move { inbound.on_frame(frame).await });
        tokio::time::timeout(self.timeout, handling)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
