//! Node identification service
//!
//! A node announces itself with an identification (IDS) response on service
//! channel 0, followed by its name in 4-character chunks on the name service.
//! Other nodes' announcements are collected into a peer table; one claiming
//! our node id with a different identity raises the duplicate-node flag.
//! Nothing else happens on a duplicate: the flag and a counter are the only
//! effects.

use crate::codec::{CanasMessage, ParameterValue, ServiceChannel, BROADCAST_NODE};
use crate::stats::NodeStats;
use crate::types::{from_ns, now_ns, NodeError, Result, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identification service code
pub const IDS_SERVICE: u8 = 0;

/// Node name service code (user-defined range)
pub const NAME_SERVICE: u8 = 100;

/// Service channel used for identification
pub const IDS_CHANNEL: u8 = 0;

/// Longest node name carried on the bus
pub const MAX_NAME_LEN: usize = 32;

const NAME_CHUNK: usize = 4;

/// Who this node is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: u8,
    pub node_type: u8,
    pub hardware_revision: u8,
    pub software_revision: u8,
    pub name: String,
}

impl NodeIdentity {
    fn name_chunks(&self) -> impl Iterator<Item = (u8, [u8; NAME_CHUNK])> + '_ {
        let bytes = &self.name.as_bytes()[..self.name.len().min(MAX_NAME_LEN)];
        bytes.chunks(NAME_CHUNK).enumerate().map(|(i, chunk)| {
            let mut buf = [0u8; NAME_CHUNK];
            buf[..chunk.len()].copy_from_slice(chunk);
            (i as u8, buf)
        })
    }
}

/// Another node seen on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub node_id: u8,
    pub node_type: u8,
    pub hardware_revision: u8,
    pub software_revision: u8,
    pub name: String,
    pub last_seen: Timestamp,
}

/// Identification state of the local node
pub struct IdentityService {
    identity: NodeIdentity,
    duplicate: AtomicBool,
    peers: Mutex<BTreeMap<u8, PeerInfo>>,
    stats: Arc<NodeStats>,
}

impl IdentityService {
    pub fn new(identity: NodeIdentity, stats: Arc<NodeStats>) -> Self {
        Self {
            identity,
            duplicate: AtomicBool::new(false),
            peers: Mutex::new(BTreeMap::new()),
            stats,
        }
    }

    /// Our identity
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Emit the identification response and the name chunks
    pub fn announce(&self, emit: &mut dyn FnMut(CanasMessage)) {
        emit(self.ids_response());
        let id = ServiceChannel::response_id(IDS_CHANNEL);
        for (index, chunk) in self.identity.name_chunks() {
            emit(CanasMessage::new(
                id,
                self.identity.node_id,
                NAME_SERVICE,
                index,
                ParameterValue::AChar4(chunk),
            ));
        }
    }

    /// Identification request addressed to `target` (0 for every node)
    pub fn query(target: u8) -> CanasMessage {
        CanasMessage::new(
            ServiceChannel::request_id(IDS_CHANNEL),
            target,
            IDS_SERVICE,
            0,
            ParameterValue::NoData,
        )
    }

    /// Handle a node-service message, emitting any response
    pub fn handle(&self, message: &CanasMessage, emit: &mut dyn FnMut(CanasMessage)) {
        let Some(channel) = ServiceChannel::from_id(message.id) else {
            return;
        };

        if !channel.is_response {
            let addressed = message.node_id == self.identity.node_id
                || message.node_id == BROADCAST_NODE;
            if message.service_code == IDS_SERVICE && addressed {
                log::debug!("Answering identification request on channel {}", channel.channel);
                let mut response = self.ids_response();
                response.id = ServiceChannel::response_id(channel.channel);
                emit(response);
            }
            return;
        }

        match (message.service_code, message.value) {
            (IDS_SERVICE, ParameterValue::UChar4([hw, sw, _, _])) => {
                self.observe_ids(message.node_id, message.message_code, hw, sw)
            }
            (NAME_SERVICE, ParameterValue::AChar4(chunk)) => {
                self.observe_name(message.node_id, message.message_code, chunk)
            }
            _ => log::trace!("Ignoring node service message {}", message),
        }
    }

    /// True once another node has claimed our node id
    pub fn duplicate_detected(&self) -> bool {
        self.duplicate.load(Ordering::Acquire)
    }

    /// `Err(DuplicateNode)` if a duplicate has been seen
    pub fn check(&self) -> Result<()> {
        if self.duplicate_detected() {
            Err(NodeError::DuplicateNode(self.identity.node_id))
        } else {
            Ok(())
        }
    }

    /// Nodes seen on the bus, ordered by node id
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }

    fn ids_response(&self) -> CanasMessage {
        CanasMessage::new(
            ServiceChannel::response_id(IDS_CHANNEL),
            self.identity.node_id,
            IDS_SERVICE,
            self.identity.node_type,
            ParameterValue::UChar4([
                self.identity.hardware_revision,
                self.identity.software_revision,
                0,
                0,
            ]),
        )
    }

    fn observe_ids(&self, node_id: u8, node_type: u8, hardware: u8, software: u8) {
        if node_id == self.identity.node_id {
            let same = node_type == self.identity.node_type
                && hardware == self.identity.hardware_revision
                && software == self.identity.software_revision;
            if !same {
                self.flag_duplicate(format!(
                    "type {} hw {} sw {}",
                    node_type, hardware, software
                ));
            }
            return;
        }

        let mut peers = self.peers.lock();
        let peer = peers.entry(node_id).or_insert_with(|| {
            log::info!("Discovered node {} (type {})", node_id, node_type);
            PeerInfo {
                node_id,
                node_type,
                hardware_revision: hardware,
                software_revision: software,
                name: String::new(),
                last_seen: from_ns(now_ns()),
            }
        });
        peer.node_type = node_type;
        peer.hardware_revision = hardware;
        peer.software_revision = software;
        peer.last_seen = from_ns(now_ns());
    }

    fn observe_name(&self, node_id: u8, index: u8, chunk: [u8; NAME_CHUNK]) {
        let at = index as usize * NAME_CHUNK;
        if at >= MAX_NAME_LEN {
            return;
        }

        if node_id == self.identity.node_id {
            let ours = self
                .identity
                .name_chunks()
                .find(|(i, _)| *i == index)
                .map(|(_, c)| c);
            if ours != Some(chunk) {
                self.flag_duplicate(format!("name chunk {} {:?}", index, chunk));
            }
            return;
        }

        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&node_id) else {
            return;
        };

        let mut bytes = peer.name.clone().into_bytes();
        if bytes.len() < at + NAME_CHUNK {
            bytes.resize(at + NAME_CHUNK, 0);
        }
        bytes[at..at + NAME_CHUNK].copy_from_slice(&chunk);
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        peer.name = String::from_utf8_lossy(&bytes).into_owned();
        peer.last_seen = from_ns(now_ns());
    }

    fn flag_duplicate(&self, detail: String) {
        self.stats.duplicate_node();
        if !self.duplicate.swap(true, Ordering::AcqRel) {
            log::warn!(
                "Duplicate node id {}: another node announces {}",
                self.identity.node_id,
                detail
            );
        } else {
            log::debug!("Duplicate node id {} seen again", self.identity.node_id);
        }
    }
}
