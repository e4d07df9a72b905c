//! Persistent cluster metadata: the set of node descriptors plus this
//! node's own identity, stored through the checksum file store.
//!
//! The record is a tag/length/value encoding rather than bincode so that
//! newer fields survive a round-trip through an older binary: unknown
//! top-level tags are kept verbatim on read and re-emitted on write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::checksumfile;
use crate::error::{KronosError, Result};
use crate::types::{NodeDescriptor, NodeId};

pub const CLUSTER_INFO_FILENAME: &str = "cluster_info";
pub const CLUSTER_INFO_SCHEMA_VERSION: u32 = 1;

const TAG_SCHEMA_VERSION: u32 = 1;
const TAG_SELF_ID: u32 = 2;
const TAG_NODE_DESCRIPTOR: u32 = 3;

const DESC_TAG_NODE_ID: u32 = 1;
const DESC_TAG_RAFT_ADDR: u32 = 2;
const DESC_TAG_GRPC_ADDR: u32 = 3;
const DESC_TAG_IS_REMOVED: u32 = 4;

/// In-memory image of the cluster-info file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterInfo {
    pub schema_version: u32,
    pub self_id: NodeId,
    /// Keyed by node id; BTreeMap keeps the serialized form deterministic.
    pub nodes: BTreeMap<NodeId, NodeDescriptor>,
    /// Top-level fields written by a newer schema, preserved verbatim.
    unknown_fields: Vec<(u32, Vec<u8>)>,
}

impl ClusterInfo {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            schema_version: CLUSTER_INFO_SCHEMA_VERSION,
            self_id,
            nodes: BTreeMap::new(),
            unknown_fields: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_field(&mut buf, TAG_SCHEMA_VERSION, &self.schema_version.to_le_bytes());
        put_field(&mut buf, TAG_SELF_ID, self.self_id.as_bytes());
        for desc in self.nodes.values() {
            put_field(&mut buf, TAG_NODE_DESCRIPTOR, &encode_descriptor(desc));
        }
        for (tag, value) in &self.unknown_fields {
            put_field(&mut buf, *tag, value);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut info = ClusterInfo::default();
        let mut cursor = 0;
        while cursor < data.len() {
            let (tag, value, next) = next_field(data, cursor)?;
            match tag {
                TAG_SCHEMA_VERSION => {
                    let bytes: [u8; 4] = value
                        .try_into()
                        .map_err(|_| decode_err("schema version width"))?;
                    info.schema_version = u32::from_le_bytes(bytes);
                }
                TAG_SELF_ID => {
                    info.self_id = utf8_field(value, "self id")?;
                }
                TAG_NODE_DESCRIPTOR => {
                    let desc = decode_descriptor(value)?;
                    info.nodes.insert(desc.node_id.clone(), desc);
                }
                _ => info.unknown_fields.push((tag, value.to_vec())),
            }
            cursor = next;
        }
        Ok(info)
    }

    fn validate(&self) -> Result<()> {
        if self.self_id.is_empty() {
            return Err(KronosError::Cluster("cluster info has no self id".into()));
        }
        if !self.nodes.contains_key(&self.self_id) {
            return Err(KronosError::Cluster(format!(
                "cluster info has no descriptor for self ({})",
                self.self_id
            )));
        }
        if !self.nodes.values().any(|d| !d.is_removed) {
            return Err(KronosError::Cluster(
                "cluster info has no active members".into(),
            ));
        }
        Ok(())
    }
}

fn encode_descriptor(desc: &NodeDescriptor) -> Vec<u8> {
    let mut buf = Vec::new();
    put_field(&mut buf, DESC_TAG_NODE_ID, desc.node_id.as_bytes());
    put_field(&mut buf, DESC_TAG_RAFT_ADDR, desc.raft_addr.as_bytes());
    put_field(&mut buf, DESC_TAG_GRPC_ADDR, desc.grpc_addr.as_bytes());
    put_field(&mut buf, DESC_TAG_IS_REMOVED, &[u8::from(desc.is_removed)]);
    buf
}

fn decode_descriptor(data: &[u8]) -> Result<NodeDescriptor> {
    let mut desc = NodeDescriptor::new(String::new(), String::new(), String::new());
    let mut cursor = 0;
    while cursor < data.len() {
        let (tag, value, next) = next_field(data, cursor)?;
        match tag {
            DESC_TAG_NODE_ID => desc.node_id = utf8_field(value, "node id")?,
            DESC_TAG_RAFT_ADDR => desc.raft_addr = utf8_field(value, "raft addr")?,
            DESC_TAG_GRPC_ADDR => desc.grpc_addr = utf8_field(value, "grpc addr")?,
            DESC_TAG_IS_REMOVED => {
                desc.is_removed = value.first().copied().unwrap_or(0) != 0;
            }
            // Unknown descriptor-level tags are skipped; the descriptor is
            // rewritten whole from the replicated state anyway.
            _ => {}
        }
        cursor = next;
    }
    if desc.node_id.is_empty() {
        return Err(decode_err("descriptor without node id"));
    }
    Ok(desc)
}

fn put_field(buf: &mut Vec<u8>, tag: u32, value: &[u8]) {
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

fn next_field(data: &[u8], cursor: usize) -> Result<(u32, &[u8], usize)> {
    if cursor + 8 > data.len() {
        return Err(decode_err("truncated field header"));
    }
    let tag = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap());
    let len = u32::from_le_bytes(data[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
    let start = cursor + 8;
    let end = start + len;
    if end > data.len() {
        return Err(decode_err("truncated field value"));
    }
    Ok((tag, &data[start..end], end))
}

fn utf8_field(value: &[u8], what: &str) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| decode_err(what))
}

fn decode_err(what: &str) -> KronosError {
    KronosError::Serialization {
        operation: "decode cluster info".to_string(),
        source: what.to_string().into(),
    }
}

pub fn cluster_info_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CLUSTER_INFO_FILENAME)
}

pub fn cluster_info_exists(data_dir: &Path) -> bool {
    cluster_info_path(data_dir).exists()
}

/// The durable metadata store. A single mutex serializes writers; readers
/// take consistent snapshot copies.
pub struct Cluster {
    path: PathBuf,
    inner: Mutex<ClusterInfo>,
}

impl Cluster {
    /// Load an existing store, verifying the checksum and invariants.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = cluster_info_path(data_dir);
        let payload = checksumfile::read(&path)?;
        let info = ClusterInfo::decode(&payload)?;
        info.validate()?;
        Ok(Self {
            path,
            inner: Mutex::new(info),
        })
    }

    /// Initialize a fresh store and persist it immediately.
    pub fn create(data_dir: &Path, info: ClusterInfo) -> Result<Self> {
        info.validate()?;
        let cluster = Self {
            path: cluster_info_path(data_dir),
            inner: Mutex::new(info),
        };
        cluster.persist()?;
        Ok(cluster)
    }

    pub fn persist(&self) -> Result<()> {
        let payload = self.inner.lock().unwrap().encode();
        checksumfile::write(&self.path, &payload)
    }

    pub fn self_id(&self) -> NodeId {
        self.inner.lock().unwrap().self_id.clone()
    }

    /// Insert or overwrite a descriptor. A tombstone is never resurrected
    /// here; membership rules live in the state machine.
    pub fn add_or_update(&self, desc: NodeDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.insert(desc.node_id.clone(), desc);
    }

    pub fn mark_removed(&self, node_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(node_id) {
            Some(desc) => {
                if !desc.is_removed {
                    desc.is_removed = true;
                    info!(node_id, "marked node as removed in cluster metadata");
                }
                Ok(())
            }
            None => Err(KronosError::Cluster(format!(
                "unknown node id: {}",
                node_id
            ))),
        }
    }

    pub fn descriptor(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.inner.lock().unwrap().nodes.get(node_id).cloned()
    }

    pub fn is_removed(&self, node_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(node_id)
            .map(|d| d.is_removed)
            .unwrap_or(false)
    }

    /// All descriptors, tombstones included.
    pub fn all_nodes(&self) -> Vec<NodeDescriptor> {
        self.inner.lock().unwrap().nodes.values().cloned().collect()
    }

    /// Live members, self included.
    pub fn active_nodes(&self) -> Vec<NodeDescriptor> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|d| !d.is_removed)
            .cloned()
            .collect()
    }

    /// Live members other than self.
    pub fn active_peers(&self) -> Vec<NodeDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .values()
            .filter(|d| !d.is_removed && d.node_id != inner.self_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> ClusterInfo {
        self.inner.lock().unwrap().clone()
    }

    pub fn close(&self) -> Result<()> {
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(id: &str, removed: bool) -> NodeDescriptor {
        NodeDescriptor {
            node_id: id.to_string(),
            raft_addr: format!("127.0.0.1:57{}0", id.len()),
            grpc_addr: format!("127.0.0.1:57{}1", id.len()),
            is_removed: removed,
        }
    }

    fn sample_info() -> ClusterInfo {
        let mut info = ClusterInfo::new("aaaa".to_string());
        info.nodes
            .insert("aaaa".to_string(), descriptor("aaaa", false));
        info.nodes
            .insert("bbbb".to_string(), descriptor("bbbb", true));
        info
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let info = sample_info();
        let decoded = ClusterInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let info = sample_info();
        assert_eq!(info.encode(), info.encode());
    }

    #[test]
    fn test_unknown_tags_preserved() {
        let mut payload = sample_info().encode();
        // A field from some future schema.
        put_field(&mut payload, 99, b"future data");

        let decoded = ClusterInfo::decode(&payload).unwrap();
        assert_eq!(decoded.unknown_fields, vec![(99, b"future data".to_vec())]);
        assert_eq!(decoded.encode(), payload);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let payload = sample_info().encode();
        assert!(ClusterInfo::decode(&payload[..payload.len() - 3]).is_err());
    }

    #[test]
    fn test_store_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let cluster = Cluster::create(dir.path(), sample_info()).unwrap();
        cluster.add_or_update(descriptor("cccc", false));
        cluster.persist().unwrap();

        let reloaded = Cluster::load(dir.path()).unwrap();
        assert_eq!(reloaded.self_id(), "aaaa");
        assert_eq!(reloaded.all_nodes().len(), 3);
        assert!(reloaded.is_removed("bbbb"));
        assert!(!reloaded.is_removed("cccc"));
    }

    #[test]
    fn test_mark_removed() {
        let dir = TempDir::new().unwrap();
        let cluster = Cluster::create(dir.path(), sample_info()).unwrap();
        cluster.mark_removed("aaaa").unwrap();
        assert!(cluster.is_removed("aaaa"));
        // Idempotent.
        cluster.mark_removed("aaaa").unwrap();
        assert!(cluster.mark_removed("zzzz").is_err());
    }

    #[test]
    fn test_active_peers_excludes_self_and_tombstones() {
        let dir = TempDir::new().unwrap();
        let cluster = Cluster::create(dir.path(), sample_info()).unwrap();
        cluster.add_or_update(descriptor("cccc", false));
        let peers = cluster.active_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "cccc");
    }

    #[test]
    fn test_load_requires_self_descriptor() {
        let dir = TempDir::new().unwrap();
        let mut info = ClusterInfo::new("missing".to_string());
        info.nodes
            .insert("aaaa".to_string(), descriptor("aaaa", false));
        assert!(Cluster::create(dir.path(), info).is_err());
    }
}
