//! Offline maintenance: backup, restore and re-IP of a node's data
//! directory. All three refuse to touch the directory of a live node,
//! detected by probing its advertised grpc port.

use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checksumfile;
use crate::cluster_info::{cluster_info_exists, Cluster};
use crate::error::{KronosError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Serialize, Deserialize)]
struct BackupArchive {
    files: Vec<BackupFile>,
}

#[derive(Serialize, Deserialize)]
struct BackupFile {
    relative_path: String,
    contents: Vec<u8>,
}

/// `old_grpc_addr=new_raft_addr,new_grpc_addr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReIpMapping {
    pub old_grpc_addr: String,
    pub new_raft_addr: String,
    pub new_grpc_addr: String,
}

impl FromStr for ReIpMapping {
    type Err = KronosError;

    fn from_str(s: &str) -> Result<Self> {
        let parse_err = || {
            KronosError::Config(format!(
                "invalid re-ip mapping {:?}; expected old_grpc=new_raft,new_grpc",
                s
            ))
        };
        let (old_grpc, new) = s.split_once('=').ok_or_else(parse_err)?;
        let (new_raft, new_grpc) = new.split_once(',').ok_or_else(parse_err)?;
        if old_grpc.is_empty() || new_raft.is_empty() || new_grpc.is_empty() {
            return Err(parse_err());
        }
        Ok(Self {
            old_grpc_addr: old_grpc.trim().to_string(),
            new_raft_addr: new_raft.trim().to_string(),
            new_grpc_addr: new_grpc.trim().to_string(),
        })
    }
}

/// Copy the whole data dir (cluster-info file, raft log, snapshots) into a
/// single checksummed archive file.
pub fn backup(data_dir: &Path, file: &Path) -> Result<()> {
    ensure_stopped(data_dir)?;

    let mut files = Vec::new();
    collect_files(data_dir, data_dir, &mut files)?;
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let archive = BackupArchive { files };
    let payload = bincode::serialize(&archive)
        .map_err(|e| KronosError::serialization("serialize backup archive", e))?;
    checksumfile::write(file, &payload)?;
    info!(
        data_dir = %data_dir.display(),
        file = %file.display(),
        files = archive.files.len(),
        "backup written"
    );
    Ok(())
}

/// Inverse of `backup`: the data dir ends up with exactly the archived
/// files, byte for byte.
pub fn restore(data_dir: &Path, file: &Path) -> Result<()> {
    ensure_stopped(data_dir)?;

    let payload = checksumfile::read(file)?;
    let archive: BackupArchive = bincode::deserialize(&payload)
        .map_err(|e| KronosError::serialization("deserialize backup archive", e))?;

    if data_dir.exists() {
        fs::remove_dir_all(data_dir)?;
    }
    fs::create_dir_all(data_dir)?;
    for entry in &archive.files {
        let path = data_dir.join(&entry.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &entry.contents)?;
    }
    info!(
        data_dir = %data_dir.display(),
        files = archive.files.len(),
        "backup restored"
    );
    Ok(())
}

/// Rewrite peer addresses in the cluster-info file. The raft log replays
/// unchanged afterwards since log entries never carry addresses.
pub fn re_ip(data_dir: &Path, mappings: &[ReIpMapping]) -> Result<()> {
    ensure_stopped(data_dir)?;

    let cluster = Cluster::load(data_dir)?;
    let mut unused: Vec<&ReIpMapping> = mappings.iter().collect();
    for desc in cluster.all_nodes() {
        if let Some(pos) = unused
            .iter()
            .position(|m| m.old_grpc_addr == desc.grpc_addr)
        {
            let mapping = unused.remove(pos);
            let mut updated = desc.clone();
            updated.raft_addr = mapping.new_raft_addr.clone();
            updated.grpc_addr = mapping.new_grpc_addr.clone();
            info!(
                node_id = %desc.node_id,
                raft_addr = %updated.raft_addr,
                grpc_addr = %updated.grpc_addr,
                "re-ip: rewrote peer addresses"
            );
            cluster.add_or_update(updated);
        }
    }
    if !unused.is_empty() {
        return Err(KronosError::Config(format!(
            "re-ip mappings matched no member: {:?}",
            unused
                .iter()
                .map(|m| m.old_grpc_addr.as_str())
                .collect::<Vec<_>>()
        )));
    }
    cluster.persist()
}

/// Offline commands must not race a live node. A node that has an identity
/// always has its grpc listener up, so a successful connect means running.
fn ensure_stopped(data_dir: &Path) -> Result<()> {
    if !cluster_info_exists(data_dir) {
        return Ok(());
    }
    let cluster = Cluster::load(data_dir)?;
    let self_id = cluster.self_id();
    let Some(desc) = cluster.descriptor(&self_id) else {
        return Ok(());
    };
    let addrs: Vec<_> = desc
        .grpc_addr
        .to_socket_addrs()
        .map(|it| it.collect())
        .unwrap_or_default();
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok() {
            return Err(KronosError::NodeRunning);
        }
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<BackupFile>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            let relative_path = path
                .strip_prefix(root)
                .map_err(|_| KronosError::Internal {
                    message: format!("path {:?} escapes data dir", path),
                })?
                .to_string_lossy()
                .into_owned();
            out.push(BackupFile {
                relative_path,
                contents: fs::read(&path)?,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_info::{cluster_info_path, ClusterInfo};
    use crate::types::NodeDescriptor;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn seed_data_dir(dir: &Path, grpc_addr: &str) {
        let mut info = ClusterInfo::new("aaaa".to_string());
        info.nodes.insert(
            "aaaa".to_string(),
            NodeDescriptor::new(
                "aaaa".to_string(),
                "127.0.0.1:1".to_string(),
                grpc_addr.to_string(),
            ),
        );
        Cluster::create(dir, info).unwrap();
        fs::write(dir.join("kronos.db"), b"not a real raft log").unwrap();
    }

    #[test]
    fn test_mapping_parse() {
        let m: ReIpMapping = "1.2.3.4:5767=5.6.7.8:5766,5.6.7.8:5767".parse().unwrap();
        assert_eq!(m.old_grpc_addr, "1.2.3.4:5767");
        assert_eq!(m.new_raft_addr, "5.6.7.8:5766");
        assert_eq!(m.new_grpc_addr, "5.6.7.8:5767");
        assert!("nonsense".parse::<ReIpMapping>().is_err());
        assert!("a=b".parse::<ReIpMapping>().is_err());
    }

    #[test]
    fn test_backup_restore_roundtrip_is_byte_identical() {
        let data = TempDir::new().unwrap();
        // Port 1 is never listening.
        seed_data_dir(data.path(), "127.0.0.1:1");
        let info_before = fs::read(cluster_info_path(data.path())).unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join("backup");
        backup(data.path(), &archive).unwrap();

        // Dirty the data dir, then restore.
        fs::write(data.path().join("kronos.db"), b"scribbled over").unwrap();
        fs::write(data.path().join("stray"), b"stray file").unwrap();
        restore(data.path(), &archive).unwrap();

        assert_eq!(
            fs::read(cluster_info_path(data.path())).unwrap(),
            info_before
        );
        assert_eq!(
            fs::read(data.path().join("kronos.db")).unwrap(),
            b"not a real raft log"
        );
        assert!(!data.path().join("stray").exists());
    }

    #[test]
    fn test_backup_refused_while_running() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let data = TempDir::new().unwrap();
        seed_data_dir(data.path(), &addr.to_string());

        let out = TempDir::new().unwrap();
        let result = backup(data.path(), &out.path().join("backup"));
        assert!(matches!(result, Err(KronosError::NodeRunning)));
    }

    #[test]
    fn test_re_ip_rewrites_and_persists() {
        let data = TempDir::new().unwrap();
        seed_data_dir(data.path(), "127.0.0.1:1");

        let mappings = vec![ReIpMapping {
            old_grpc_addr: "127.0.0.1:1".to_string(),
            new_raft_addr: "10.0.0.9:5766".to_string(),
            new_grpc_addr: "10.0.0.9:5767".to_string(),
        }];
        re_ip(data.path(), &mappings).unwrap();

        let cluster = Cluster::load(data.path()).unwrap();
        let desc = cluster.descriptor("aaaa").unwrap();
        assert_eq!(desc.raft_addr, "10.0.0.9:5766");
        assert_eq!(desc.grpc_addr, "10.0.0.9:5767");
    }

    #[test]
    fn test_re_ip_unmatched_mapping_errors() {
        let data = TempDir::new().unwrap();
        seed_data_dir(data.path(), "127.0.0.1:1");

        let mappings = vec![ReIpMapping {
            old_grpc_addr: "192.168.0.1:9999".to_string(),
            new_raft_addr: "10.0.0.9:5766".to_string(),
            new_grpc_addr: "10.0.0.9:5767".to_string(),
        }];
        assert!(re_ip(data.path(), &mappings).is_err());
    }
}
