//! The znode tree fed by the log.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ApplyError, KeeperError, StorageError};
use crate::message::{LogEntry, Snapshot};
use crate::traits::{ApplyResult, KeeperResult, StateMachine, StorageResult};

use super::operation::{ANY_VERSION, KeeperOp, OpResult};

pub const ROOT_PATH: &str = "/";

/// Node metadata; zxids are log indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Stat {
    pub czxid: u64,
    pub mzxid: u64,
    pub pzxid: u64,
    pub version: i32,
    pub cversion: i32,
    pub num_children: i32,
    pub data_length: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
struct Znode {
    data: Vec<u8>,
    stat: Stat,
    children: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct DataTree {
    nodes: BTreeMap<String, Znode>,
}

impl Default for DataTree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_PATH.to_string(), Znode::default());
        Self { nodes }
    }
}

#[derive(Debug, Encode, Decode)]
struct TreeImage {
    last_applied_index: u64,
    last_applied_term: u64,
    tree: DataTree,
}

/// Checks an absolute path and returns `(parent, name)`; root has no parent.
pub fn split_path(path: &str) -> KeeperResult<Option<(&str, &str)>> {
    if path == ROOT_PATH {
        return Ok(None);
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| KeeperError::BadArguments(format!("path {:?} is not absolute", path)))?;
    if rest.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(KeeperError::BadArguments(format!("invalid path {:?}", path)));
    }
    Ok(match path.rsplit_once('/') {
        Some(("", name)) => Some((ROOT_PATH, name)),
        Some((parent, name)) => Some((parent, name)),
        None => None,
    })
}

fn check_version(path: &str, expected: i32, actual: i32) -> KeeperResult<()> {
    if expected != ANY_VERSION && expected != actual {
        return Err(KeeperError::BadVersion {
            path: path.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

impl DataTree {
    fn node(&self, path: &str) -> KeeperResult<&Znode> {
        self.nodes
            .get(path)
            .ok_or_else(|| KeeperError::NoNode(path.to_string()))
    }

    fn validate(&self, op: &KeeperOp) -> KeeperResult<()> {
        match op {
            KeeperOp::Create { path, .. } => {
                let (parent, _) = split_path(path)?
                    .ok_or_else(|| KeeperError::NodeExists(path.clone()))?;
                if self.nodes.contains_key(path) {
                    return Err(KeeperError::NodeExists(path.clone()));
                }
                self.node(parent)?;
            }
            KeeperOp::Set {
                path,
                expected_version,
                ..
            } => {
                split_path(path)?;
                check_version(path, *expected_version, self.node(path)?.stat.version)?;
            }
            KeeperOp::Delete {
                path,
                expected_version,
            } => {
                if split_path(path)?.is_none() {
                    return Err(KeeperError::BadArguments("cannot delete the root".to_string()));
                }
                let node = self.node(path)?;
                check_version(path, *expected_version, node.stat.version)?;
                if !node.children.is_empty() {
                    return Err(KeeperError::NotEmpty(path.clone()));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: KeeperOp, zxid: u64) -> KeeperResult<OpResult> {
        self.validate(&op)?;
        match op {
            KeeperOp::Create { path, data } => {
                let (parent, name) = split_path(&path)?
                    .ok_or_else(|| KeeperError::NodeExists(path.clone()))?;
                let (parent, name) = (parent.to_string(), name.to_string());

                let parent_node = self
                    .nodes
                    .get_mut(&parent)
                    .ok_or_else(|| KeeperError::NoNode(parent.clone()))?;
                parent_node.children.insert(name);
                parent_node.stat.cversion += 1;
                parent_node.stat.pzxid = zxid;
                parent_node.stat.num_children = parent_node.children.len() as i32;

                let stat = Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    pzxid: zxid,
                    data_length: data.len() as i32,
                    ..Default::default()
                };
                self.nodes.insert(
                    path.clone(),
                    Znode {
                        data,
                        stat,
                        children: BTreeSet::new(),
                    },
                );
                Ok(OpResult::Created(path))
            }
            KeeperOp::Set { path, data, .. } => {
                let node = self
                    .nodes
                    .get_mut(&path)
                    .ok_or_else(|| KeeperError::NoNode(path.clone()))?;
                node.stat.version += 1;
                node.stat.mzxid = zxid;
                node.stat.data_length = data.len() as i32;
                node.data = data;
                Ok(OpResult::Set(node.stat.clone()))
            }
            KeeperOp::Delete { path, .. } => {
                let (parent, name) = split_path(&path)?
                    .ok_or_else(|| KeeperError::BadArguments("cannot delete the root".to_string()))?;
                let (parent, name) = (parent.to_string(), name.to_string());
                self.nodes.remove(&path);
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children.remove(&name);
                    parent_node.stat.cversion += 1;
                    parent_node.stat.pzxid = zxid;
                    parent_node.stat.num_children = parent_node.children.len() as i32;
                }
                Ok(OpResult::Deleted)
            }
        }
    }
}

/// In-memory namespace rebuilt from snapshots and log replay.
#[derive(Debug, Default)]
pub struct KeeperStateMachine {
    tree: RwLock<DataTree>,
    last_applied: RwLock<(u64, u64)>,
}

impl KeeperStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `op` against the current tree without changing it.
    pub fn validate(&self, op: &KeeperOp) -> KeeperResult<()> {
        self.tree.read().validate(op)
    }

    /// Applies the op carried by `entry`, which must be the next index.
    pub fn apply_entry(&self, entry: &LogEntry) -> KeeperResult<OpResult> {
        let mut last_applied = self.last_applied.write();
        let expected = last_applied.0 + 1;
        if entry.index < expected {
            return Err(ApplyError::AlreadyApplied(entry.index).into());
        }
        if entry.index > expected {
            return Err(ApplyError::OutOfOrder {
                index: entry.index,
                expected,
            }
            .into());
        }

        let op = KeeperOp::deserialize(&entry.payload).map_err(|e| ApplyError::InvalidCommand {
            index: entry.index,
            reason: e.to_string(),
        })?;
        debug!("Applying {:?} at index {}", op, entry.index);

        let result = self.tree.write().apply(op, entry.index);
        // A rejected op still consumes its index.
        *last_applied = (entry.index, entry.term);
        result
    }

    pub fn get(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)> {
        split_path(path)?;
        let tree = self.tree.read();
        let node = tree.node(path)?;
        Ok((node.data.clone(), node.stat.clone()))
    }

    pub fn exists(&self, path: &str) -> KeeperResult<Option<Stat>> {
        split_path(path)?;
        Ok(self.tree.read().nodes.get(path).map(|n| n.stat.clone()))
    }

    /// Child names of `path`, sorted.
    pub fn get_children(&self, path: &str) -> KeeperResult<Vec<String>> {
        split_path(path)?;
        let tree = self.tree.read();
        Ok(tree.node(path)?.children.iter().cloned().collect())
    }

    /// Number of nodes including the root.
    pub fn node_count(&self) -> usize {
        self.tree.read().nodes.len()
    }
}

#[async_trait]
impl StateMachine for KeeperStateMachine {
    async fn apply(&self, entry: &LogEntry) -> ApplyResult<()> {
        match self.apply_entry(entry) {
            Ok(_) => Ok(()),
            Err(KeeperError::Apply(e)) => Err(e),
            // validated before it was logged; replay reaches the same outcome
            Err(e) => {
                warn!("Logged op at index {} was rejected: {}", entry.index, e);
                Ok(())
            }
        }
    }

    fn last_applied(&self) -> (u64, u64) {
        *self.last_applied.read()
    }

    async fn create_snapshot(&self) -> StorageResult<Snapshot> {
        let last_applied = self.last_applied.read();
        let image = TreeImage {
            last_applied_index: last_applied.0,
            last_applied_term: last_applied.1,
            tree: self.tree.read().clone(),
        };
        let data = bincode::encode_to_vec(&image, bincode::config::standard())
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(Snapshot {
            last_included_index: image.last_applied_index,
            last_included_term: image.last_applied_term,
            data,
        })
    }

    async fn restore_snapshot(&self, snapshot: &Snapshot) -> ApplyResult<()> {
        let (image, _): (TreeImage, usize) =
            bincode::decode_from_slice(&snapshot.data, bincode::config::standard())
                .map_err(|e| ApplyError::Restore(e.to_string()))?;
        if image.last_applied_index != snapshot.last_included_index {
            return Err(ApplyError::Restore(format!(
                "image at index {} stored as snapshot {}",
                image.last_applied_index, snapshot.last_included_index
            )));
        }

        let nodes = image.tree.nodes.len();
        *self.tree.write() = image.tree;
        *self.last_applied.write() = (image.last_applied_index, image.last_applied_term);
        info!(
            "Restored {} nodes at index {}",
            nodes, snapshot.last_included_index
        );
        Ok(())
    }
}
