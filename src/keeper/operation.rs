//! Keeper mutations as they are written to the log.

use anyhow::Result;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Matches any version in `Set` and `Delete`.
pub const ANY_VERSION: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum KeeperOp {
    /// Creates `path`; the parent must exist.
    Create { path: String, data: Vec<u8> },
    /// Replaces the data of `path` if its version matches.
    Set {
        path: String,
        data: Vec<u8>,
        expected_version: i32,
    },
    /// Removes a childless `path` if its version matches.
    Delete { path: String, expected_version: i32 },
}

impl KeeperOp {
    pub fn path(&self) -> &str {
        match self {
            KeeperOp::Create { path, .. }
            | KeeperOp::Set { path, .. }
            | KeeperOp::Delete { path, .. } => path,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard();
        let (op, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize keeper op: {}", e);
            e
        })?;
        Ok(op)
    }
}

/// What a successfully applied mutation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Created(String),
    Set(super::state_machine::Stat),
    Deleted,
}
