use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// One committed record of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            term,
            payload: payload.into(),
        }
    }
}

/// Point-in-time image of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}
