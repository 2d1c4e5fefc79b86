use thiserror::Error;

/// Errors surfaced by a single backing disk.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("blob {0} not found")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("operation not supported by disk {disk}: {op}")]
    Unsupported { disk: String, op: &'static str },

    #[error("disk configuration error: {0}")]
    Config(String),
}

impl DiskError {
    pub fn is_not_found(&self) -> bool {
        match self {
            DiskError::NotFound(_) => true,
            DiskError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            DiskError::ObjectStore(object_store::Error::NotFound { .. }) => true,
            _ => false,
        }
    }

    /// Errors worth one immediate re-attempt against the backing store.
    pub fn is_transient(&self) -> bool {
        match self {
            DiskError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            DiskError::ObjectStore(e) => matches!(e, object_store::Error::Generic { .. }),
            _ => false,
        }
    }
}

/// Log and snapshot storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("write of {key} failed: {source}")]
    Write {
        key: String,
        #[source]
        source: DiskError,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("corrupted log: {0}")]
    CorruptLog(String),

    #[error("replay gap: expected first index {expected}, found {found}")]
    ReplayGap { expected: u64, found: u64 },

    #[error("discovery failed on disk {disk}: {source}")]
    Discovery {
        disk: String,
        #[source]
        source: DiskError,
    },

    #[error("append of index {got} does not follow last index {last}")]
    NonContiguousAppend { last: u64, got: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("snapshot {0} failed checksum verification")]
    SnapshotCorrupted(String),

    #[error("log store task is gone")]
    ChannelClosed,

    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("state machine rejected replayed entry: {0}")]
    Replay(#[from] ApplyError),
}

/// Errors of the hierarchical namespace and the command path.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("keeper is not ready to accept commands")]
    NotReady,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),
}

/// State machine apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("command at index {0} already applied")]
    AlreadyApplied(u64),

    #[error("command at index {index} is out of order, expected {expected}")]
    OutOfOrder { index: u64, expected: u64 },

    #[error("invalid command at index {index}: {reason}")]
    InvalidCommand { index: u64, reason: String },

    #[error("snapshot restore failed: {0}")]
    Restore(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
