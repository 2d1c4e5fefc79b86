//! Hierarchical namespace served on top of the replicated log.

pub mod operation;
pub mod server;
pub mod state_machine;

pub use operation::{ANY_VERSION, KeeperOp, OpResult};
pub use server::KeeperServer;
pub use state_machine::{KeeperStateMachine, ROOT_PATH, Stat};
