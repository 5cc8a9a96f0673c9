//! Network Module
//!
//! Rank-to-rank request plumbing over a pluggable [`Transport`].
//!
//! ## Architecture
//! - `Dispatcher`: the only sender of requests; synchronous RPCs run on the
//!   caller thread, queued work (migrations, barriers, file transfer) on one
//!   worker thread
//! - `Listener`: the only receiver of requests; one thread executes them
//!   one at a time against this rank's databases
//! - `MemFabric`: in-process transport connecting ranks that run as threads

pub mod dispatcher;
mod fabric;
mod listener;
mod transport;

pub use dispatcher::{Dispatcher, PendingCommands};
pub use fabric::{MemEndpoint, MemFabric};
pub use listener::{Listener, Registry};
pub use transport::{Channel, Transport};
