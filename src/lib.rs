//! redis-cluster-router is a slot-routing client for Redis Cluster.
//!
//! The key space of a cluster is partitioned into 16384 hash slots spread
//! over the nodes. This crate computes the slot for each command's key,
//! dispatches the command to the node currently owning that slot, and
//! transparently follows the `MOVED`/`ASK` redirections servers emit while
//! slots migrate, including the `ASKING` handshake and topology refresh on
//! persistent relocations.
//!
//! Two frontends share the routing core:
//!
//! * [`Cluster`] is asynchronous; commands run as tasks on an event reactor
//!   supplied through an [`Adapter`], with either an awaitable interface
//!   ([`Cluster::route_command`]) or callbacks ([`Cluster::command_argv`]).
//! * [`ClusterConnection`] is synchronous and single-threaded, driving the
//!   same redirect loop over blocking sockets.
//!
//! # Example
//! ```rust,no_run
//! use redis_cluster_router::{cmd, ClusterClient, NodeAddr};
//!
//! let client = ClusterClient::new(NodeAddr::new("127.0.0.1", 7000));
//! let connection = client.get_connection().unwrap();
//!
//! let reply = connection
//!     .req_command(b"test", cmd("SET").arg("test").arg("test_data"))
//!     .unwrap();
//! ```

#![deny(non_camel_case_types)]

#[macro_use]
mod macros;

pub mod client;
pub mod cluster;
pub mod cluster_async;
pub mod cmd;
pub mod connection;
pub mod parser;
pub mod slot;
pub(crate) mod topology;
pub mod types;

pub use crate::client::{ClusterClient, ClusterParams, RetryParams};
pub use crate::cluster::ClusterConnection;
pub use crate::cluster_async::{Adapter, Cluster, TokioAdapter};
pub use crate::cmd::{cmd, pack_command, Cmd, ToArg};
pub use crate::connection::{Connection, NodeAddr};
pub use crate::parser::{parse_reply, Parser, ValueCodec};
pub use crate::slot::{hash_slot, SLOT_COUNT};
pub use crate::types::{Action, ErrorKind, RouterError, RouterResult, Stage, Value};
