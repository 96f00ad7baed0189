//! In-process harness for driving meshes of message-passing service nodes
//! from test code.
//!
//! Each [`spawn`]ed node is one worker thread running a cooperative
//! scheduler, a mailbox, and a correlation table for its outbound calls.
//! Calls between nodes are ordinary typed method calls dispatched through
//! an opaque message layer — no sockets — and a node keeps servicing
//! inbound calls while one of its methods is suspended awaiting an
//! outbound reply, so cyclic topologies (A calls B calls A) complete
//! instead of deadlocking. Tests drive the mesh from plain threads through
//! the same [`Handle`] surface.
//!
//! # Example
//!
//! ```
//! use weft::{spawn, DispatchTable, Service};
//!
//! struct Adder;
//!
//! impl Service for Adder {
//!     fn dispatch_table() -> DispatchTable<Self> {
//!         DispatchTable::new().on("add@2", |_: &Adder, (a, b): (u32, u32)| a + b)
//!     }
//! }
//!
//! let node = spawn(|| Adder);
//! let sum: u32 = node.call("add@2", &(2u32, 3u32)).unwrap();
//! assert_eq!(sum, 5);
//! // Dropping the owner handle tears the node down.
//! ```
//!
//! # Architecture
//!
//! ```text
//! Layer 0: message, codec, error          (records and encoding)
//! Layer 1: mailbox                        (queues + global id registry)
//! Layer 2: scheduler, pending             (tasks, conditions, correlation)
//! Layer 3: node, service                  (event loop, dispatch tables)
//! Layer 4: client, handle                 (stubs, spawn, ownership)
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod handle;
pub mod mailbox;
pub mod message;
mod node;
pub mod pending;
pub mod scheduler;
pub mod service;

pub use error::{CallError, MethodFailure};
pub use handle::{spawn, Handle};
pub use mailbox::MailboxId;
pub use message::{Command, Message, Response, SENTINEL};
pub use service::{DispatchTable, Service};
