//! Weft runtime: message records exchanged between nodes.
//!
//! Everything that travels through a mailbox is a [`Message`]: an inbound
//! [`Command`], a [`Response`] correlated back to an earlier command, or the
//! owner's termination signal. Argument and return payloads are opaque byte
//! sequences here — only the binding layer ([`crate::codec`],
//! [`crate::service`]) knows their encoding.

use crate::mailbox::MailboxId;

/// Request id marking a caller that will block-receive its single reply
/// instead of demultiplexing by id (a caller with no scheduler on its
/// thread).
pub const SENTINEL: u64 = u64::MAX;

// ── Command ─────────────────────────────────────────────────────────────

/// An inbound request. Immutable once sent.
#[derive(Debug, Clone)]
pub struct Command {
    /// Mailbox of the sender; the reply is delivered here.
    pub origin: MailboxId,
    /// Request id. Either a pending-slot index on the sending node, or
    /// [`SENTINEL`] for a block-receiving caller.
    pub id: u64,
    /// Method identifier, unique per operation of the service interface.
    pub method: String,
    /// Encoded argument tuple.
    pub payload: Vec<u8>,
}

// ── Response ────────────────────────────────────────────────────────────

/// A reply to a [`Command`].
#[derive(Debug, Clone)]
pub struct Response {
    /// Whether the method ran to completion.
    pub success: bool,
    /// Copied from the originating command.
    pub id: u64,
    /// Encoded return value on success, human-readable error text otherwise.
    pub payload: Vec<u8>,
}

// ── Message ─────────────────────────────────────────────────────────────

/// The tagged union of everything a mailbox can carry.
#[derive(Debug, Clone)]
pub enum Message {
    /// A request for this node to service.
    Command(Command),
    /// A reply to a request this node (or caller thread) sent earlier.
    Response(Response),
    /// The owning handle was finalized; the node should drain and exit.
    OwnerTerminated,
}
