//! Weft runtime: error types on both sides of a call.
//!
//! Callers only distinguish "success with a decoded value" from "failed
//! with a textual reason"; everything a remote method reports — a returned
//! error, a panic, an argument-decode failure — arrives as
//! [`CallError::Remote`] carrying the text. The remaining [`CallError`]
//! variants are local conditions of the calling side. [`MethodFailure`] is
//! the serving side's half: the failure a dispatch-table handler reports,
//! whose text becomes that response payload.

use std::time::Duration;

use thiserror::Error;

use crate::mailbox::MailboxId;

/// Why a call through a [`Handle`](crate::Handle) or [`crate::client`] did
/// not produce a value.
#[derive(Debug, Error)]
pub enum CallError {
    /// The remote method reported a failure; the message is the failure
    /// text from the responding node.
    #[error("remote method failed: {0}")]
    Remote(String),

    /// The target mailbox is closed or was never registered.
    #[error("target mailbox {0} is closed or unknown")]
    DeadMailbox(MailboxId),

    /// The argument tuple could not be encoded.
    #[error("argument encoding failed: {0}")]
    Encode(postcard::Error),

    /// The reply payload could not be decoded into the expected type.
    #[error("reply decoding failed: {0}")]
    Decode(postcard::Error),

    /// No reply arrived within the allotted time.
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    /// The calling node is draining; outbound calls can no longer complete.
    #[error("node is draining, outbound call abandoned")]
    Draining,
}

/// Why a method invocation produced a failure response. The `Display` text
/// is what travels back as the response payload.
#[derive(Debug, Error)]
pub enum MethodFailure {
    /// The argument payload did not decode into the method's tuple type.
    #[error("argument decode failed: {0}")]
    BadPayload(postcard::Error),
    /// The method itself reported an error.
    #[error("{0}")]
    App(String),
}
