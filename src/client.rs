//! Weft runtime: the caller-side code path.
//!
//! Every typed call funnels through here. The stub picks its strategy by
//! thread identity: on a node's task thread it claims a pending slot, puts
//! the slot index on the wire, and suspends on the slot's condition so the
//! node keeps servicing other calls; on a plain thread (a test's main
//! thread, say) it sends the [`SENTINEL`] id and block-receives the single
//! reply on a per-thread scratch mailbox. Both paths are safe to use
//! against owner and alias handles alike.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::codec;
use crate::error::CallError;
use crate::mailbox::{self, Mailbox, MailboxId};
use crate::message::{Command, Message, Response, SENTINEL};
use crate::node::NodeContext;
use crate::scheduler::WaitOutcome;

thread_local! {
    /// Reply mailbox for plain (non-node) calling threads, created on the
    /// thread's first call and retired when the thread exits.
    static CALLER_MAILBOX: RefCell<Option<Mailbox>> = const { RefCell::new(None) };
}

// ── Typed surface ───────────────────────────────────────────────────────

/// Call `method` on the node behind `target`, encoding `args` and decoding
/// the reply.
///
/// `args` is the method's argument tuple: `&()` for arity 0, `&(a,)` for
/// arity 1, and so on.
pub fn call<A, R>(target: MailboxId, method: &str, args: &A) -> Result<R, CallError>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let payload = codec::encode(args).map_err(CallError::Encode)?;
    let response = call_raw(target, method, payload, None)?;
    decode_reply(response)
}

/// Like [`call`], but give up after `timeout`.
///
/// On a node task the pending slot is deliberately left busy so a late
/// reply is absorbed; on a plain thread a one-shot reply mailbox is used so
/// a late reply lands in a retired queue. Either way the target node is
/// unaffected and later calls behave normally.
pub fn call_timeout<A, R>(
    target: MailboxId,
    method: &str,
    args: &A,
    timeout: Duration,
) -> Result<R, CallError>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let payload = codec::encode(args).map_err(CallError::Encode)?;
    let response = call_raw(target, method, payload, Some(timeout))?;
    decode_reply(response)
}

fn decode_reply<R: DeserializeOwned>(response: Response) -> Result<R, CallError> {
    if response.success {
        codec::decode(&response.payload).map_err(CallError::Decode)
    } else {
        Err(CallError::Remote(
            String::from_utf8_lossy(&response.payload).into_owned(),
        ))
    }
}

// ── Raw call paths ──────────────────────────────────────────────────────

/// Send an already-encoded command and wait for its reply.
pub fn call_raw(
    target: MailboxId,
    method: &str,
    payload: Vec<u8>,
    timeout: Option<Duration>,
) -> Result<Response, CallError> {
    match NodeContext::current() {
        Some(ctx) => call_from_node(&ctx, target, method, payload, timeout),
        None => call_from_plain_thread(target, method, payload, timeout),
    }
}

/// Re-entrant path: the caller is a task on some node's scheduler.
fn call_from_node(
    ctx: &NodeContext,
    target: MailboxId,
    method: &str,
    payload: Vec<u8>,
    timeout: Option<Duration>,
) -> Result<Response, CallError> {
    if ctx.sched.is_poisoned() {
        return Err(CallError::Draining);
    }
    let (id, condition) = ctx.pending.allocate();
    trace!(node = %ctx.mailbox_id, %target, method, id, "outbound call");
    let command = Command {
        origin: ctx.mailbox_id,
        id,
        method: method.to_owned(),
        payload,
    };
    if !mailbox::send(target, Message::Command(command)) {
        ctx.pending.release(id);
        return Err(CallError::DeadMailbox(target));
    }
    let outcome = match timeout {
        None => condition.wait(),
        Some(timeout) => condition.wait_timeout(timeout),
    };
    match outcome {
        WaitOutcome::Notified => Ok(ctx.pending.take(id)),
        // The slot stays busy: an out-of-order reply may still arrive.
        WaitOutcome::TimedOut => Err(CallError::TimedOut(timeout.unwrap_or_default())),
        WaitOutcome::Poisoned => Err(CallError::Draining),
    }
}

/// Blocking path: the caller is a plain thread with no scheduler.
fn call_from_plain_thread(
    target: MailboxId,
    method: &str,
    payload: Vec<u8>,
    timeout: Option<Duration>,
) -> Result<Response, CallError> {
    match timeout {
        None => CALLER_MAILBOX.with(|cell| {
            let mut slot = cell.borrow_mut();
            let origin = slot.get_or_insert_with(Mailbox::new);
            send_sentinel(origin, target, method, payload)?;
            Ok(expect_response(origin.recv()))
        }),
        Some(timeout) => {
            // One-shot origin so a late reply lands in a retired queue
            // instead of desynchronizing the thread's scratch mailbox.
            let origin = Mailbox::new();
            send_sentinel(&origin, target, method, payload)?;
            match origin.recv_deadline(Instant::now() + timeout) {
                Some(message) => Ok(expect_response(message)),
                None => Err(CallError::TimedOut(timeout)),
            }
        }
    }
}

fn send_sentinel(
    origin: &Mailbox,
    target: MailboxId,
    method: &str,
    payload: Vec<u8>,
) -> Result<(), CallError> {
    trace!(origin = %origin.id(), %target, method, "blocking call");
    let command = Command {
        origin: origin.id(),
        id: SENTINEL,
        method: method.to_owned(),
        payload,
    };
    if mailbox::send(target, Message::Command(command)) {
        Ok(())
    } else {
        Err(CallError::DeadMailbox(target))
    }
}

/// A blocking caller sees exactly one message per call: the response. The
/// id is not inspected — nothing else can be in flight on this mailbox.
fn expect_response(message: Message) -> Response {
    match message {
        Message::Response(response) => response,
        other => panic!("caller mailbox received a non-response message: {other:?}"),
    }
}
