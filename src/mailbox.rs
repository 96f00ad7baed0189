//! Weft runtime: `mailbox` module.
//!
//! One unbounded FIFO queue per node (and per plain calling thread), drained
//! by exactly one receiver and fed by any number of senders. A mailbox is
//! addressed by a [`MailboxId`] — a small copyable value that can travel
//! inside message payloads and be used to construct alias handles — and
//! resolved through a process-global registry. Sending to a mailbox whose
//! owner is gone is detected and silently dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, RwLock, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::message::Message;

// ── MailboxId ───────────────────────────────────────────────────────────

/// Transferable identity of a mailbox.
///
/// Ids are unique for the lifetime of the process and stay valid (as names)
/// after the mailbox is gone; resolution simply fails then.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MailboxId(u64);

impl MailboxId {
    /// The raw numeric id.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

// ── Registry ────────────────────────────────────────────────────────────

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Process-global map from id to live queue. Entries hold weak references;
/// a dropped mailbox resolves to nothing even before it is unregistered.
static REGISTRY: LazyLock<RwLock<HashMap<MailboxId, Weak<MailboxCore>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn resolve(id: MailboxId) -> Option<Arc<MailboxCore>> {
    REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&id)
        .and_then(Weak::upgrade)
}

/// Deliver a message to the mailbox named by `target`.
///
/// Thread-safe and non-blocking; the queue is unbounded. Returns `false`
/// (and discards the message) when the target is closed, dropped, or was
/// never registered.
pub fn send(target: MailboxId, message: Message) -> bool {
    let Some(core) = resolve(target) else {
        trace!(mailbox = %target, "send to unknown mailbox dropped");
        return false;
    };
    if core.closed.load(Ordering::Acquire) {
        trace!(mailbox = %target, "send to closed mailbox dropped");
        return false;
    }
    let mut queue = core.queue.lock().unwrap_or_else(|e| e.into_inner());
    queue.push_back(message);
    core.available.notify_one();
    true
}

// ── Mailbox ─────────────────────────────────────────────────────────────

struct MailboxCore {
    id: MailboxId,
    queue: Mutex<VecDeque<Message>>,
    available: Condvar,
    closed: AtomicBool,
}

/// The owning side of a queue. Whoever holds the `Mailbox` is the single
/// receiver; dropping it closes the queue and retires the id.
pub struct Mailbox {
    core: Arc<MailboxCore>,
}

impl Mailbox {
    /// Create and register a fresh mailbox.
    #[must_use]
    pub fn new() -> Self {
        let id = MailboxId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let core = Arc::new(MailboxCore {
            id,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        REGISTRY
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::downgrade(&core));
        Mailbox { core }
    }

    /// The transferable identity of this mailbox.
    #[must_use]
    pub fn id(&self) -> MailboxId {
        self.core.id
    }

    /// Dequeue the oldest message without blocking.
    pub fn try_recv(&self) -> Option<Message> {
        let mut queue = self.core.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.pop_front()
    }

    /// Dequeue the oldest message, blocking the calling thread until one
    /// arrives.
    pub fn recv(&self) -> Message {
        let mut queue = self.core.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(message) = queue.pop_front() {
                return message;
            }
            queue = self
                .core
                .available
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`recv`](Self::recv), but give up at `deadline`.
    pub fn recv_deadline(&self, deadline: Instant) -> Option<Message> {
        let mut queue = self.core.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return None;
            }
            let (guard, _) = self
                .core
                .available
                .wait_timeout(queue, timeout)
                .unwrap_or_else(|e| e.into_inner());
            queue = guard;
        }
    }

    /// Reject all future sends. Messages already queued stay receivable.
    pub fn close(&self) {
        self.core.closed.store(true, Ordering::Release);
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
        REGISTRY
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.core.id);
        trace!(mailbox = %self.core.id, "mailbox retired");
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("id", &self.core.id).finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::message::{Command, Message};

    fn command(origin: MailboxId, id: u64) -> Message {
        Message::Command(Command {
            origin,
            id,
            method: "m@0".to_string(),
            payload: Vec::new(),
        })
    }

    fn command_id(message: &Message) -> u64 {
        match message {
            Message::Command(c) => c.id,
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn delivers_in_fifo_order() {
        let mb = Mailbox::new();
        let origin = MailboxId(u64::MAX - 1);
        for id in 0..4 {
            assert!(send(mb.id(), command(origin, id)));
        }
        for id in 0..4 {
            assert_eq!(command_id(&mb.recv()), id);
        }
    }

    #[test]
    fn try_recv_on_empty_returns_none() {
        let mb = Mailbox::new();
        assert!(mb.try_recv().is_none());
    }

    #[test]
    fn recv_blocks_until_a_sender_arrives() {
        let mb = Mailbox::new();
        let id = mb.id();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(send(id, Message::OwnerTerminated));
        });
        assert!(matches!(mb.recv(), Message::OwnerTerminated));
        sender.join().unwrap();
    }

    #[test]
    fn recv_deadline_times_out() {
        let mb = Mailbox::new();
        let deadline = Instant::now() + Duration::from_millis(15);
        assert!(mb.recv_deadline(deadline).is_none());
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn send_to_closed_mailbox_is_dropped() {
        let mb = Mailbox::new();
        mb.close();
        assert!(!send(mb.id(), Message::OwnerTerminated));
        assert!(mb.try_recv().is_none());
    }

    #[test]
    fn send_after_drop_is_dropped() {
        let mb = Mailbox::new();
        let id = mb.id();
        drop(mb);
        assert!(!send(id, Message::OwnerTerminated));
    }

    #[test]
    fn queued_messages_survive_close() {
        let mb = Mailbox::new();
        assert!(send(mb.id(), Message::OwnerTerminated));
        mb.close();
        assert!(matches!(mb.recv(), Message::OwnerTerminated));
    }

    #[test]
    fn ids_are_unique() {
        let a = Mailbox::new();
        let b = Mailbox::new();
        assert_ne!(a.id(), b.id());
    }
}
