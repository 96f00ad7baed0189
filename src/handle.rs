//! Weft runtime: user-facing node handles and the `spawn` entry point.
//!
//! Spawning returns the owner [`Handle`]; any number of alias handles can
//! be built from the node's [`MailboxId`] and used from any thread. Only
//! dropping the owner tears the worker down: it sends the termination
//! signal and joins the thread, so by the time the drop returns the node is
//! gone and later sends to its mailbox are detected as dead.

use std::panic;
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::client;
use crate::error::CallError;
use crate::mailbox::{self, Mailbox, MailboxId};
use crate::message::Message;
use crate::node;
use crate::service::Service;

/// Construct a service on a fresh worker thread and return its owner
/// handle.
///
/// The constructor runs on the worker thread, so the service may hold
/// state that is built in place. Wiring that needs the mailbox ids of
/// other nodes is usually done afterwards through ordinary methods.
///
/// # Panics
///
/// If the OS refuses to spawn the worker thread.
pub fn spawn<S, C>(ctor: C) -> Handle
where
    S: Service,
    C: FnOnce() -> S + Send + 'static,
{
    let mailbox = Mailbox::new();
    let id = mailbox.id();
    let worker = thread::Builder::new()
        .name(format!("weft-node-{}", id.raw()))
        .spawn(move || node::run_node(mailbox, ctor))
        .unwrap_or_else(|e| panic!("spawning node thread: {e}"));
    debug!(node = %id, "node spawned");
    Handle {
        mailbox: id,
        worker: Some(worker),
    }
}

/// A client's view of one node: a mailbox reference, plus — for the handle
/// returned by [`spawn`] — ownership of the worker thread.
#[derive(Debug)]
pub struct Handle {
    mailbox: MailboxId,
    worker: Option<thread::JoinHandle<()>>,
}

impl Handle {
    /// An alias handle onto an existing node. Carries no teardown
    /// responsibility.
    #[must_use]
    pub fn from_mailbox(mailbox: MailboxId) -> Handle {
        Handle {
            mailbox,
            worker: None,
        }
    }

    /// The underlying mailbox reference.
    #[must_use]
    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    /// Whether dropping this handle tears the node down.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.worker.is_some()
    }

    /// Call `method` with the given argument tuple. See [`client::call`].
    pub fn call<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        client::call(self.mailbox, method, args)
    }

    /// Call `method`, giving up after `timeout`. See
    /// [`client::call_timeout`].
    pub fn call_timeout<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        client::call_timeout(self.mailbox, method, args, timeout)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        mailbox::send(self.mailbox, Message::OwnerTerminated);
        if let Err(payload) = worker.join() {
            // The node aborted (unknown method or another programming
            // error). Surface it, unless we are already unwinding.
            if thread::panicking() {
                debug!(node = %self.mailbox, "node had aborted before teardown");
            } else {
                panic::resume_unwind(payload);
            }
        }
    }
}
