//! Weft runtime: the worker thread behind every node.
//!
//! A node is one OS thread running a cooperative [`Scheduler`]: the entry
//! task is the event loop below, and every inbound command is dispatched as
//! its own task so a method that suspends on an outbound call never stops
//! the node from servicing further calls (re-entrancy). The node's pending
//! table, scheduler handle, and mailbox id are stashed in a thread-local on
//! the node thread and on every task thread, so the client stubs in
//! [`crate::client`] can tell a node task from a plain caller without any
//! of this appearing in the public API.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::mailbox::{self, Mailbox, MailboxId};
use crate::message::{Command, Message, Response};
use crate::pending::PendingTable;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::service::{DispatchTable, Service};

// ── Node context ────────────────────────────────────────────────────────

/// Everything a client stub needs from the node it runs on.
pub(crate) struct NodeContext {
    pub(crate) mailbox_id: MailboxId,
    pub(crate) pending: PendingTable,
    pub(crate) sched: SchedulerHandle,
}

thread_local! {
    static NODE_CONTEXT: RefCell<Option<Arc<NodeContext>>> = const { RefCell::new(None) };
}

impl NodeContext {
    /// The context of the node this thread belongs to, if any.
    pub(crate) fn current() -> Option<Arc<NodeContext>> {
        NODE_CONTEXT.with(|c| c.borrow().clone())
    }

    fn install(ctx: Arc<NodeContext>) {
        NODE_CONTEXT.with(|c| *c.borrow_mut() = Some(ctx));
    }
}

/// Spawn a scheduler task that carries the node context onto its thread.
fn spawn_node_task(ctx: &Arc<NodeContext>, f: impl FnOnce() + Send + 'static) {
    let carried = Arc::clone(ctx);
    ctx.sched.spawn(move || {
        NodeContext::install(Arc::clone(&carried));
        f();
    });
}

// ── Worker thread body ──────────────────────────────────────────────────

/// Runs on the freshly spawned worker thread: construct the service, wire
/// up the scheduler and pending table, and serve until the owner terminates
/// the node.
pub(crate) fn run_node<S: Service>(mailbox: Mailbox, ctor: impl FnOnce() -> S) {
    let node = mailbox.id();
    let mailbox = Arc::new(mailbox);
    let _retire = RetireGuard {
        mailbox: Arc::clone(&mailbox),
        node,
    };
    let service = Arc::new(ctor());
    let table = Arc::new(S::dispatch_table());
    let scheduler = Scheduler::new();
    let ctx = Arc::new(NodeContext {
        mailbox_id: node,
        pending: PendingTable::new(scheduler.handle()),
        sched: scheduler.handle(),
    });
    debug!(node = %node, "node started");

    let event_loop = EventLoop {
        ctx: Arc::clone(&ctx),
        mailbox,
        service,
        table,
    };
    let entry_ctx = Arc::clone(&ctx);
    scheduler.run(move || {
        NodeContext::install(entry_ctx);
        event_loop.run();
    });
}

/// Closes the mailbox when the worker exits — normally or by a node abort —
/// and answers any commands that never reached the event loop, so their
/// callers are not left blocked.
struct RetireGuard {
    mailbox: Arc<Mailbox>,
    node: MailboxId,
}

impl Drop for RetireGuard {
    fn drop(&mut self) {
        self.mailbox.close();
        while let Some(message) = self.mailbox.try_recv() {
            if let Message::Command(command) = message {
                let _ = mailbox::send(
                    command.origin,
                    Message::Response(Response {
                        success: false,
                        id: command.id,
                        payload: b"node terminated".to_vec(),
                    }),
                );
            }
        }
        debug!(node = %self.node, "node stopped");
    }
}

// ── Event loop ──────────────────────────────────────────────────────────

struct EventLoop<S: Service> {
    ctx: Arc<NodeContext>,
    mailbox: Arc<Mailbox>,
    service: Arc<S>,
    table: Arc<DispatchTable<S>>,
}

impl<S: Service> EventLoop<S> {
    /// Body of the entry task: route one message per iteration.
    fn run(self) {
        loop {
            let Some(message) = self.next_message() else {
                // Node abort in a dispatch task; stop routing.
                return;
            };
            match message {
                Message::OwnerTerminated => {
                    debug!(node = %self.ctx.mailbox_id, "owner terminated, draining");
                    self.ctx.sched.poison();
                    return;
                }
                Message::Response(response) => {
                    trace!(node = %self.ctx.mailbox_id, id = response.id, "reply received");
                    self.ctx.pending.complete(response);
                }
                Message::Command(command) => self.spawn_dispatch(command),
            }
        }
    }

    /// Receive the next message without starving the other tasks: yield
    /// while any of them is runnable, and block the thread only until the
    /// earliest timed wait would expire. Returns `None` once the scheduler
    /// is poisoned out from under us (a dispatch task aborted the node).
    /// Poisoning needs a running task, so it cannot happen while this task
    /// is blocked inside a receive.
    fn next_message(&self) -> Option<Message> {
        loop {
            if self.ctx.sched.is_poisoned() {
                return None;
            }
            if let Some(message) = self.mailbox.try_recv() {
                return Some(message);
            }
            self.ctx.sched.expire_timers();
            if self.ctx.sched.has_runnable() {
                self.ctx.sched.yield_now();
                continue;
            }
            match self.ctx.sched.earliest_deadline() {
                Some(deadline) => {
                    if let Some(message) = self.mailbox.recv_deadline(deadline) {
                        return Some(message);
                    }
                    // Deadline passed; loop around to expire the timer.
                }
                None => return Some(self.mailbox.recv()),
            }
        }
    }

    fn spawn_dispatch(&self, command: Command) {
        trace!(
            node = %self.ctx.mailbox_id,
            method = %command.method,
            id = command.id,
            "command received"
        );
        let service = Arc::clone(&self.service);
        let table = Arc::clone(&self.table);
        let node = self.ctx.mailbox_id;
        spawn_node_task(&self.ctx, move || {
            dispatch(node, &*service, &*table, &command);
        });
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────────

/// Service one inbound command: resolve the method, invoke it, and reply to
/// the origin. Runs as an ordinary scheduler task, so a method body that
/// performs outbound calls simply suspends here while the event loop keeps
/// routing.
fn dispatch<S: Service>(
    node: MailboxId,
    service: &S,
    table: &DispatchTable<S>,
    command: &Command,
) {
    let Some(handler) = table.handler(&command.method) else {
        // Unblock the caller before aborting the node.
        let _ = mailbox::send(
            command.origin,
            Message::Response(Response {
                success: false,
                id: command.id,
                payload: format!("unknown method {:?}", command.method).into_bytes(),
            }),
        );
        panic!(
            "unknown method {:?} on node {node}: client and server dispatch tables disagree",
            command.method
        );
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(service, &command.payload)));
    let response = match outcome {
        Ok(Ok(payload)) => Response {
            success: true,
            id: command.id,
            payload,
        },
        Ok(Err(failure)) => Response {
            success: false,
            id: command.id,
            payload: failure.to_string().into_bytes(),
        },
        Err(payload) => Response {
            success: false,
            id: command.id,
            payload: panic_text(payload.as_ref()).into_bytes(),
        },
    };
    if !mailbox::send(command.origin, Message::Response(response)) {
        trace!(node = %node, origin = %command.origin, "reply dropped, caller mailbox is gone");
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "method panicked".to_owned()
    }
}
