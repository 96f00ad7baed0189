//! Weft runtime: correlation table for outstanding outbound requests.
//!
//! When a task on a node makes an outbound call it claims a slot here; the
//! slot index is the request id on the wire, and the slot's condition is
//! what the task suspends on until the event loop deposits the reply. The
//! table grows by appending and never shrinks while the node lives — the
//! suspended caller holds the index as a public id, and a slot whose waiter
//! timed out stays busy so a late reply is absorbed instead of being
//! mistaken for a protocol violation.

use std::sync::Mutex;

use crate::message::Response;
use crate::scheduler::{Condition, SchedulerHandle};

struct Slot {
    condition: Condition,
    busy: bool,
    reply: Option<Response>,
}

/// Index-addressed table of outstanding outbound requests, one per node.
///
/// Only ever touched from the owning node's tasks, so the interior lock is
/// uncontended; it exists to let the suspended caller and the event loop
/// share the table soundly.
pub struct PendingTable {
    sched: SchedulerHandle,
    slots: Mutex<Vec<Slot>>,
}

impl PendingTable {
    /// Create an empty table backed by the node's scheduler.
    #[must_use]
    pub fn new(sched: SchedulerHandle) -> Self {
        PendingTable {
            sched,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Claim the smallest free slot, marking it busy. Returns the slot
    /// index — the request id to put on the wire — and the condition the
    /// caller suspends on.
    pub fn allocate(&self) -> (u64, Condition) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let index = match slots.iter().position(|slot| !slot.busy) {
            Some(free) => free,
            None => {
                slots.push(Slot {
                    condition: self.sched.condition(),
                    busy: false,
                    reply: None,
                });
                slots.len() - 1
            }
        };
        let slot = &mut slots[index];
        slot.busy = true;
        slot.reply = None;
        (index as u64, slot.condition.clone())
    }

    /// Deposit a reply and wake the waiting caller. Must only be called by
    /// the node's event loop.
    ///
    /// # Panics
    ///
    /// A reply whose id does not name a busy slot — never issued, already
    /// answered, or double-delivered — is a protocol violation and aborts
    /// the node.
    pub fn complete(&self, response: Response) {
        let id = response.id;
        let condition = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = usize::try_from(id)
                .ok()
                .and_then(|index| slots.get_mut(index))
                .unwrap_or_else(|| {
                    panic!("protocol violation: reply for request id {id} this node never issued")
                });
            assert!(
                slot.busy,
                "protocol violation: reply for idle request id {id}"
            );
            assert!(
                slot.reply.is_none(),
                "protocol violation: duplicate reply for request id {id}"
            );
            slot.reply = Some(response);
            slot.condition.clone()
        };
        condition.notify();
    }

    /// Consume the deposited reply and free the slot. Called by the waiting
    /// task immediately after its wait was notified.
    ///
    /// # Panics
    ///
    /// If the reply cell is empty — the wait cannot have been notified.
    pub fn take(&self, id: u64) -> Response {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = usize::try_from(id)
            .ok()
            .and_then(|index| slots.get_mut(index))
            .unwrap_or_else(|| panic!("take of unknown request id {id}"));
        slot.busy = false;
        slot.reply
            .take()
            .unwrap_or_else(|| panic!("protocol violation: empty reply cell for request id {id}"))
    }

    /// Free a slot whose command was never delivered (dead target).
    pub fn release(&self, id: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = usize::try_from(id).ok().and_then(|index| slots.get_mut(index)) {
            slot.busy = false;
            slot.reply = None;
        }
    }

    /// Number of slots currently busy.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().filter(|slot| slot.busy).count()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    use super::*;
    use crate::scheduler::{Scheduler, WaitOutcome};

    fn response(id: u64) -> Response {
        Response {
            success: true,
            id,
            payload: vec![1],
        }
    }

    #[test]
    fn allocates_smallest_free_index() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        sched.run(move || {
            let table = PendingTable::new(handle.clone());
            assert_eq!(table.allocate().0, 0);
            assert_eq!(table.allocate().0, 1);
            assert_eq!(table.allocate().0, 2);
            table.release(1);
            assert_eq!(table.allocate().0, 1);
            assert_eq!(table.allocate().0, 3);
            assert_eq!(table.busy_count(), 4);
        });
    }

    #[test]
    fn complete_wakes_the_waiting_task() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        sched.run(move || {
            let table = Arc::new(PendingTable::new(handle.clone()));
            let (id, condition) = table.allocate();
            let waiter_table = Arc::clone(&table);
            handle.spawn(move || {
                assert_eq!(condition.wait(), WaitOutcome::Notified);
                let reply = waiter_table.take(id);
                assert_eq!(reply.payload, vec![1]);
                assert_eq!(waiter_table.busy_count(), 0);
            });
            handle.yield_now();
            table.complete(response(id));
        });
    }

    #[test]
    fn reply_for_idle_slot_is_fatal() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let caught = catch_unwind(AssertUnwindSafe(move || {
            sched.run(move || {
                let table = PendingTable::new(handle.clone());
                table.complete(response(0));
            });
        }));
        assert!(caught.is_err());
    }

    #[test]
    fn duplicate_reply_is_fatal() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        let caught = catch_unwind(AssertUnwindSafe(move || {
            sched.run(move || {
                let table = PendingTable::new(handle.clone());
                let (id, _condition) = table.allocate();
                table.complete(response(id));
                table.complete(response(id));
            });
        }));
        assert!(caught.is_err());
    }

    #[test]
    fn released_slot_forgets_its_reply() {
        let sched = Scheduler::new();
        let handle = sched.handle();
        sched.run(move || {
            let table = PendingTable::new(handle.clone());
            let (id, _condition) = table.allocate();
            table.complete(response(id));
            table.release(id);
            let (again, _condition) = table.allocate();
            assert_eq!(again, id);
        });
    }
}
