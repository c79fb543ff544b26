//! Pending-request table
//!
//! One slot per possible peer, indexed by the initiator's logical address.
//! A slot holds the original request frame while the answer is being
//! produced; an empty slot is the terminal (handled) state. At most one
//! slot may be in the Sent state: only a single downstream query is ever in
//! flight, every other live request queues as Pending.

use std::time::Instant;

use lip_proto::{CecMessage, LogicalAddress, MAX_UPSTREAM_DEVICES};

/// Lifecycle of a buffered request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Buffered, waiting for the in-flight downstream query to finish
    Pending,
    /// Forwarded downstream, waiting for the answer or a timeout
    Sent,
    /// Downstream aborted or the timer expired
    AbortReceived,
    /// Downstream answered; the cache holds the values
    AnswerReceived,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingSlot {
    pub msg: CecMessage,
    pub state: SlotState,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    slots: [Option<PendingSlot>; MAX_UPSTREAM_DEVICES],
}

impl PendingTable {
    pub fn get(&self, addr: LogicalAddress) -> Option<&PendingSlot> {
        self.slots[addr.index()].as_ref()
    }

    pub fn state(&self, addr: LogicalAddress) -> Option<SlotState> {
        self.get(addr).map(|slot| slot.state)
    }

    /// Buffer a request from `addr`, replacing any previous live request
    /// from the same peer
    pub fn insert(&mut self, addr: LogicalAddress, msg: CecMessage, expires_at: Instant) {
        if self.slots[addr.index()].is_some() {
            log::debug!("request from {addr:?} still pending, replacing it");
        }
        self.slots[addr.index()] = Some(PendingSlot {
            msg,
            state: SlotState::Pending,
            expires_at,
        });
    }

    /// Transition a live slot; no-op when the slot is already handled
    pub fn set_state(&mut self, addr: LogicalAddress, state: SlotState) {
        if let Some(slot) = self.slots[addr.index()].as_mut() {
            slot.state = state;
        }
    }

    /// Mark the slot handled
    pub fn complete(&mut self, addr: LogicalAddress) {
        self.slots[addr.index()] = None;
    }

    /// Remove and return a Pending slot's frame and expiry
    pub fn take_if_pending(&mut self, addr: LogicalAddress) -> Option<(CecMessage, Instant)> {
        if self.state(addr) != Some(SlotState::Pending) {
            return None;
        }
        self.slots[addr.index()]
            .take()
            .map(|slot| (slot.msg, slot.expires_at))
    }

    /// Restore a slot's expiry after a re-dispatch re-buffered it
    pub fn set_expiry(&mut self, addr: LogicalAddress, expires_at: Instant) {
        if let Some(slot) = self.slots[addr.index()].as_mut() {
            slot.expires_at = expires_at;
        }
    }

    pub fn any_sent(&self) -> bool {
        self.sent_addr().is_some()
    }

    /// Address of the unique in-flight downstream query, if any
    pub fn sent_addr(&self) -> Option<LogicalAddress> {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.state == SlotState::Sent {
                    debug_assert!(self.slots[index + 1..]
                        .iter()
                        .flatten()
                        .all(|other| other.state != SlotState::Sent));
                    return LogicalAddress::new(index as u8);
                }
            }
        }
        None
    }

    /// Earliest expiry over all Sent slots, the timer deadline
    pub fn earliest_sent_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.state == SlotState::Sent)
            .map(|slot| slot.expires_at)
            .min()
    }
}
