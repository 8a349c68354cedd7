//! Fair selection among outbound message sessions.
//!
//! One connection carries many concurrent outgoing messages; the
//! [`Scheduler`] hands out chunks round-robin so a short message never
//! starves behind a long transfer, and the [`StreamContext`] tracks which
//! message currently owns the wire. Selection happens only on
//! write-completion boundaries, so chunks from different messages never
//! interleave at the byte level.

use std::collections::HashMap;

use crate::egress::EgressBuffer;
use crate::transfer::{OutgoingId, OutgoingMessage};

/// Insertion-ordered set of outgoing messages with a round-robin cursor.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queue: Vec<OutgoingId>,
    cursor: usize,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler::default()
    }

    pub(crate) fn queue(&mut self, id: OutgoingId) {
        if !self.queue.contains(&id) {
            self.queue.push(id);
        }
    }

    pub(crate) fn erase(&mut self, id: OutgoingId) {
        if let Some(at) = self.queue.iter().position(|&queued| queued == id) {
            self.queue.remove(at);
            if at < self.cursor {
                self.cursor -= 1;
            }
            if self.queue.is_empty() {
                self.cursor = 0;
            } else {
                self.cursor %= self.queue.len();
            }
        }
    }

    /// The next runnable message, advancing the cursor past it so every
    /// runnable message gets a turn per round.
    pub(crate) fn thread(&mut self, outgoing: &HashMap<OutgoingId, OutgoingMessage>) -> Option<OutgoingId> {
        let n = self.queue.len();

        for step in 0..n {
            let at = (self.cursor + step) % n;
            let id = self.queue[at];

            if outgoing.get(&id).is_some_and(OutgoingMessage::runnable) {
                self.cursor = (at + 1) % n;
                return Some(id);
            }
        }

        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The outgoing message currently writing to the connection.
///
/// `select` is invoked from the write-completion path. Switching messages
/// emits the old message's continuation delimiter and the new message's
/// header block back to back, so the pair reaches the wire atomically.
#[derive(Debug, Default)]
pub(crate) struct StreamContext {
    current: Option<OutgoingId>,
}

impl StreamContext {
    pub(crate) fn new() -> StreamContext {
        StreamContext::default()
    }

    pub(crate) fn current(&self) -> Option<OutgoingId> {
        self.current
    }

    /// Pick the next runnable message and emit one chunk from it. Returns
    /// the id of a message that finished during this turn, for index
    /// cleanup by the caller.
    ///
    /// When nothing is runnable the current message is left in place: the
    /// next wake-up may continue it without paying for a context switch.
    pub(crate) fn select(
        &mut self,
        scheduler: &mut Scheduler,
        outgoing: &mut HashMap<OutgoingId, OutgoingMessage>,
        egress: &mut EgressBuffer,
    ) -> Option<OutgoingId> {
        let next = scheduler.thread(outgoing)?;

        if self.current != Some(next) {
            if let Some(previous) = self.current.take() {
                if let Some(message) = outgoing.get_mut(&previous) {
                    message.end(egress, scheduler);
                }
            }

            self.current = Some(next);
            if let Some(message) = outgoing.get_mut(&next) {
                message.start(egress);
            }
        }

        let mut finished = None;
        if let Some(message) = outgoing.get_mut(&next) {
            message.run(egress);

            if message.transfer_finished() {
                message.end(egress, scheduler);
                self.current = None;
                finished = Some(next);
            }
        }

        finished
    }

    /// Flush the current message's delimiter and release the wire; called
    /// before an out-of-band frame is sent and when a session closes.
    pub(crate) fn clear(
        &mut self,
        scheduler: &mut Scheduler,
        outgoing: &mut HashMap<OutgoingId, OutgoingMessage>,
        egress: &mut EgressBuffer,
    ) -> Option<OutgoingId> {
        let current = self.current.take()?;

        let message = outgoing.get_mut(&current)?;
        message.end(egress, scheduler);

        message.transfer_finished().then_some(current)
    }
}
