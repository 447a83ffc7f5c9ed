use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use tokio::sync::oneshot;
use tracing::trace;

use crate::queue::gap::Gap;
use crate::wire::message::Frame;

/// Identifies one caller's request, so that it can withdraw it without touching a newer one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket(u64);

struct Pending {
    ticket: Ticket,
    gap: Gap,
    reply: oneshot::Sender<Frame>,
}

/// The slot for an operator-triggered resend. It is shared between the operator waiting for the
///  reply and the UDP receive task, which hands over the first resent frame in the requested
///  range instead of queueing it.
#[derive(Default)]
pub struct ManualResend {
    pending: Mutex<Option<Pending>>,
    next_ticket: AtomicU64,
}

impl ManualResend {
    fn slot(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn install(&self, gap: Gap) -> anyhow::Result<(Ticket, oneshot::Receiver<Frame>)> {
        let mut slot = self.slot();
        if let Some(pending) = slot.as_ref() {
            // a caller that gave up leaves its slot behind
            if !pending.reply.is_closed() {
                bail!("a manual resend for {} is already outstanding", pending.gap);
            }
        }

        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (reply, receiver) = oneshot::channel();
        *slot = Some(Pending { ticket, gap, reply });
        Ok((ticket, receiver))
    }

    /// Hands the frame to a waiting caller if it is in the requested range, returning `true` if
    ///  it did
    pub fn offer(&self, frame: &Frame) -> bool {
        let mut slot = self.slot();

        let in_range = matches!(slot.as_ref(), Some(pending) if pending.gap.contains(frame.seq_no()));
        if !in_range {
            return false;
        }

        match slot.take() {
            Some(pending) => {
                trace!("manual resend: received #{}", frame.seq_no());
                let _ = pending.reply.send(frame.clone());
                true
            }
            None => false,
        }
    }

    /// Removes a request whose caller gave up, unless another request replaced it already
    pub fn withdraw(&self, ticket: Ticket) {
        let mut slot = self.slot();
        if matches!(slot.as_ref(), Some(pending) if pending.ticket == ticket) {
            *slot = None;
        }
    }

    pub fn clear(&self) {
        self.slot().take();
    }
}
