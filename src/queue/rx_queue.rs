use std::collections::BTreeMap;

use tracing::trace;

use crate::queue::gap::{Gap, GapChange};
use crate::wire::message::Frame;

/// The outcome of feeding a frame into the receive queue
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RxInsert {
    /// frames that became deliverable, in strictly increasing sequence order
    pub delivered: Vec<Frame>,
    pub gap_change: Option<GapChange>,
}

/// The subscriber's receive window. Out-of-order arrivals are retained until the frames before
///  them have arrived, and the first missing range is reported as the current gap.
///
/// While a snapshot is being received, the queue is 'queuing': it buffers frames without
///  delivering them or tracking gaps, because the sequence number at which live delivery must
///  resume is only known at the end of the snapshot.
pub struct RxQueue {
    /// the next sequence number to deliver - meaningless while queuing
    head: u64,
    /// exclusive upper bound of sequence numbers known to exist, either because a frame was
    ///  received or because a heartbeat announced them
    high_water_mark: u64,
    pending: BTreeMap<u64, Frame>,
    queuing: bool,
}

impl Default for RxQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RxQueue {
    pub fn new() -> RxQueue {
        RxQueue {
            head: 0,
            high_water_mark: 0,
            pending: Default::default(),
            queuing: true,
        }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn is_queuing(&self) -> bool {
        self.queuing
    }

    /// number of frames held back
    pub fn count(&self) -> usize {
        self.pending.len()
    }

    /// span of the window, including missing frames
    pub fn length(&self) -> u64 {
        if self.queuing {
            return match (self.pending.first_key_value(), self.pending.last_key_value()) {
                (Some((&first, _)), Some((&last, _))) => last - first + 1,
                _ => 0,
            };
        }
        self.high_water_mark.saturating_sub(self.head)
    }

    /// the first missing range after `head`
    pub fn gap(&self) -> Gap {
        if self.queuing {
            return Gap::NONE;
        }
        match self.pending.first_key_value() {
            Some((&first, _)) => Gap::between(self.head, first),
            None => Gap::between(self.head, self.high_water_mark),
        }
    }

    /// Discards everything and starts buffering for a new snapshot handoff
    pub fn start_queuing(&mut self) {
        self.head = 0;
        self.high_water_mark = 0;
        self.pending.clear();
        self.queuing = true;
    }

    /// Ends the snapshot handoff: frames below `seq_no` are covered by the snapshot and dropped,
    ///  and delivery resumes at `seq_no`
    pub fn stop_queuing(&mut self, seq_no: u64) -> RxInsert {
        let discarded = self.pending.len();
        self.pending = self.pending.split_off(&seq_no);
        trace!("stop queuing at #{}, {} buffered frames covered by snapshot", seq_no, discarded - self.pending.len());

        self.queuing = false;
        self.head = seq_no;
        self.high_water_mark = self.high_water_mark.max(seq_no);

        let delivered = self.deliver_contiguous();
        RxInsert {
            delivered,
            gap_change: Self::change(Gap::NONE, self.gap()),
        }
    }

    pub fn insert(&mut self, frame: Frame) -> RxInsert {
        let seq_no = frame.seq_no();

        if self.queuing {
            self.high_water_mark = self.high_water_mark.max(seq_no.saturating_add(1));
            self.pending.entry(seq_no).or_insert(frame);
            return RxInsert::default();
        }

        if seq_no < self.head || self.pending.contains_key(&seq_no) {
            trace!("duplicate frame #{} - dropping", seq_no);
            return RxInsert::default();
        }

        let prev = self.gap();
        self.high_water_mark = self.high_water_mark.max(seq_no.saturating_add(1));
        self.pending.insert(seq_no, frame);

        let delivered = self.deliver_contiguous();
        RxInsert {
            delivered,
            gap_change: Self::change(prev, self.gap()),
        }
    }

    /// Raises the high-water mark without a frame, e.g. from a heartbeat announcing the sender's
    ///  next sequence number. This turns loss at the end of the stream into a gap.
    pub fn raise_high_water_mark(&mut self, seq_no_excl: u64) -> Option<GapChange> {
        if self.queuing {
            return None;
        }

        let prev = self.gap();
        self.high_water_mark = self.high_water_mark.max(seq_no_excl);
        Self::change(prev, self.gap())
    }

    fn deliver_contiguous(&mut self) -> Vec<Frame> {
        let mut result = Vec::new();
        while let Some(frame) = self.pending.remove(&self.head) {
            result.push(frame);
            self.head += 1;
        }
        result
    }

    fn change(prev: Gap, now: Gap) -> Option<GapChange> {
        if prev == now {
            None
        }
        else {
            Some(GapChange { prev, now })
        }
    }
}
