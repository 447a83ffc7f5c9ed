use std::collections::VecDeque;

use crate::wire::message::Frame;

/// The publisher's retained window of sent frames, `tail..head`. Frames are stamped with their
///  sequence number when pushed, and they stay available for resend until an ack tick trims
///  them.
pub struct TxQueue {
    /// sequence number of the next frame to be pushed
    head: u64,
    /// `frames[i]` has sequence number `tail() + i`
    frames: VecDeque<Frame>,
}

impl TxQueue {
    pub fn new(first_seq_no: u64) -> TxQueue {
        TxQueue {
            head: first_seq_no,
            frames: VecDeque::new(),
        }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.head - self.frames.len() as u64
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Stamps the frame with the next sequence number and retains it, returning the stamped
    ///  frame for sending
    pub fn push(&mut self, mut frame: Frame) -> &Frame {
        frame.header.seq_no = self.head;
        self.head += 1;
        self.frames.push_back(frame);

        // just pushed
        &self.frames[self.frames.len() - 1]
    }

    /// Releases everything below `head - max_size`, returning the number of frames released
    pub fn trim(&mut self, max_size: u64) -> usize {
        let mut num_released = 0;
        while self.frames.len() as u64 > max_size {
            self.frames.pop_front();
            num_released += 1;
        }
        num_released
    }

    /// The retained frames in `seq_no..seq_no+count`, clipped to the retained window
    pub fn range(&self, seq_no: u64, count: u32) -> impl Iterator<Item = &Frame> {
        let tail = self.tail();
        let start = seq_no.max(tail);
        let end = seq_no.saturating_add(count as u64).min(self.head);

        let (skip, take) = if start < end {
            ((start - tail) as usize, (end - start) as usize)
        }
        else {
            (0, 0)
        };

        self.frames.iter()
            .skip(skip)
            .take(take)
    }

    pub fn reset(&mut self, first_seq_no: u64) {
        self.head = first_seq_no;
        self.frames.clear();
    }
}
