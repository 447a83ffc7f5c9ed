//! Sequence-indexed windows of frames: the publisher's retained queue for resends, and the
//!  subscriber's gap-aware receive queue.

pub mod gap;
pub mod rx_queue;
pub mod tx_queue;
