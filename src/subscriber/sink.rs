#[cfg(test)] use mockall::automock;

use crate::channel::ChannelId;
use crate::wire::message::Frame;

/// The application side of a subscriber. All callbacks for a channel are made from that
///  channel's control loop, so they are sequential per channel. They should return quickly:
///  while a callback runs, the link does not process any input.
#[cfg_attr(test, automock)]
pub trait MessageSink: Send + Sync + 'static {
    /// a frame of the snapshot that is sent to the subscriber after login
    fn on_snapshot(&self, channel: &ChannelId, frame: &Frame);

    /// The snapshot is complete, and live delivery resumes at `seq_no`. Everything below it is
    ///  covered by the snapshot.
    fn on_end_of_snapshot(&self, channel: &ChannelId, seq_no: u64);

    /// a live frame, in strictly increasing sequence order without gaps
    fn on_message(&self, channel: &ChannelId, frame: &Frame);
}
