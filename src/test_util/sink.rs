use std::sync::Mutex;

use crate::channel::ChannelId;
use crate::subscriber::sink::MessageSink;
use crate::test_util::eventually;
use crate::wire::message::Frame;

#[derive(Default)]
struct Collected {
    snapshot: Vec<(ChannelId, Frame)>,
    end_of_snapshot: Option<u64>,
    messages: Vec<(ChannelId, Frame)>,
}

/// A [MessageSink] that keeps everything delivered to it
#[derive(Default)]
pub struct CollectingSink {
    collected: Mutex<Collected>,
}

impl CollectingSink {
    pub fn snapshot_count(&self) -> usize {
        self.collected.lock().unwrap().snapshot.len()
    }

    /// the sequence number of the most recent end of snapshot
    pub fn end_of_snapshot(&self) -> Option<u64> {
        self.collected.lock().unwrap().end_of_snapshot
    }

    pub fn messages(&self) -> Vec<Frame> {
        self.collected.lock().unwrap().messages.iter()
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn message_seq_nos(&self) -> Vec<u64> {
        self.collected.lock().unwrap().messages.iter()
            .map(|(_, frame)| frame.seq_no())
            .collect()
    }

    pub async fn wait_for_messages(&self, n: usize) {
        eventually(|| self.collected.lock().unwrap().messages.len() >= n).await
    }

    pub async fn wait_for_end_of_snapshot(&self) {
        eventually(|| self.end_of_snapshot().is_some()).await
    }
}

impl MessageSink for CollectingSink {
    fn on_snapshot(&self, channel: &ChannelId, frame: &Frame) {
        self.collected.lock().unwrap().snapshot.push((channel.clone(), frame.clone()));
    }

    fn on_end_of_snapshot(&self, _channel: &ChannelId, seq_no: u64) {
        self.collected.lock().unwrap().end_of_snapshot = Some(seq_no);
    }

    fn on_message(&self, channel: &ChannelId, frame: &Frame) {
        self.collected.lock().unwrap().messages.push((channel.clone(), frame.clone()));
    }
}
