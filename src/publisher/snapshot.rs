#[cfg(test)] use mockall::automock;
use anyhow::{anyhow, bail};
use tokio::sync::mpsc;

use crate::channel::ChannelId;
use crate::wire::message::Frame;

/// The application's current state for a channel, replayed to every subscriber that logs in.
///
/// This is called on a blocking task, so implementations are free to do blocking I/O or to take
///  locks for the duration of the dump.
#[cfg_attr(test, automock)]
pub trait SnapshotSource: Send + Sync + 'static {
    fn snapshot(&self, channel: &ChannelId, writer: &mut SnapshotWriter) -> anyhow::Result<()>;
}

/// for publishers without application state: every snapshot is empty
pub struct NoSnapshot;

impl SnapshotSource for NoSnapshot {
    fn snapshot(&self, _channel: &ChannelId, _writer: &mut SnapshotWriter) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hands snapshot frames from the blocking snapshot task to the TCP session streaming them
pub struct SnapshotWriter {
    sender: mpsc::Sender<Frame>,
    num_written: usize,
}

impl SnapshotWriter {
    pub(crate) fn new(sender: mpsc::Sender<Frame>) -> SnapshotWriter {
        SnapshotWriter {
            sender,
            num_written: 0,
        }
    }

    /// Blocks while the session is behind. This fails if the session was closed, and a snapshot
    ///  source should give up then.
    pub fn write(&mut self, frame: Frame) -> anyhow::Result<()> {
        if frame.is_control() {
            bail!("control message type {} in snapshot", frame.msg_type());
        }
        self.sender.blocking_send(frame)
            .map_err(|_| anyhow!("snapshot session closed"))?;
        self.num_written += 1;
        Ok(())
    }

    pub fn num_written(&self) -> usize {
        self.num_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame_header::NO_SHARD;
    use crate::wire::message::ControlMessage;

    #[tokio::test]
    async fn test_writer() {
        let (sender, mut receiver) = mpsc::channel(4);

        let handle = tokio::task::spawn_blocking(move || {
            let mut writer = SnapshotWriter::new(sender);
            writer.write(Frame::data(1, NO_SHARD, vec![1u8]).unwrap())?;
            writer.write(Frame::data(2, NO_SHARD, vec![2u8]).unwrap())?;
            assert!(writer.write(Frame::control(&ControlMessage::ResendRequest { seq_no: 1, count: 1 }, 0)).is_err());
            Ok::<_, anyhow::Error>(writer.num_written())
        });

        assert_eq!(receiver.recv().await.unwrap().msg_type(), 1);
        assert_eq!(receiver.recv().await.unwrap().msg_type(), 2);
        assert_eq!(handle.await.unwrap().unwrap(), 2);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_fails_after_session_closed() {
        let (sender, receiver) = mpsc::channel(4);
        drop(receiver);

        let result = tokio::task::spawn_blocking(move || {
            SnapshotWriter::new(sender)
                .write(Frame::data(1, NO_SHARD, vec![1u8]).unwrap())
        }).await.unwrap();
        assert!(result.is_err());
    }
}
