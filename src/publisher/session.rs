//! One accepted TCP connection of a publisher link: login, snapshot, end of snapshot. Sessions
//!  report to the link's control loop, and a failing session affects only its own connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channel::ChannelDescriptor;
use crate::config::EngineConfig;
use crate::link::status::TcpState;
use crate::publisher::link::{PubRx, PubTask};
use crate::publisher::snapshot::{SnapshotSource, SnapshotWriter};
use crate::publisher::tx::{PubTx, TxTask};
use crate::runtime::TaskQueue;
use crate::wire::message::{ControlMessage, Frame};
use crate::wire::tcp::{read_frame, write_frame};

pub type ConnId = u64;

/// frames buffered between the blocking snapshot task and the session writing them
const SNAPSHOT_BUFFER: usize = 1024;

pub struct SessionContext {
    pub descriptor: Arc<ChannelDescriptor>,
    pub config: Arc<EngineConfig>,
    pub snapshot_source: Arc<dyn SnapshotSource>,
    pub control: TaskQueue<PubRx>,
    pub tx: TaskQueue<PubTx>,
    pub generation: u64,
    pub conn_id: ConnId,
    pub peer: SocketAddr,
}

impl SessionContext {
    fn report_state(&self, state: TcpState) {
        self.control.run(PubTask::SessionState {
            generation: self.generation,
            conn_id: self.conn_id,
            state,
        });
    }
}

pub async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(ctx: SessionContext, mut stream: S) {
    let result = do_session(&ctx, &mut stream).await;

    ctx.control.run(PubTask::SessionClosed {
        generation: ctx.generation,
        conn_id: ctx.conn_id,
        result: result.map_err(|e| e.to_string()),
    });
}

/// returns whether the snapshot was complete
async fn do_session<S: AsyncRead + AsyncWrite + Unpin>(ctx: &SessionContext, stream: &mut S) -> anyhow::Result<bool> {
    let login = match timeout(ctx.config.login_timeout, read_frame(stream)).await {
        Err(_) => bail!("no login within {:?}", ctx.config.login_timeout),
        Ok(read) => match read? {
            Some(frame) => frame,
            None => bail!("connection closed before login"),
        },
    };

    let username = match login.control_message()? {
        Some(ControlMessage::Login { username, password }) => {
            if !ctx.descriptor.credentials_match(&username, &password) {
                bail!("invalid credentials for user '{}'", username);
            }
            username
        }
        _ => bail!("expected login, received message type {}", login.msg_type()),
    };
    debug!("{:?}: user '{}' logged in", ctx.peer, username);

    ctx.report_state(TcpState::Sending);
    write_frame(stream, &Frame::control(&ControlMessage::Login { username, password: String::new() }, 0)).await?;

    // live traffic from this sequence number on is not covered by the snapshot
    let seq_no = ctx.tx.invoke(TxTask::Head).await?;

    let ok = stream_snapshot(ctx, stream).await?;

    let end_of_snapshot = ControlMessage::EndOfSnapshot {
        id: ctx.descriptor.id.clone(),
        seq_no,
        ok,
    };
    write_frame(stream, &Frame::control(&end_of_snapshot, 0)).await?;
    debug!("{:?}: snapshot complete, live traffic starts at #{}", ctx.peer, seq_no);

    ctx.report_state(TcpState::Disconnect);
    stream.shutdown().await?;
    Ok(ok)
}

async fn stream_snapshot<S: AsyncWrite + Unpin>(ctx: &SessionContext, stream: &mut S) -> anyhow::Result<bool> {
    let (sender, mut receiver) = mpsc::channel(SNAPSHOT_BUFFER);

    let source = ctx.snapshot_source.clone();
    let channel = ctx.descriptor.id.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let mut writer = SnapshotWriter::new(sender);
        source.snapshot(&channel, &mut writer)
            .map(|_| writer.num_written())
    });

    while let Some(frame) = receiver.recv().await {
        write_frame(stream, &frame).await?;
    }

    match handle.await {
        Ok(Ok(num_frames)) => {
            debug!("{:?}: sent {} snapshot frames", ctx.peer, num_frames);
            Ok(true)
        }
        Ok(Err(e)) => {
            warn!("{:?}: snapshot failed: {}", ctx.peer, e);
            Ok(false)
        }
        Err(e) => {
            warn!("{:?}: snapshot task failed: {}", ctx.peer, e);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::publisher::snapshot::MockSnapshotSource;
    use crate::runtime::{task_queue, TaskReceiver};
    use crate::wire::frame_header::NO_SHARD;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::runtime::Builder;

    fn descriptor() -> Arc<ChannelDescriptor> {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000);
        Arc::new(ChannelDescriptor::new("md1", addr, addr, addr).with_credentials("user", "secret"))
    }

    fn snapshot_of(n: u8) -> MockSnapshotSource {
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot()
            .returning(move |_, writer| {
                for i in 0..n {
                    writer.write(Frame::data(1, NO_SHARD, vec![i]).unwrap())?;
                }
                Ok(())
            });
        source
    }

    /// answers 'Head' requests with a fixed sequence number
    fn spawn_tx(mut tasks: TaskReceiver<PubTx>, head: u64) {
        tokio::spawn(async move {
            while let Some(task) = tasks.next().await {
                if let TxTask::Head(reply) = task {
                    let _ = reply.send(head);
                }
            }
        });
    }

    fn start_session(source: MockSnapshotSource) -> (DuplexStream, TaskReceiver<PubRx>) {
        let (control, control_tasks) = task_queue::<PubRx>();
        let (tx, tx_tasks) = task_queue::<PubTx>();
        spawn_tx(tx_tasks, 17);

        let ctx = SessionContext {
            descriptor: descriptor(),
            config: Arc::new(EngineConfig::default()),
            snapshot_source: Arc::new(source),
            control,
            tx,
            generation: 3,
            conn_id: 5,
            peer: SocketAddr::from(([127, 0, 0, 1], 40000)),
        };

        let (client, server) = duplex(64 * 1024);
        tokio::spawn(run_session(ctx, server));
        (client, control_tasks)
    }

    async fn login(client: &mut DuplexStream, password: &str) {
        let login = Frame::control(&ControlMessage::Login { username: "user".to_string(), password: password.to_string() }, 0);
        write_frame(client, &login).await.unwrap();
    }

    async fn next_closed(tasks: &mut TaskReceiver<PubRx>) -> Result<bool, String> {
        loop {
            match tasks.next().await.unwrap() {
                PubTask::SessionClosed { generation, conn_id, result } => {
                    assert_eq!((generation, conn_id), (3, 5));
                    return result;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_login_and_snapshot() {
        let (mut client, mut tasks) = start_session(snapshot_of(3));
        login(&mut client, "secret").await;

        let ack = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(ack.control_message().unwrap(), Some(ControlMessage::Login { username: "user".to_string(), password: String::new() }));

        for i in 0..3u8 {
            let frame = read_frame(&mut client).await.unwrap().unwrap();
            assert_eq!(frame.body.as_ref(), &[i]);
        }

        let end = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(end.control_message().unwrap(), Some(ControlMessage::EndOfSnapshot { id: ChannelId::new("md1"), seq_no: 17, ok: true }));
        assert!(read_frame(&mut client).await.unwrap().is_none());

        assert_eq!(next_closed(&mut tasks).await, Ok(true));
    }

    #[tokio::test]
    async fn test_snapshot_failure() {
        let mut source = MockSnapshotSource::new();
        source.expect_snapshot()
            .returning(|_, writer| {
                writer.write(Frame::data(1, NO_SHARD, vec![1u8]).unwrap())?;
                anyhow::bail!("application state unavailable")
            });

        let (mut client, mut tasks) = start_session(source);
        login(&mut client, "secret").await;

        read_frame(&mut client).await.unwrap().unwrap();
        read_frame(&mut client).await.unwrap().unwrap();
        let end = read_frame(&mut client).await.unwrap().unwrap();
        assert!(matches!(end.control_message().unwrap(), Some(ControlMessage::EndOfSnapshot { seq_no: 17, ok: false, .. })));

        assert_eq!(next_closed(&mut tasks).await, Ok(false));
    }

    #[tokio::test]
    async fn test_invalid_credentials() {
        let (mut client, mut tasks) = start_session(MockSnapshotSource::new());
        login(&mut client, "wrong").await;

        assert!(next_closed(&mut tasks).await.is_err());
        // dropped without an acknowledgement
        assert!(read_frame(&mut client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unexpected_first_message() {
        let (mut client, mut tasks) = start_session(MockSnapshotSource::new());
        write_frame(&mut client, &Frame::data(1, NO_SHARD, vec![1u8]).unwrap()).await.unwrap();

        assert!(next_closed(&mut tasks).await.is_err());
    }

    #[test]
    fn test_login_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let start = tokio::time::Instant::now();
            let (_client, mut tasks) = start_session(MockSnapshotSource::new());

            let result = next_closed(&mut tasks).await;
            assert!(result.unwrap_err().contains("no login"));
            assert!(start.elapsed() >= Duration::from_secs(10));
        });
    }
}
