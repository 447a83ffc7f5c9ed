//! Publisher and subscriber talking over 127.0.0.1, either with each other or with a scripted
//!  counterpart standing in for the publisher.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::Level;

use mdlink::channel::{ChannelDescriptor, ChannelId};
use mdlink::config::EngineConfig;
use mdlink::link::LinkState;
use mdlink::publisher::engine::Publisher;
use mdlink::publisher::snapshot::{SnapshotSource, SnapshotWriter};
use mdlink::subscriber::engine::Subscriber;
use mdlink::test_util::{within, CollectingSink};
use mdlink::wire::frame_header::NO_SHARD;
use mdlink::wire::message::{ControlMessage, Frame};
use mdlink::wire::tcp::{read_frame, write_frame};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn local(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

fn descriptor(base_port: u16) -> ChannelDescriptor {
    ChannelDescriptor::new("md1", local(base_port), local(base_port + 1), local(base_port + 2))
}

fn data(seq_no: u64) -> Frame {
    let mut result = Frame::data(1, NO_SHARD, seq_no.to_le_bytes().to_vec()).unwrap();
    result.header.seq_no = seq_no;
    result
}

/// three price levels
struct Levels;

impl SnapshotSource for Levels {
    fn snapshot(&self, _channel: &ChannelId, writer: &mut SnapshotWriter) -> anyhow::Result<()> {
        for level in 0..3u8 {
            writer.write(Frame::data(2, NO_SHARD, vec![level])?)?;
        }
        Ok(())
    }
}

async fn accept_login(listener: &TcpListener, end_of_snapshot: u64) -> TcpStream {
    let (mut stream, _) = within(listener.accept()).await.unwrap();
    let login = within(read_frame(&mut stream)).await.unwrap().unwrap();
    assert!(matches!(login.control_message().unwrap(), Some(ControlMessage::Login { .. })));

    write_frame(&mut stream, &Frame::control(&ControlMessage::Login { username: String::new(), password: String::new() }, 0)).await.unwrap();
    write_frame(&mut stream, &Frame::control(&ControlMessage::EndOfSnapshot { id: ChannelId::new("md1"), seq_no: end_of_snapshot, ok: true }, 0)).await.unwrap();
    stream
}

#[tokio::test]
async fn gap_is_filled_by_a_single_resend_request() {
    let listener = TcpListener::bind(local(19500)).await.unwrap();
    let sender = UdpSocket::bind(local(0)).await.unwrap();
    let resend = UdpSocket::bind(local(19502)).await.unwrap();

    let sink = Arc::new(CollectingSink::default());
    let config = EngineConfig { max_queue_size: 100, re_req_max_gap: 10, ..EngineConfig::default() };
    let subscriber = Subscriber::new(config, sink.clone()).unwrap();
    let link = subscriber.update_link(descriptor(19500)).await;
    subscriber.start().await;

    let _stream = accept_login(&listener, 1).await;
    within(link.wait_for_state(LinkState::Up)).await.unwrap();
    within(sink.wait_for_end_of_snapshot()).await;

    for seq_no in (1..=20).chain(31..=50) {
        sender.send_to(&data(seq_no).to_bytes(), local(19501)).await.unwrap();
    }

    let mut buf = [0u8; 64];
    let (n, from) = within(resend.recv_from(&mut buf)).await.unwrap();
    let request = Frame::decode(&buf[..n]).unwrap();
    assert_eq!(request.control_message().unwrap(), Some(ControlMessage::ResendRequest { seq_no: 21, count: 10 }));

    for seq_no in 21..=30 {
        resend.send_to(&data(seq_no).to_bytes(), from).await.unwrap();
    }

    within(sink.wait_for_messages(50)).await;
    assert_eq!(sink.message_seq_nos(), (1..=50).collect::<Vec<_>>());

    // the re-request timer was disarmed when the gap closed
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(resend.try_recv_from(&mut buf).is_err());
    assert_eq!(sink.message_seq_nos().len(), 50);
    assert_eq!(link.state(), LinkState::Up);
}

#[tokio::test]
async fn snapshot_live_traffic_and_manual_resend() {
    let publisher = Publisher::new(EngineConfig::default(), Arc::new(Levels)).unwrap();
    publisher.update_link(descriptor(19510)).await;
    publisher.start().await;
    let publisher_link = publisher.link(&ChannelId::new("md1")).await.unwrap();
    within(publisher_link.wait_for_state(LinkState::Up)).await.unwrap();

    // published before anyone listens, covered by the snapshot
    for i in 0..2u8 {
        assert_eq!(publisher.publish(Frame::data(1, NO_SHARD, vec![i]).unwrap()).await, 1);
    }

    let sink = Arc::new(CollectingSink::default());
    let subscriber = Subscriber::new(EngineConfig::default(), sink.clone()).unwrap();
    let link = subscriber.update_link(descriptor(19510)).await;
    subscriber.start().await;

    within(link.wait_for_state(LinkState::Up)).await.unwrap();
    within(sink.wait_for_end_of_snapshot()).await;
    assert_eq!(sink.snapshot_count(), 3);
    assert_eq!(sink.end_of_snapshot(), Some(3));

    for i in 2..5u8 {
        publisher.publish(Frame::data(1, NO_SHARD, vec![i]).unwrap()).await;
    }
    within(sink.wait_for_messages(3)).await;
    assert_eq!(sink.message_seq_nos(), vec![3, 4, 5]);
    assert_eq!(sink.messages()[0].body.as_ref(), &[2]);

    // frames from before the login are still retained by the publisher
    let resent = subscriber.resend(&ChannelId::new("md1"), 1, 2).await.unwrap();
    assert_eq!(resent.seq_no(), 1);
    assert_eq!(resent.body.as_ref(), &[0]);

    let status = subscriber.status().await;
    assert!(status.contains("subscriber link md1: Up"));
    assert!(status.contains("Snapshot seqNo 3"));

    subscriber.stop().await;
    within(link.wait_for_state(LinkState::Down)).await.unwrap();
    publisher.stop().await;
    within(publisher_link.wait_for_state(LinkState::Down)).await.unwrap();
}
