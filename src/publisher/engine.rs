use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelDescriptor, ChannelId};
use crate::config::EngineConfig;
use crate::events::{LinkEvent, LinkEventNotifier};
use crate::publisher::link::PublisherLink;
use crate::publisher::snapshot::SnapshotSource;
use crate::registry::{Link, LinkRegistry};
use crate::wire::message::{ControlType, Frame};

/// Owns all publisher links of a process and fans application messages out to them
pub struct Publisher {
    config: Arc<EngineConfig>,
    snapshot_source: Arc<dyn SnapshotSource>,
    links: LinkRegistry<PublisherLink>,
    notifier: Arc<LinkEventNotifier>,
    started: AtomicBool,
}

impl Publisher {
    pub fn new(config: EngineConfig, snapshot_source: Arc<dyn SnapshotSource>) -> anyhow::Result<Publisher> {
        config.validate()?;

        Ok(Publisher {
            config: Arc::new(config),
            snapshot_source,
            links: LinkRegistry::new(),
            notifier: Arc::new(LinkEventNotifier::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates the link for a channel, or updates it if it exists. A link created after the
    ///  engine was started is brought up right away.
    pub async fn update_link(&self, descriptor: ChannelDescriptor) -> Arc<PublisherLink> {
        let (link, created) = self.links.update_link(Arc::new(descriptor), |descriptor| {
            PublisherLink::new(descriptor, self.config.clone(), self.snapshot_source.clone(), self.notifier.clone())
        }).await;

        if created && self.started.load(Ordering::Acquire) {
            link.up();
        }
        link
    }

    pub async fn link(&self, channel: &ChannelId) -> Option<Arc<PublisherLink>> {
        self.links.get(channel).await
    }

    pub async fn all_links(&self) -> Vec<Arc<PublisherLink>> {
        self.links.all().await
    }

    pub async fn start(&self) {
        info!("starting publisher");
        self.started.store(true, Ordering::Release);
        for link in self.links.all().await {
            link.up();
        }
    }

    pub async fn stop(&self) {
        info!("stopping publisher");
        self.started.store(false, Ordering::Release);
        for link in self.links.all().await {
            link.down();
        }
    }

    /// Fans a frame out to all links that are up, returning the number of links it was handed
    ///  to. Each link stamps the frame with its own sequence number.
    pub async fn publish(&self, frame: Frame) -> usize {
        if frame.is_control() {
            if frame.msg_type() == u8::from(ControlType::Wake) {
                trace!("wake-up");
            }
            else {
                warn!("control message type {} can not be published - dropping", frame.msg_type());
            }
            return 0;
        }

        let mut num_links = 0;
        self.links.for_each(|link| {
            if link.send(frame.clone()) {
                num_links += 1;
            }
        }).await;
        num_links
    }

    /// Publishes frames until the sending side of `frames` is closed
    pub async fn run_ingest(&self, mut frames: mpsc::Receiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            self.publish(frame).await;
        }
        debug!("ingest channel closed");
    }

    /// A human readable report of all links
    pub async fn status(&self) -> String {
        let mut result = String::new();
        for link in self.links.all().await {
            match link.status().await {
                Ok(status) => result.push_str(&status.to_string()),
                Err(e) => result.push_str(&format!("publisher link {}: status unavailable ({})\n", link.channel(), e)),
            }
        }
        result
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use crate::publisher::snapshot::NoSnapshot;
    use crate::wire::frame_header::NO_SHARD;
    use crate::wire::message::ControlMessage;
    use bytes::Bytes;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    fn descriptor(id: &str, base_port: u16) -> ChannelDescriptor {
        let local = |port| SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        ChannelDescriptor::new(id, local(base_port), local(base_port + 1), local(base_port + 2))
    }

    fn publisher() -> Publisher {
        Publisher::new(EngineConfig::default(), Arc::new(NoSnapshot)).unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let config = EngineConfig { max_queue_size: 0, ..EngineConfig::default() };
        assert!(Publisher::new(config, Arc::new(NoSnapshot)).is_err());
    }

    #[tokio::test]
    async fn test_publish_to_up_links() {
        let publisher = publisher();
        let receiver = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 19201)).await.unwrap();

        let link = publisher.update_link(descriptor("md1", 19200)).await;
        publisher.update_link(descriptor("md2", 19210)).await;
        assert_eq!(publisher.publish(Frame::data(1, NO_SHARD, vec![1u8]).unwrap()).await, 0);

        publisher.start().await;
        timeout(Duration::from_secs(5), link.wait_for_state(LinkState::Up)).await.unwrap().unwrap();
        let other = publisher.link(&ChannelId::new("md2")).await.unwrap();
        timeout(Duration::from_secs(5), other.wait_for_state(LinkState::Up)).await.unwrap().unwrap();

        assert_eq!(publisher.publish(Frame::data(1, NO_SHARD, vec![7u8]).unwrap()).await, 2);

        let mut buf = vec![0u8; 1024];
        loop {
            let (n, _) = timeout(Duration::from_secs(5), receiver.recv_from(&mut buf)).await.unwrap().unwrap();
            let frame = Frame::decode(&buf[..n]).unwrap();
            if frame.is_control() {
                // heartbeat
                continue;
            }
            assert_eq!(frame.seq_no(), 1);
            assert_eq!(frame.body, Bytes::from(vec![7u8]));
            break;
        }

        let status = publisher.status().await;
        assert!(status.contains("publisher link md1: Up"));
        assert!(status.contains("publisher link md2: Up"));
        assert!(status.find("md1").unwrap() < status.find("md2").unwrap());
    }

    #[tokio::test]
    async fn test_control_frames_are_not_published() {
        let publisher = publisher();
        let request = Frame::control(&ControlMessage::ResendRequest { seq_no: 1, count: 1 }, 0);
        assert_eq!(publisher.publish(request).await, 0);
    }

    #[tokio::test]
    async fn test_link_created_after_start_comes_up() {
        let publisher = publisher();
        publisher.start().await;

        let link = publisher.update_link(descriptor("md1", 19220)).await;
        timeout(Duration::from_secs(5), link.wait_for_state(LinkState::Up)).await.unwrap().unwrap();

        publisher.stop().await;
        timeout(Duration::from_secs(5), link.wait_for_state(LinkState::Down)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_ingest() {
        let publisher = Arc::new(publisher());
        let (sender, receiver) = mpsc::channel(16);

        let ingest = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.run_ingest(receiver).await }
        });

        sender.send(Frame::data(1, NO_SHARD, vec![1u8]).unwrap()).await.unwrap();
        drop(sender);
        timeout(Duration::from_secs(5), ingest).await.unwrap().unwrap();
    }
}
