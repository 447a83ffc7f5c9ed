use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::broadcast;
use tracing::info;

use crate::channel::{ChannelDescriptor, ChannelId};
use crate::config::EngineConfig;
use crate::events::{LinkEvent, LinkEventNotifier};
use crate::registry::{Link, LinkRegistry};
use crate::subscriber::link::SubscriberLink;
use crate::subscriber::sink::MessageSink;
use crate::wire::message::Frame;

/// Owns all subscriber links of a process, delivering what they receive to a single sink
pub struct Subscriber {
    config: Arc<EngineConfig>,
    sink: Arc<dyn MessageSink>,
    links: LinkRegistry<SubscriberLink>,
    notifier: Arc<LinkEventNotifier>,
    started: AtomicBool,
}

impl Subscriber {
    pub fn new(config: EngineConfig, sink: Arc<dyn MessageSink>) -> anyhow::Result<Subscriber> {
        config.validate()?;

        Ok(Subscriber {
            config: Arc::new(config),
            sink,
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
    pub async fn update_link(&self, descriptor: ChannelDescriptor) -> Arc<SubscriberLink> {
        let (link, created) = self.links.update_link(Arc::new(descriptor), |descriptor| {
            SubscriberLink::new(descriptor, self.config.clone(), self.sink.clone(), self.notifier.clone())
        }).await;

        if created && self.started.load(Ordering::Acquire) {
            link.up();
        }
        link
    }

    pub async fn link(&self, channel: &ChannelId) -> Option<Arc<SubscriberLink>> {
        self.links.get(channel).await
    }

    pub async fn all_links(&self) -> Vec<Arc<SubscriberLink>> {
        self.links.all().await
    }

    pub async fn start(&self) {
        info!("starting subscriber");
        self.started.store(true, Ordering::Release);
        for link in self.links.all().await {
            link.up();
        }
    }

    pub async fn stop(&self) {
        info!("stopping subscriber");
        self.started.store(false, Ordering::Release);
        for link in self.links.all().await {
            link.down();
        }
    }

    /// Manually requests a range of frames on one link, returning the first frame received
    pub async fn resend(&self, channel: &ChannelId, seq_no: u64, count: u32) -> anyhow::Result<Frame> {
        let link = self.links.get(channel).await
            .ok_or_else(|| anyhow!("no link for channel {}", channel))?;
        link.resend(seq_no, count).await
    }

    /// A human readable report of all links
    pub async fn status(&self) -> String {
        let mut result = String::new();
        for link in self.links.all().await {
            match link.status().await {
                Ok(status) => result.push_str(&status.to_string()),
                Err(e) => result.push_str(&format!("subscriber link {}: status unavailable ({})\n", link.channel(), e)),
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
    use crate::test_util::{within, CollectingSink};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn descriptor(id: &str, base_port: u16) -> ChannelDescriptor {
        let local = |port| SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        ChannelDescriptor::new(id, local(base_port), local(base_port + 1), local(base_port + 2))
    }

    fn subscriber() -> Subscriber {
        Subscriber::new(EngineConfig::default(), Arc::new(CollectingSink::default())).unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let config = EngineConfig { re_req_max_gap: 0, ..EngineConfig::default() };
        assert!(Subscriber::new(config, Arc::new(CollectingSink::default())).is_err());
    }

    #[tokio::test]
    async fn test_update_link() {
        let subscriber = subscriber();
        let link = subscriber.update_link(descriptor("md2", 19400)).await;
        subscriber.update_link(descriptor("md1", 19410)).await;

        // an identical descriptor updates the existing link
        let again = subscriber.update_link(descriptor("md2", 19400)).await;
        assert!(Arc::ptr_eq(&link, &again));

        let channels: Vec<_> = subscriber.all_links().await.iter()
            .map(|l| l.channel().clone())
            .collect();
        assert_eq!(channels, vec![ChannelId::new("md1"), ChannelId::new("md2")]);
        assert_eq!(link.state(), LinkState::Down);

        let status = subscriber.status().await;
        assert!(status.contains("subscriber link md1: Down"));
        assert!(status.contains("not connected"));
    }

    #[tokio::test]
    async fn test_disabled_link_stays_down() {
        let subscriber = subscriber();
        let mut disabled = descriptor("md1", 19420);
        disabled.enabled = false;
        let link = subscriber.update_link(disabled).await;

        subscriber.start().await;
        within(link.wait_for_state(LinkState::Disabled)).await.unwrap();
        assert_eq!(link.status().await.unwrap().endpoints, None);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let subscriber = subscriber();
        let mut events = subscriber.subscribe_events();
        let link = subscriber.update_link(descriptor("md1", 19430)).await;

        // nothing listens, so the link keeps trying
        subscriber.start().await;
        within(link.wait_for_state(LinkState::ReconnectPending)).await.unwrap();
        subscriber.stop().await;
        within(link.wait_for_state(LinkState::Down)).await.unwrap();

        let first = within(events.recv()).await.unwrap();
        assert_eq!(first.channel(), &ChannelId::new("md1"));
    }

    #[tokio::test]
    async fn test_resend_unknown_channel() {
        let subscriber = subscriber();
        let result = subscriber.resend(&ChannelId::new("md9"), 1, 1).await;
        assert!(result.unwrap_err().to_string().contains("no link"));
    }
}
