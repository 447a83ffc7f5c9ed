use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::channel::{ChannelDescriptor, ChannelId};

/// The operator-facing surface of a link, common to publisher and subscriber
pub trait Link: Send + Sync + 'static {
    fn channel(&self) -> &ChannelId;

    /// Hands the link a new descriptor. An identical descriptor is a no-op, a changed one
    ///  makes a running link reconnect.
    fn update(&self, descriptor: Arc<ChannelDescriptor>);

    fn up(&self);

    fn down(&self);
}

/// An engine's links by channel id
pub struct LinkRegistry<L: Link> {
    links: RwLock<FxHashMap<ChannelId, Arc<L>>>,
}

impl<L: Link> Default for LinkRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Link> LinkRegistry<L> {
    pub fn new() -> LinkRegistry<L> {
        LinkRegistry {
            links: Default::default(),
        }
    }

    /// Creates the link for a channel on first reference and updates it otherwise. The returned
    ///  flag is `true` if the link was created.
    pub async fn update_link(&self, descriptor: Arc<ChannelDescriptor>, create: impl FnOnce(Arc<ChannelDescriptor>) -> L) -> (Arc<L>, bool) {
        let mut links = self.links.write().await;

        if let Some(link) = links.get(&descriptor.id) {
            link.update(descriptor);
            return (link.clone(), false);
        }

        debug!("creating link for channel {}", descriptor.id);
        let link = Arc::new(create(descriptor.clone()));
        links.insert(descriptor.id.clone(), link.clone());
        (link, true)
    }

    pub async fn get(&self, channel: &ChannelId) -> Option<Arc<L>> {
        self.links.read().await
            .get(channel)
            .cloned()
    }

    /// all links, ordered by channel id
    pub async fn all(&self) -> Vec<Arc<L>> {
        let mut result: Vec<Arc<L>> = self.links.read().await
            .values()
            .cloned()
            .collect();
        result.sort_by(|a, b| a.channel().cmp(b.channel()));
        result
    }

    /// Visits all links in no particular order while holding the read lock. `f` must not
    ///  block.
    pub async fn for_each(&self, mut f: impl FnMut(&L)) {
        for link in self.links.read().await.values() {
            f(link.as_ref());
        }
    }
}
