use std::fmt::{Display, Formatter};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelId;
use crate::link::LinkState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Publisher,
    Subscriber,
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Publisher => f.write_str("publisher"),
            EngineKind::Subscriber => f.write_str("subscriber"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Everything a link reports to operators. Failures are handled inside the link (reconnect,
///  disable), and this is the only way they become visible outside of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged(StateChangedData),
    Alert(AlertData),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChangedData {
    pub engine: EngineKind,
    pub channel: ChannelId,
    pub old_state: LinkState,
    pub new_state: LinkState,
    pub reconnects: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertData {
    pub engine: EngineKind,
    pub channel: ChannelId,
    pub severity: Severity,
    pub message: String,
}

impl LinkEvent {
    pub fn state_changed(engine: EngineKind, channel: &ChannelId, old_state: LinkState, new_state: LinkState, reconnects: u32) -> LinkEvent {
        LinkEvent::StateChanged(StateChangedData {
            engine,
            channel: channel.clone(),
            old_state,
            new_state,
            reconnects,
        })
    }

    pub fn alert(engine: EngineKind, channel: &ChannelId, severity: Severity, message: impl Into<String>) -> LinkEvent {
        LinkEvent::Alert(AlertData {
            engine,
            channel: channel.clone(),
            severity,
            message: message.into(),
        })
    }

    pub fn channel(&self) -> &ChannelId {
        match self {
            LinkEvent::StateChanged(data) => &data.channel,
            LinkEvent::Alert(data) => &data.channel,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            LinkEvent::StateChanged(_) => Severity::Info,
            LinkEvent::Alert(data) => data.severity,
        }
    }

    fn log(&self) {
        match self {
            LinkEvent::StateChanged(data) => {
                debug!(engine = %data.engine, channel = %data.channel, reconnects = data.reconnects, "link state {:?} -> {:?}", data.old_state, data.new_state);
            }
            LinkEvent::Alert(data) => match data.severity {
                Severity::Info => info!(engine = %data.engine, channel = %data.channel, "{}", data.message),
                Severity::Warning => warn!(engine = %data.engine, channel = %data.channel, "{}", data.message),
                Severity::Error => error!(engine = %data.engine, channel = %data.channel, "{}", data.message),
            },
        }
    }
}

/// Logs link events and publishes them to subscribers
pub struct LinkEventNotifier {
    sender: broadcast::Sender<LinkEvent>,
}

impl Default for LinkEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkEventNotifier {
    pub fn new() -> LinkEventNotifier {
        let (sender, _) = broadcast::channel(1024);

        LinkEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: LinkEvent) {
        event.log();
        let _ = self.sender.send(event);
    }
}
