use std::sync::Arc;

use tokio::sync::watch;

use crate::channel::ChannelId;
use crate::events::{EngineKind, LinkEvent, LinkEventNotifier, Severity};
use crate::link::{FsmAction, LinkFsm, LinkState};

/// Owned by a link's control loop: the state machine plus the reporting of its transitions,
///  both as events and as a state value other roles can observe without going through the
///  control loop.
pub struct LinkControl {
    engine: EngineKind,
    channel: ChannelId,
    fsm: LinkFsm,
    state: watch::Sender<LinkState>,
    notifier: Arc<LinkEventNotifier>,
}

impl LinkControl {
    pub fn new(engine: EngineKind, channel: ChannelId, enabled: bool, notifier: Arc<LinkEventNotifier>) -> (LinkControl, watch::Receiver<LinkState>) {
        let fsm = LinkFsm::new(enabled);
        let (state, state_receiver) = watch::channel(fsm.state());

        (
            LinkControl {
                engine,
                channel,
                fsm,
                state,
                notifier,
            },
            state_receiver,
        )
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn state(&self) -> LinkState {
        self.fsm.state()
    }

    pub fn reconnects(&self) -> u32 {
        self.fsm.reconnects()
    }

    pub fn is_secondary(&self) -> bool {
        self.fsm.is_secondary()
    }

    /// Feeds an input into the state machine, reporting a resulting state change
    pub fn drive(&mut self, input: impl FnOnce(&mut LinkFsm) -> FsmAction) -> FsmAction {
        let old_state = self.fsm.state();
        let action = input(&mut self.fsm);
        let new_state = self.fsm.state();

        if old_state != new_state {
            self.notifier.emit(LinkEvent::state_changed(self.engine, &self.channel, old_state, new_state, self.fsm.reconnects()));
            self.state.send_replace(new_state);
        }
        action
    }

    pub fn alert(&self, severity: Severity, message: impl Into<String>) {
        self.notifier.emit(LinkEvent::alert(self.engine, &self.channel, severity, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StateChangedData;

    #[tokio::test]
    async fn test_drive_reports_changes() {
        let notifier = Arc::new(LinkEventNotifier::new());
        let mut events = notifier.subscribe();
        let (mut control, state) = LinkControl::new(EngineKind::Publisher, ChannelId::new("md1"), true, notifier);

        assert_eq!(control.drive(|fsm| fsm.up()), FsmAction::Connect);
        assert_eq!(*state.borrow(), LinkState::Connecting);

        // no change, no event
        assert_eq!(control.drive(|fsm| fsm.up()), FsmAction::None);
        control.drive(|fsm| fsm.connected());
        assert_eq!(*state.borrow(), LinkState::Up);

        let first = events.recv().await.unwrap();
        assert_eq!(first, LinkEvent::StateChanged(StateChangedData {
            engine: EngineKind::Publisher,
            channel: ChannelId::new("md1"),
            old_state: LinkState::Down,
            new_state: LinkState::Connecting,
            reconnects: 0,
        }));
        let second = events.recv().await.unwrap();
        assert!(matches!(second, LinkEvent::StateChanged(StateChangedData { old_state: LinkState::Connecting, new_state: LinkState::Up, .. })));
        assert!(events.try_recv().is_err());
    }
}
