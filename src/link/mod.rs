//! The connection state machine shared by publisher and subscriber links, and the plumbing
//!  around it.
//!
//! The state machine itself is pure: inputs (operator commands and connection outcomes) return
//!  the [FsmAction] the link has to carry out, and the link feeds the outcome of that action
//!  back in. Redundant inputs are ignored, which makes `up`, `down` and `reconnect` idempotent.

pub mod control;
pub mod status;

use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Down,
    Disabled,
    Connecting,
    Up,
    /// disconnected after a failure, waiting for the reconnect delay to expire
    ReconnectPending,
    /// disconnecting after a failure, to connect again afterwards
    Reconnecting,
    /// a permanent error - the link is not retried before it is reconfigured
    Failed,
    Disconnecting,
    /// disconnecting, but `up()` was requested in the meantime
    ConnectPending,
    /// connecting or reconnecting, but `down()` was requested in the meantime
    DisconnectPending,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsmAction {
    None,
    Connect,
    Disconnect,
    /// the disconnect preceding a reconnect is complete: connect again, after the reconnect
    ///  interval unless `immediate`
    ScheduleReconnect { immediate: bool },
    CancelReconnect,
}

pub struct LinkFsm {
    state: LinkState,
    reconnects: u32,
    immediate_reconnect: bool,
    /// in `DisconnectPending`: a disconnect was issued and `disconnected()` is still to come
    disconnect_in_flight: bool,
}

impl LinkFsm {
    pub fn new(enabled: bool) -> LinkFsm {
        LinkFsm {
            state: if enabled { LinkState::Down } else { LinkState::Disabled },
            reconnects: 0,
            immediate_reconnect: false,
            disconnect_in_flight: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// number of reconnects since the link was last up
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Successive connection attempts alternate between primary and secondary endpoints
    pub fn is_secondary(&self) -> bool {
        self.reconnects & 1 == 1
    }

    pub fn up(&mut self) -> FsmAction {
        use LinkState::*;

        match self.state {
            Down => self.transition(Connecting, FsmAction::Connect),
            Disconnecting => self.transition(ConnectPending, FsmAction::None),
            DisconnectPending if self.disconnect_in_flight => self.transition(ConnectPending, FsmAction::None),
            DisconnectPending => self.transition(Connecting, FsmAction::None),
            ReconnectPending => self.transition(Connecting, FsmAction::Connect),
            Disabled | Failed | Connecting | Up | Reconnecting | ConnectPending => FsmAction::None,
        }
    }

    pub fn down(&mut self) -> FsmAction {
        use LinkState::*;

        match self.state {
            Connecting => {
                self.disconnect_in_flight = false;
                self.transition(DisconnectPending, FsmAction::None)
            }
            Reconnecting => {
                self.disconnect_in_flight = true;
                self.transition(DisconnectPending, FsmAction::None)
            }
            Up => self.transition(Disconnecting, FsmAction::Disconnect),
            ConnectPending => self.transition(Disconnecting, FsmAction::None),
            ReconnectPending => self.transition(Down, FsmAction::CancelReconnect),
            Down | Disabled | Failed | Disconnecting | DisconnectPending => FsmAction::None,
        }
    }

    /// all parts of a connection attempt succeeded
    pub fn connected(&mut self) -> FsmAction {
        use LinkState::*;

        match self.state {
            Connecting => {
                self.reconnects = 0;
                self.transition(Up, FsmAction::None)
            }
            DisconnectPending if !self.disconnect_in_flight => self.transition(Disconnecting, FsmAction::Disconnect),
            _ => FsmAction::None,
        }
    }

    /// all resources of a connection were released
    pub fn disconnected(&mut self) -> FsmAction {
        use LinkState::*;

        match self.state {
            Disconnecting | DisconnectPending => self.transition(Down, FsmAction::None),
            ConnectPending => self.transition(Connecting, FsmAction::Connect),
            Reconnecting => {
                let immediate = self.immediate_reconnect;
                self.transition(ReconnectPending, FsmAction::ScheduleReconnect { immediate })
            }
            _ => FsmAction::None,
        }
    }

    /// A connection attempt or an established connection failed in a way that warrants a new
    ///  attempt. Failures reported while a reconnect is already under way are ignored.
    pub fn reconnect(&mut self, immediate: bool) -> FsmAction {
        use LinkState::*;

        match self.state {
            Connecting | Up => {
                self.reconnects = self.reconnects.wrapping_add(1);
                self.immediate_reconnect = immediate;
                self.transition(Reconnecting, FsmAction::Disconnect)
            }
            // the attempt is abandoned anyway, release what it acquired
            DisconnectPending if !self.disconnect_in_flight => {
                self.disconnect_in_flight = true;
                FsmAction::Disconnect
            }
            _ => FsmAction::None,
        }
    }

    /// the reconnect delay expired
    pub fn reconnect_due(&mut self) -> FsmAction {
        match self.state {
            LinkState::ReconnectPending => self.transition(LinkState::Connecting, FsmAction::Connect),
            _ => FsmAction::None,
        }
    }

    /// a permanent error, e.g. invalid configuration
    pub fn failed(&mut self) -> FsmAction {
        use LinkState::*;

        match self.state {
            Failed | Disabled => FsmAction::None,
            Down => self.transition(Failed, FsmAction::None),
            ReconnectPending => self.transition(Failed, FsmAction::CancelReconnect),
            Connecting | Up | Reconnecting | Disconnecting | ConnectPending | DisconnectPending => self.transition(Failed, FsmAction::Disconnect),
        }
    }

    pub fn enable(&mut self, enabled: bool) -> FsmAction {
        use LinkState::*;

        if enabled {
            return match self.state {
                Disabled | Failed => {
                    self.reconnects = 0;
                    self.transition(Down, FsmAction::None)
                }
                _ => FsmAction::None,
            };
        }

        match self.state {
            Disabled => FsmAction::None,
            Down | Failed => self.transition(Disabled, FsmAction::None),
            ReconnectPending => self.transition(Disabled, FsmAction::CancelReconnect),
            Connecting | Up | Reconnecting | Disconnecting | ConnectPending | DisconnectPending => self.transition(Disabled, FsmAction::Disconnect),
        }
    }

    fn transition(&mut self, state: LinkState, action: FsmAction) -> FsmAction {
        self.state = state;
        action
    }
}
