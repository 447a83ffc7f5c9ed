use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use crate::channel::{ChannelId, Endpoints};
use crate::events::EngineKind;
use crate::link::LinkState;
use crate::queue::gap::Gap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Login,
    /// publisher: pushing the snapshot
    Sending,
    /// subscriber: receiving the snapshot
    Receiving,
    Disconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UdpState {
    Sending,
    Receiving,
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpStatus {
    pub peer: SocketAddr,
    pub state: TcpState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub head: u64,
    pub gap: Gap,
    pub length: u64,
    pub count: usize,
}

/// A point-in-time view of a link for diagnostics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkStatus {
    pub engine: EngineKind,
    pub channel: ChannelId,
    pub state: LinkState,
    pub reconnects: u32,
    pub endpoints: Option<Endpoints>,
    pub tcp: Vec<TcpStatus>,
    pub udp: Option<UdpState>,
    pub queue: Option<QueueStatus>,
    pub snapshot_seq_no: Option<u64>,
    /// stamp of the last heartbeat received, as time since the Unix epoch
    pub last_heartbeat: Option<Duration>,
}

impl LinkStatus {
    pub fn new(engine: EngineKind, channel: ChannelId, state: LinkState, reconnects: u32) -> LinkStatus {
        LinkStatus {
            engine,
            channel,
            state,
            reconnects,
            endpoints: None,
            tcp: Vec::new(),
            udp: None,
            queue: None,
            snapshot_seq_no: None,
            last_heartbeat: None,
        }
    }
}

impl Display for LinkStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} link {}: {} #Reconnects {}", self.engine, self.channel, self.state, self.reconnects)?;

        match &self.endpoints {
            Some(endpoints) => writeln!(f, "  {}", endpoints)?,
            None => writeln!(f, "  not connected")?,
        }

        for tcp in &self.tcp {
            writeln!(f, "  TCP {} {:?}", tcp.peer, tcp.state)?;
        }
        if let Some(udp) = self.udp {
            writeln!(f, "  UDP {:?}", udp)?;
        }
        if let Some(queue) = &self.queue {
            writeln!(f, "  Queue head {} gap {} length {} count {}", queue.head, queue.gap, queue.length, queue.count)?;
        }
        if let Some(seq_no) = self.snapshot_seq_no {
            writeln!(f, "  Snapshot seqNo {}", seq_no)?;
        }
        if let Some(stamp) = self.last_heartbeat {
            writeln!(f, "  Last heartbeat {}.{:09}", stamp.as_secs(), stamp.subsec_nanos())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn test_display() {
        let mut status = LinkStatus::new(EngineKind::Subscriber, ChannelId::new("md1"), LinkState::Up, 2);
        status.endpoints = Some(Endpoints {
            tcp: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000),
            udp: SocketAddrV4::new(Ipv4Addr::new(239, 1, 1, 1), 9001),
            resend: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9002),
        });
        status.udp = Some(UdpState::Receiving);
        status.queue = Some(QueueStatus { head: 21, gap: Gap::new(21, 10), length: 30, count: 20 });
        status.snapshot_seq_no = Some(1);

        assert_eq!(status.to_string(), "subscriber link md1: Up #Reconnects 2\n\
            \x20 TCP 127.0.0.1:9000 UDP 239.1.1.1:9001 Resend 127.0.0.1:9002\n\
            \x20 UDP Receiving\n\
            \x20 Queue head 21 gap 21+10 length 30 count 20\n\
            \x20 Snapshot seqNo 1\n");
    }

    #[test]
    fn test_display_not_connected() {
        let status = LinkStatus::new(EngineKind::Publisher, ChannelId::new("md2"), LinkState::Down, 0);
        assert_eq!(status.to_string(), "publisher link md2: Down #Reconnects 0\n  not connected\n");
    }
}
