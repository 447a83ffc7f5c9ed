//! The receiving side of one subscriber connection: sequencing, gap recovery by resend requests
//!  and liveness supervision. This is driven by the link's control loop, and failures it can not
//!  recover from are returned as [SessionError] for the link to reconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::ChannelId;
use crate::config::EngineConfig;
use crate::link::status::QueueStatus;
use crate::net::send_socket::SendSocket;
use crate::queue::gap::{Gap, GapChange};
use crate::queue::rx_queue::{RxInsert, RxQueue};
use crate::subscriber::sink::MessageSink;
use crate::wire::message::{ControlMessage, Frame};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("gap {0} exceeds the maximum resend gap")]
    GapTooLarge(Gap),
    #[error("receive queue length {0} exceeds the maximum queue size")]
    QueueOverflow(u64),
    #[error("no traffic for {0} ticks")]
    HeartbeatTimeout(u32),
}

impl SessionError {
    /// Desynchronization is repaired by reconnecting right away, while a silent publisher is
    ///  given the reconnect interval
    pub fn is_immediate(&self) -> bool {
        !matches!(self, SessionError::HeartbeatTimeout(_))
    }
}

pub struct RxSession {
    channel: ChannelId,
    config: Arc<EngineConfig>,
    sink: Arc<dyn MessageSink>,
    socket: Arc<dyn SendSocket>,
    resend_addr: SocketAddr,
    queue: RxQueue,
    re_request_at: Option<Instant>,
    active: bool,
    idle_ticks: u32,
    snapshot_seq_no: Option<u64>,
    last_heartbeat: Option<Duration>,
    send_buf: BytesMut,
}

impl RxSession {
    /// The session starts out queuing live traffic until the end of the snapshot
    pub fn new(channel: ChannelId, config: Arc<EngineConfig>, sink: Arc<dyn MessageSink>, socket: Arc<dyn SendSocket>, resend_addr: SocketAddr) -> RxSession {
        let mut queue = RxQueue::new();
        queue.start_queuing();

        RxSession {
            channel,
            config,
            sink,
            socket,
            resend_addr,
            queue,
            re_request_at: None,
            active: false,
            idle_ticks: 0,
            snapshot_seq_no: None,
            last_heartbeat: None,
            send_buf: BytesMut::new(),
        }
    }

    pub fn snapshot_seq_no(&self) -> Option<u64> {
        self.snapshot_seq_no
    }

    pub fn last_heartbeat(&self) -> Option<Duration> {
        self.last_heartbeat
    }

    pub fn re_request_deadline(&self) -> Option<Instant> {
        self.re_request_at
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            head: self.queue.head(),
            gap: self.queue.gap(),
            length: self.queue.length(),
            count: self.queue.count(),
        }
    }

    pub fn on_snapshot_frame(&mut self, frame: &Frame) {
        self.active = true;
        self.sink.on_snapshot(&self.channel, frame);
    }

    pub async fn on_end_of_snapshot(&mut self, seq_no: u64) -> Result<(), SessionError> {
        debug!("end of snapshot, live delivery starts at #{}", seq_no);
        self.snapshot_seq_no = Some(seq_no);
        self.sink.on_end_of_snapshot(&self.channel, seq_no);

        let inserted = self.queue.stop_queuing(seq_no);
        self.on_inserted(inserted).await
    }

    /// a frame received on the data socket
    pub async fn on_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        self.active = true;

        match frame.control_message() {
            Ok(None) => {
                let inserted = self.queue.insert(frame);
                self.on_inserted(inserted).await
            }
            Ok(Some(ControlMessage::Heartbeat { stamp })) => {
                trace!("heartbeat, next #{}", frame.seq_no());
                self.last_heartbeat = Some(stamp);
                let gap_change = self.queue.raise_high_water_mark(frame.seq_no());
                self.on_gap_change(gap_change).await?;
                self.check_queue_length()
            }
            Ok(Some(other)) => {
                warn!("unexpected {:?} on the data path - dropping", other.control_type());
                Ok(())
            }
            Err(e) => {
                warn!("undecodable frame #{} on the data path - dropping: {}", frame.seq_no(), e);
                Ok(())
            }
        }
    }

    async fn on_inserted(&mut self, inserted: RxInsert) -> Result<(), SessionError> {
        for frame in &inserted.delivered {
            self.sink.on_message(&self.channel, frame);
        }
        self.on_gap_change(inserted.gap_change).await?;
        self.check_queue_length()
    }

    fn check_queue_length(&self) -> Result<(), SessionError> {
        let length = self.queue.length();
        if length > self.config.max_queue_size {
            return Err(SessionError::QueueOverflow(length));
        }
        Ok(())
    }

    /// A new gap is requested right away unless a request is pending already: the re-request
    ///  timer then asks for whatever the gap is when it fires, so there is one request per
    ///  interval at most.
    async fn on_gap_change(&mut self, gap_change: Option<GapChange>) -> Result<(), SessionError> {
        let now = match gap_change {
            Some(change) => change.now,
            None => return Ok(()),
        };

        if now.is_empty() {
            trace!("gap closed");
            self.re_request_at = None;
            return Ok(());
        }
        if now.count > self.config.re_req_max_gap {
            return Err(SessionError::GapTooLarge(now));
        }

        if self.re_request_at.is_none() {
            self.send_resend_request(now).await;
            self.re_request_at = Some(Instant::now() + self.config.re_req_interval);
        }
        Ok(())
    }

    pub async fn on_re_request_timer(&mut self) -> Result<(), SessionError> {
        let gap = self.queue.gap();
        if gap.is_empty() {
            self.re_request_at = None;
            return Ok(());
        }
        if gap.count > self.config.re_req_max_gap {
            return Err(SessionError::GapTooLarge(gap));
        }

        debug!("gap {} still open - requesting again", gap);
        self.send_resend_request(gap).await;
        self.re_request_at = Some(Instant::now() + self.config.re_req_interval);
        Ok(())
    }

    pub async fn send_resend_request(&mut self, gap: Gap) {
        debug!("requesting resend of {} from {:?}", gap, self.resend_addr);

        let frame = Frame::control(&ControlMessage::ResendRequest { seq_no: gap.start, count: gap.count }, 0);
        self.send_buf.clear();
        frame.ser(&mut self.send_buf);
        self.socket.do_send_packet(self.resend_addr, &self.send_buf).await;
    }

    /// Called once per second while the link is up. Any traffic since the previous tick counts
    ///  as a sign of life.
    pub fn on_liveness_tick(&mut self) -> Result<(), SessionError> {
        if self.active {
            self.active = false;
            self.idle_ticks = 0;
            return Ok(());
        }

        self.idle_ticks += 1;
        if self.idle_ticks >= self.config.timeout {
            let idle_ticks = self.idle_ticks;
            self.idle_ticks = 0;
            return Err(SessionError::HeartbeatTimeout(idle_ticks));
        }
        Ok(())
    }
}
