//! The publisher link's sending role. It owns the retained queue and the UDP sockets, so every
//!  frame of a link - live, resent or heartbeat - goes out from this loop, in sequence order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::channel::ChannelId;
use crate::config::EngineConfig;
use crate::net::send_socket::SendSocket;
use crate::queue::tx_queue::TxQueue;
use crate::runtime::{Role, TaskReceiver};
use crate::wire::frame_header::NO_SHARD;
use crate::wire::message::{ControlMessage, Frame};

pub struct PubTx;
impl Role for PubTx {
    const NAME: &'static str = "publisher tx";
    type Task = TxTask;
}

pub enum TxTask {
    /// start sending on a new connection's sockets
    Attach {
        data: Arc<dyn SendSocket>,
        data_addr: SocketAddr,
        resend: Arc<dyn SendSocket>,
        shard_id: Option<u8>,
    },
    Send(Frame),
    Resend {
        seq_no: u64,
        count: u32,
        to: SocketAddr,
    },
    /// stop accepting sends, keeping the sockets for now
    Detach,
    /// drop the sockets
    Release,
    /// the sequence number the next live frame will get
    Head(oneshot::Sender<u64>),
    Status(oneshot::Sender<TxStatus>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxStatus {
    pub head: u64,
    pub tail: u64,
    pub attached: bool,
}

struct TxSockets {
    data: Arc<dyn SendSocket>,
    data_addr: SocketAddr,
    resend: Arc<dyn SendSocket>,
    shard_id: Option<u8>,
}

pub struct TxCore {
    channel: ChannelId,
    config: Arc<EngineConfig>,
    queue: TxQueue,
    sockets: Option<TxSockets>,
    attached: bool,
    last_heartbeat: Instant,
    send_buf: BytesMut,
}

impl TxCore {
    pub const FIRST_SEQ_NO: u64 = 1;

    pub fn new(channel: ChannelId, config: Arc<EngineConfig>) -> TxCore {
        TxCore {
            channel,
            config,
            queue: TxQueue::new(Self::FIRST_SEQ_NO),
            sockets: None,
            attached: false,
            last_heartbeat: Instant::now(),
            send_buf: BytesMut::new(),
        }
    }

    pub async fn on_task(&mut self, task: TxTask) {
        match task {
            TxTask::Attach { data, data_addr, resend, shard_id } => {
                debug!("attaching to {:?}", data_addr);
                self.sockets = Some(TxSockets { data, data_addr, resend, shard_id });
                self.attached = true;
                self.last_heartbeat = Instant::now();
            }
            TxTask::Send(frame) => self.on_send(frame).await,
            TxTask::Resend { seq_no, count, to } => self.on_resend(seq_no, count, to).await,
            TxTask::Detach => {
                debug!("detaching");
                self.attached = false;
            }
            TxTask::Release => {
                debug!("releasing sockets");
                self.attached = false;
                self.sockets = None;
            }
            TxTask::Head(reply) => {
                let _ = reply.send(self.queue.head());
            }
            TxTask::Status(reply) => {
                let _ = reply.send(TxStatus {
                    head: self.queue.head(),
                    tail: self.queue.tail(),
                    attached: self.attached,
                });
            }
        }
    }

    async fn on_send(&mut self, mut frame: Frame) {
        let sockets = match (&self.sockets, self.attached) {
            (Some(sockets), true) => sockets,
            _ => {
                trace!("not attached - dropping frame");
                return;
            }
        };

        if let Some(shard_id) = sockets.shard_id {
            if frame.shard() != shard_id && frame.shard() != NO_SHARD {
                trace!("frame for shard {} does not match channel shard {} - dropping", frame.shard(), shard_id);
                return;
            }
        }

        frame.header.nanos_since_heartbeat = self.last_heartbeat.elapsed().as_nanos()
            .try_into()
            .unwrap_or(u32::MAX);

        let frame = self.queue.push(frame);
        self.send_buf.clear();
        frame.ser(&mut self.send_buf);
        sockets.data.do_send_packet(sockets.data_addr, &self.send_buf).await;
    }

    /// Requests outside the retained window or above the maximum gap are ignored: they come from
    ///  subscribers that are out of sync, and those recover by reconnecting.
    async fn on_resend(&mut self, seq_no: u64, count: u32, to: SocketAddr) {
        let sockets = match &self.sockets {
            Some(sockets) => sockets,
            None => {
                trace!("resend request from {:?} while not connected - ignoring", to);
                return;
            }
        };

        if count == 0 || count > self.config.re_req_max_gap {
            trace!("resend request #{}+{} from {:?}: invalid count - ignoring", seq_no, count, to);
            return;
        }
        if seq_no < self.queue.tail() || seq_no >= self.queue.head() {
            trace!("resend request #{}+{} from {:?} outside of retained window #{}..#{} - ignoring", seq_no, count, to, self.queue.tail(), self.queue.head());
            return;
        }

        debug!("resending #{}+{} to {:?}", seq_no, count, to);
        for frame in self.queue.range(seq_no, count) {
            self.send_buf.clear();
            frame.ser(&mut self.send_buf);
            sockets.resend.do_send_packet(to, &self.send_buf).await;
        }
    }

    fn on_ack_tick(&mut self) {
        let num_released = self.queue.trim(self.config.max_queue_size);
        if num_released > 0 {
            trace!("released {} frames, retaining #{}..#{}", num_released, self.queue.tail(), self.queue.head());
        }
    }

    /// Heartbeats carry the next sequence number without consuming it, which lets subscribers
    ///  detect loss at the end of the stream
    async fn on_heartbeat_tick(&mut self) {
        let sockets = match (&self.sockets, self.attached) {
            (Some(sockets), true) => sockets,
            _ => return,
        };

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let frame = Frame::control(&ControlMessage::Heartbeat { stamp }, self.queue.head());

        self.send_buf.clear();
        frame.ser(&mut self.send_buf);
        sockets.data.do_send_packet(sockets.data_addr, &self.send_buf).await;
        self.last_heartbeat = Instant::now();
    }
}

pub async fn run_tx_loop(mut core: TxCore, mut tasks: TaskReceiver<PubTx>) {
    let mut ack_ticks = interval(core.config.ack_interval);
    let mut heartbeat_ticks = interval(core.config.heartbeat_interval);
    heartbeat_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            task = tasks.next() => match task {
                Some(task) => core.on_task(task).await,
                None => break,
            },
            _ = ack_ticks.tick() => core.on_ack_tick(),
            _ = heartbeat_ticks.tick() => core.on_heartbeat_tick().await,
        }
    }
    debug!("tx loop for channel {} terminated", core.channel);
}
