//! A subscriber link receives one channel: it logs in over TCP, receives the snapshot there and
//!  then follows the live multicast stream, filling gaps by resend requests.
//!
//! All of the link's state, including the receive queue, is owned by its control loop (role
//!  [SubRx]). The TCP and UDP tasks only post what they receive, tagged with the generation of
//!  the connection they belong to.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::channel::{ChannelDescriptor, ChannelId, Endpoints};
use crate::config::EngineConfig;
use crate::events::{EngineKind, LinkEventNotifier, Severity};
use crate::link::control::LinkControl;
use crate::link::status::{LinkStatus, TcpState, TcpStatus, UdpState};
use crate::link::{FsmAction, LinkState};
use crate::net::send_socket::SendSocket;
use crate::net::udp;
use crate::queue::gap::Gap;
use crate::registry::Link;
use crate::runtime::{task_queue, Role, TaskQueue, TaskReceiver};
use crate::subscriber::manual_resend::ManualResend;
use crate::subscriber::rx::{RxSession, SessionError};
use crate::subscriber::sink::MessageSink;
use crate::wire::message::{ControlMessage, Frame};
use crate::wire::tcp::{read_frame, write_frame};

const LIVENESS_TICK: Duration = Duration::from_secs(1);

pub struct SubRx;
impl Role for SubRx {
    const NAME: &'static str = "subscriber link";
    type Task = SubTask;
}

pub enum SubTask {
    Up,
    Down,
    Update(Arc<ChannelDescriptor>),
    /// The TCP connection is established. The TCP task waits for the login frame before it
    ///  starts reading, so the UDP socket is open before the publisher starts its snapshot.
    TcpConnected {
        generation: u64,
        peer: SocketAddr,
        login: oneshot::Sender<Frame>,
    },
    TcpFrame {
        generation: u64,
        frame: Frame,
    },
    TcpClosed {
        generation: u64,
        error: Option<String>,
    },
    Udp {
        generation: u64,
        frame: Frame,
    },
    ManualResend {
        gap: Gap,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Status(oneshot::Sender<LinkStatus>),
}

/// the resources of a connection attempt
struct Connection {
    generation: u64,
    endpoints: Endpoints,
    peer: Option<SocketAddr>,
    tcp_state: TcpState,
    tcp_handle: JoinHandle<()>,
    udp_handle: Option<JoinHandle<()>>,
    session: Option<RxSession>,
    login_deadline: Option<Instant>,
}

impl Connection {
    fn close_tcp(&mut self) {
        self.tcp_handle.abort();
        self.tcp_state = TcpState::Disconnect;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.tcp_handle.abort();
        if let Some(handle) = &self.udp_handle {
            handle.abort();
        }
    }
}

struct SubLinkCore {
    descriptor: Arc<ChannelDescriptor>,
    config: Arc<EngineConfig>,
    sink: Arc<dyn MessageSink>,
    manual: Arc<ManualResend>,
    control: LinkControl,
    myself: TaskQueue<SubRx>,
    wants_up: bool,
    generation: u64,
    connection: Option<Connection>,
    reconnect_at: Option<Instant>,
}

impl SubLinkCore {
    async fn on_task(&mut self, task: SubTask) {
        match task {
            SubTask::Up => {
                self.wants_up = true;
                let action = self.control.drive(|fsm| fsm.up());
                self.act(action);
            }
            SubTask::Down => {
                self.wants_up = false;
                let action = self.control.drive(|fsm| fsm.down());
                self.act(action);
            }
            SubTask::Update(descriptor) => self.on_update(descriptor),
            SubTask::TcpConnected { generation, peer, login } => self.on_tcp_connected(generation, peer, login),
            SubTask::TcpFrame { generation, frame } => self.on_tcp_frame(generation, frame).await,
            SubTask::TcpClosed { generation, error } => self.on_tcp_closed(generation, error),
            SubTask::Udp { generation, frame } => self.on_udp(generation, frame).await,
            SubTask::ManualResend { gap, reply } => {
                let result = self.on_manual_resend(gap).await;
                let _ = reply.send(result);
            }
            SubTask::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn act(&mut self, action: FsmAction) {
        let mut action = action;
        loop {
            action = match action {
                FsmAction::None => return,
                FsmAction::Connect => self.connect(),
                FsmAction::Disconnect => self.disconnect(),
                FsmAction::ScheduleReconnect { immediate } => {
                    if immediate {
                        self.control.drive(|fsm| fsm.reconnect_due())
                    }
                    else {
                        debug!("reconnecting in {:?}", self.config.reconn_interval);
                        self.reconnect_at = Some(Instant::now() + self.config.reconn_interval);
                        FsmAction::None
                    }
                }
                FsmAction::CancelReconnect => {
                    self.reconnect_at = None;
                    FsmAction::None
                }
            };
        }
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        let action = self.control.drive(|fsm| fsm.reconnect_due());
        self.act(action);
    }

    fn on_update(&mut self, descriptor: Arc<ChannelDescriptor>) {
        if descriptor == self.descriptor {
            trace!("unchanged descriptor - ignoring");
            return;
        }
        self.descriptor = descriptor;

        if let Err(e) = self.descriptor.validate() {
            self.control.alert(Severity::Error, format!("invalid channel configuration: {}", e));
            let action = self.control.drive(|fsm| fsm.failed());
            self.act(action);
            return;
        }

        if !self.descriptor.enabled {
            let action = self.control.drive(|fsm| fsm.enable(false));
            self.act(action);
            return;
        }

        if matches!(self.control.state(), LinkState::Disabled | LinkState::Failed) {
            self.control.drive(|fsm| fsm.enable(true));
            if self.wants_up {
                let action = self.control.drive(|fsm| fsm.up());
                self.act(action);
            }
            return;
        }

        info!("channel configuration changed - reconnecting");
        let action = self.control.drive(|fsm| fsm.reconnect(true));
        self.act(action);
    }

    /// Starts the TCP connect. The link is `connected` once the publisher acknowledged the login.
    fn connect(&mut self) -> FsmAction {
        if let Err(e) = self.descriptor.validate() {
            self.control.alert(Severity::Error, format!("invalid channel configuration: {}", e));
            return self.control.drive(|fsm| fsm.failed());
        }

        let endpoints = self.descriptor.endpoints(self.control.is_secondary());
        self.generation += 1;
        let generation = self.generation;
        debug!("connecting to {}", endpoints);

        let tcp_handle = tokio::spawn(tcp_loop(endpoints.tcp, self.myself.clone(), generation).in_current_span());
        self.connection = Some(Connection {
            generation,
            endpoints,
            peer: None,
            tcp_state: TcpState::Login,
            tcp_handle,
            udp_handle: None,
            session: None,
            login_deadline: Some(Instant::now() + self.config.login_timeout),
        });
        FsmAction::None
    }

    /// Dropping the connection aborts its tasks and closes its sockets
    fn disconnect(&mut self) -> FsmAction {
        if let Some(connection) = self.connection.take() {
            debug!("disconnecting from {}", connection.endpoints);
        }
        self.manual.clear();
        self.control.drive(|fsm| fsm.disconnected())
    }

    fn current(&self, generation: u64) -> Option<&Connection> {
        match &self.connection {
            Some(c) if c.generation == generation => Some(c),
            _ => None,
        }
    }

    fn current_session(&mut self, generation: u64) -> Option<&mut RxSession> {
        match &mut self.connection {
            Some(c) if c.generation == generation => c.session.as_mut(),
            _ => None,
        }
    }

    fn on_tcp_connected(&mut self, generation: u64, peer: SocketAddr, login: oneshot::Sender<Frame>) {
        let endpoints = match self.current(generation) {
            Some(c) => c.endpoints,
            None => return,
        };
        debug!("TCP connected to {:?}", peer);

        let socket = match udp::bind_receiver(endpoints.udp, self.config.interface) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.control.alert(Severity::Warning, format!("opening UDP {} failed: {}", endpoints.udp, e));
                let action = self.control.drive(|fsm| fsm.reconnect(false));
                self.act(action);
                return;
            }
        };

        let udp_handle = tokio::spawn(udp_receive_loop(socket.clone(), self.descriptor.clone(), self.manual.clone(), self.myself.clone(), generation).in_current_span());

        // resend requests go out from the data socket, so the replies arrive there
        let send_socket: Arc<dyn SendSocket> = Arc::new(socket);
        let session = RxSession::new(self.control.channel().clone(), self.config.clone(), self.sink.clone(), send_socket, endpoints.resend_addr());

        if let Some(connection) = &mut self.connection {
            connection.peer = Some(peer);
            connection.udp_handle = Some(udp_handle);
            connection.session = Some(session);
        }

        let credentials = ControlMessage::Login {
            username: self.descriptor.tcp_username.clone(),
            password: self.descriptor.tcp_password.clone(),
        };
        if login.send(Frame::control(&credentials, 0)).is_err() {
            trace!("TCP task terminated before login");
        }
    }

    async fn on_tcp_frame(&mut self, generation: u64, frame: Frame) {
        let tcp_state = match self.current(generation) {
            Some(c) => c.tcp_state,
            None => return,
        };

        match tcp_state {
            TcpState::Login => match frame.control_message() {
                Ok(Some(ControlMessage::Login { .. })) => {
                    debug!("login acknowledged");
                    if let Some(connection) = &mut self.connection {
                        connection.tcp_state = TcpState::Receiving;
                        connection.login_deadline = None;
                    }
                    let action = self.control.drive(|fsm| fsm.connected());
                    self.act(action);
                }
                _ => self.protocol_violation(format!("expected login acknowledgement, received message type {}", frame.msg_type())),
            },
            TcpState::Receiving => match frame.control_message() {
                Ok(None) => {
                    if let Some(session) = self.current_session(generation) {
                        session.on_snapshot_frame(&frame);
                    }
                }
                Ok(Some(ControlMessage::EndOfSnapshot { id, seq_no, ok })) => {
                    if !ok {
                        self.protocol_violation("publisher reported an incomplete snapshot".to_string());
                    }
                    else if &id != self.control.channel() {
                        self.protocol_violation(format!("end of snapshot for channel {}", id));
                    }
                    else {
                        self.on_end_of_snapshot(generation, seq_no).await;
                    }
                }
                Ok(Some(other)) => self.protocol_violation(format!("unexpected {:?} during snapshot", other.control_type())),
                Err(e) => warn!("undecodable snapshot frame - dropping: {}", e),
            },
            TcpState::Sending | TcpState::Disconnect => trace!("TCP frame after end of snapshot - ignoring"),
        }
    }

    async fn on_end_of_snapshot(&mut self, generation: u64, seq_no: u64) {
        let result = match self.current_session(generation) {
            Some(session) => session.on_end_of_snapshot(seq_no).await,
            None => return,
        };

        if let Some(connection) = &mut self.connection {
            connection.close_tcp();
        }
        if let Err(e) = result {
            self.on_session_error(e);
        }
    }

    fn on_tcp_closed(&mut self, generation: u64, error: Option<String>) {
        match self.current(generation) {
            Some(c) if c.tcp_state != TcpState::Disconnect => {}
            _ => return,
        }

        let message = match error {
            Some(e) => format!("TCP connection failed: {}", e),
            None => "TCP connection closed before end of snapshot".to_string(),
        };
        self.control.alert(Severity::Warning, message);
        let action = self.control.drive(|fsm| fsm.reconnect(false));
        self.act(action);
    }

    async fn on_udp(&mut self, generation: u64, frame: Frame) {
        let result = match self.current_session(generation) {
            Some(session) => session.on_frame(frame).await,
            None => return,
        };
        if let Err(e) = result {
            self.on_session_error(e);
        }
    }

    async fn on_manual_resend(&mut self, gap: Gap) -> anyhow::Result<()> {
        if self.control.state() != LinkState::Up {
            bail!("link {} is not connected", self.control.channel());
        }
        match self.connection.as_mut().and_then(|c| c.session.as_mut()) {
            Some(session) => {
                session.send_resend_request(gap).await;
                Ok(())
            }
            None => Err(anyhow!("link {} has no open UDP socket", self.control.channel())),
        }
    }

    fn on_session_error(&mut self, error: SessionError) {
        self.control.alert(Severity::Warning, error.to_string());
        let action = self.control.drive(|fsm| fsm.reconnect(error.is_immediate()));
        self.act(action);
    }

    fn protocol_violation(&mut self, message: String) {
        self.control.alert(Severity::Warning, format!("protocol violation: {}", message));
        let action = self.control.drive(|fsm| fsm.reconnect(false));
        self.act(action);
    }

    fn login_deadline(&self) -> Option<Instant> {
        self.connection.as_ref().and_then(|c| c.login_deadline)
    }

    fn on_login_timeout(&mut self) {
        if let Some(connection) = &mut self.connection {
            connection.login_deadline = None;
        }
        self.control.alert(Severity::Warning, format!("no login acknowledgement within {:?}", self.config.login_timeout));
        let action = self.control.drive(|fsm| fsm.reconnect(false));
        self.act(action);
    }

    fn re_request_deadline(&self) -> Option<Instant> {
        self.connection.as_ref()
            .and_then(|c| c.session.as_ref())
            .and_then(|s| s.re_request_deadline())
    }

    async fn on_re_request_timer(&mut self) {
        let result = match self.connection.as_mut().and_then(|c| c.session.as_mut()) {
            Some(session) => session.on_re_request_timer().await,
            None => return,
        };
        if let Err(e) = result {
            self.on_session_error(e);
        }
    }

    fn on_liveness_tick(&mut self) {
        if self.control.state() != LinkState::Up {
            return;
        }

        let result = match self.connection.as_mut().and_then(|c| c.session.as_mut()) {
            Some(session) => session.on_liveness_tick(),
            None => return,
        };
        if let Err(e) = result {
            self.on_session_error(e);
        }
    }

    fn status(&self) -> LinkStatus {
        let mut result = LinkStatus::new(EngineKind::Subscriber, self.control.channel().clone(), self.control.state(), self.control.reconnects());

        if let Some(connection) = &self.connection {
            result.endpoints = Some(connection.endpoints);
            if let Some(peer) = connection.peer {
                result.tcp = vec![TcpStatus { peer, state: connection.tcp_state }];
            }
            if let Some(session) = &connection.session {
                result.udp = Some(UdpState::Receiving);
                result.queue = Some(session.status());
                result.snapshot_seq_no = session.snapshot_seq_no();
                result.last_heartbeat = session.last_heartbeat();
            }
        }
        result
    }
}

async fn tcp_loop(addr: SocketAddrV4, control: TaskQueue<SubRx>, generation: u64) {
    let error = match do_tcp(addr, &control, generation).await {
        Ok(()) => None,
        Err(e) => Some(e.to_string()),
    };
    control.run(SubTask::TcpClosed { generation, error });
}

async fn do_tcp(addr: SocketAddrV4, control: &TaskQueue<SubRx>, generation: u64) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let peer = stream.peer_addr()?;

    let (login_sender, login_receiver) = oneshot::channel();
    if !control.run(SubTask::TcpConnected { generation, peer, login: login_sender }) {
        return Ok(());
    }
    let login = match login_receiver.await {
        Ok(frame) => frame,
        // the connection was abandoned
        Err(_) => return Ok(()),
    };
    write_frame(&mut stream, &login).await?;

    while let Some(frame) = read_frame(&mut stream).await? {
        if !control.run(SubTask::TcpFrame { generation, frame }) {
            break;
        }
    }
    Ok(())
}

/// Reads the data socket. Frames for other shards are dropped here, and resend replies go to a
///  pending manual resend if they match it.
async fn udp_receive_loop(socket: Arc<UdpSocket>, descriptor: Arc<ChannelDescriptor>, manual: Arc<ManualResend>, control: TaskQueue<SubRx>, generation: u64) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                trace!("error receiving on data socket: {}", e);
                continue;
            }
        };

        let frame = match Frame::decode(&buf[..num_read]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("undecodable datagram from {:?} - dropping: {}", from, e);
                continue;
            }
        };

        if !frame.is_control() {
            if !descriptor.accepts_shard(frame.shard()) {
                trace!("frame #{} for shard {} - dropping", frame.seq_no(), frame.shard());
                continue;
            }
            if descriptor.is_resend_ip(from.ip()) && manual.offer(&frame) {
                continue;
            }
        }

        if !control.run(SubTask::Udp { generation, frame }) {
            break;
        }
    }
}

async fn run_control_loop(mut core: SubLinkCore, mut tasks: TaskReceiver<SubRx>) {
    let mut liveness = interval(LIVENESS_TICK);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let reconnect_at = core.reconnect_at;
        let login_deadline = core.login_deadline();
        let re_request_deadline = core.re_request_deadline();

        select! {
            task = tasks.next() => match task {
                Some(task) => core.on_task(task).await,
                None => break,
            },
            _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => core.on_reconnect_due(),
            _ = sleep_until(login_deadline.unwrap_or_else(Instant::now)), if login_deadline.is_some() => core.on_login_timeout(),
            _ = sleep_until(re_request_deadline.unwrap_or_else(Instant::now)), if re_request_deadline.is_some() => core.on_re_request_timer().await,
            _ = liveness.tick() => core.on_liveness_tick(),
        }
    }
    debug!("control loop terminated");
}

/// The handle for a subscriber link. Dropping it terminates the link's loop, releasing all of
///  its resources.
pub struct SubscriberLink {
    channel: ChannelId,
    config: Arc<EngineConfig>,
    control: TaskQueue<SubRx>,
    manual: Arc<ManualResend>,
    state: watch::Receiver<LinkState>,
    control_handle: JoinHandle<()>,
}

impl Drop for SubscriberLink {
    fn drop(&mut self) {
        self.control_handle.abort();
    }
}

impl SubscriberLink {
    pub(crate) fn new(
        descriptor: Arc<ChannelDescriptor>,
        config: Arc<EngineConfig>,
        sink: Arc<dyn MessageSink>,
        notifier: Arc<LinkEventNotifier>,
    ) -> SubscriberLink {
        let channel = descriptor.id.clone();
        let (control, control_tasks) = task_queue::<SubRx>();
        let (link_control, state) = LinkControl::new(EngineKind::Subscriber, channel.clone(), descriptor.enabled, notifier);
        let manual = Arc::new(ManualResend::default());

        let mut core = SubLinkCore {
            descriptor,
            config: config.clone(),
            sink,
            manual: manual.clone(),
            control: link_control,
            myself: control.clone(),
            wants_up: false,
            generation: 0,
            connection: None,
            reconnect_at: None,
        };

        if let Err(e) = core.descriptor.validate() {
            core.control.alert(Severity::Error, format!("invalid channel configuration: {}", e));
            core.control.drive(|fsm| fsm.failed());
        }

        let span = info_span!("link", engine = %EngineKind::Subscriber, channel = %channel);
        let control_handle = tokio::spawn(run_control_loop(core, control_tasks).instrument(span));

        SubscriberLink {
            channel,
            config,
            control,
            manual,
            state,
            control_handle,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub async fn status(&self) -> anyhow::Result<LinkStatus> {
        self.control.invoke(SubTask::Status).await
    }

    /// Asks the publisher for a range of frames and returns the first one that arrives. The
    ///  reply bypasses the receive queue, and there can be only one manual resend per link at a
    ///  time.
    pub async fn resend(&self, seq_no: u64, count: u32) -> anyhow::Result<Frame> {
        if count == 0 || count > self.config.re_req_max_gap {
            bail!("resend count must be between 1 and {}, was {}", self.config.re_req_max_gap, count);
        }

        let gap = Gap::new(seq_no, count);
        let (ticket, receiver) = self.manual.install(gap)?;

        let result = self.await_resend(gap, receiver).await;
        if result.is_err() {
            self.manual.withdraw(ticket);
        }
        result
    }

    async fn await_resend(&self, gap: Gap, receiver: oneshot::Receiver<Frame>) -> anyhow::Result<Frame> {
        self.control.invoke(|reply| SubTask::ManualResend { gap, reply }).await??;

        match timeout(self.config.re_req_interval, receiver).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => bail!("link disconnected while waiting for resend of {}", gap),
            Err(_) => bail!("no resend of {} within {:?}", gap, self.config.re_req_interval),
        }
    }

    /// Waits until the link reaches a given state
    pub async fn wait_for_state(&self, state: LinkState) -> anyhow::Result<()> {
        let mut receiver = self.state.clone();
        receiver.wait_for(|s| *s == state).await?;
        Ok(())
    }
}

impl Link for SubscriberLink {
    fn channel(&self) -> &ChannelId {
        &self.channel
    }

    fn update(&self, descriptor: Arc<ChannelDescriptor>) {
        self.control.run(SubTask::Update(descriptor));
    }

    fn up(&self) {
        self.control.run(SubTask::Up);
    }

    fn down(&self) {
        self.control.run(SubTask::Down);
    }
}
