//! A publisher link serves one channel: it accepts logins on TCP and replays snapshots to them,
//!  multicasts live traffic and answers resend requests.
//!
//! The link's state is owned by its control loop (role [PubRx]), and all sending happens on
//!  the Tx loop (role [PubTx]). Accept, resend and session tasks only post into those loops, and
//!  they tag what they post with the generation of the connection they belong to, so reports
//!  from a connection that was torn down in the meantime are recognized and ignored.

use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::channel::{ChannelDescriptor, ChannelId, Endpoints};
use crate::config::EngineConfig;
use crate::events::{EngineKind, LinkEventNotifier, Severity};
use crate::link::control::LinkControl;
use crate::link::status::{LinkStatus, QueueStatus, TcpState, TcpStatus, UdpState};
use crate::link::{FsmAction, LinkState};
use crate::net::udp;
use crate::publisher::session::{run_session, ConnId, SessionContext};
use crate::publisher::snapshot::SnapshotSource;
use crate::publisher::tx::{run_tx_loop, PubTx, TxCore, TxTask};
use crate::queue::gap::Gap;
use crate::registry::Link;
use crate::runtime::{task_queue, Role, TaskQueue, TaskReceiver};
use crate::wire::message::{ControlMessage, Frame};

pub struct PubRx;
impl Role for PubRx {
    const NAME: &'static str = "publisher link";
    type Task = PubTask;
}

pub enum PubTask {
    Up,
    Down,
    Update(Arc<ChannelDescriptor>),
    Accepted {
        generation: u64,
        stream: TcpStream,
        peer: SocketAddr,
    },
    ListenerFailed {
        generation: u64,
        error: String,
    },
    SessionState {
        generation: u64,
        conn_id: ConnId,
        state: TcpState,
    },
    SessionClosed {
        generation: u64,
        conn_id: ConnId,
        result: Result<bool, String>,
    },
    Drained(DisconnectPhase),
    Status(oneshot::Sender<LinkStatus>),
}

/// Disconnecting happens in phases, each of them ending with a drain barrier on the Tx role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectPhase {
    /// the Tx role stops accepting sends
    Detaching,
    /// TCP is closed, waiting for resend work that is still queued
    Draining,
    /// the Tx role drops the sockets
    Releasing,
}

struct Session {
    peer: SocketAddr,
    state: TcpState,
    handle: JoinHandle<()>,
}

/// the resources of a connection attempt
struct Connection {
    generation: u64,
    endpoints: Endpoints,
    accept_handle: JoinHandle<()>,
    resend_handle: JoinHandle<()>,
    sessions: FxHashMap<ConnId, Session>,
}

impl Connection {
    fn close_tcp(&mut self) {
        self.accept_handle.abort();
        self.resend_handle.abort();
        for (_, session) in self.sessions.drain() {
            session.handle.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_tcp();
    }
}

struct PubLinkCore {
    descriptor: Arc<ChannelDescriptor>,
    config: Arc<EngineConfig>,
    snapshot_source: Arc<dyn SnapshotSource>,
    control: LinkControl,
    myself: TaskQueue<PubRx>,
    tx: TaskQueue<PubTx>,
    wants_up: bool,
    generation: u64,
    next_conn_id: ConnId,
    connection: Option<Connection>,
    disconnect_phase: Option<DisconnectPhase>,
    reconnect_at: Option<Instant>,
}

impl PubLinkCore {
    fn on_task(&mut self, task: PubTask) {
        match task {
            PubTask::Up => {
                self.wants_up = true;
                let action = self.control.drive(|fsm| fsm.up());
                self.act(action);
            }
            PubTask::Down => {
                self.wants_up = false;
                let action = self.control.drive(|fsm| fsm.down());
                self.act(action);
            }
            PubTask::Update(descriptor) => self.on_update(descriptor),
            PubTask::Accepted { generation, stream, peer } => self.on_accepted(generation, stream, peer),
            PubTask::ListenerFailed { generation, error } => {
                if self.is_current(generation) {
                    self.control.alert(Severity::Warning, format!("TCP listener failed: {}", error));
                    let action = self.control.drive(|fsm| fsm.reconnect(false));
                    self.act(action);
                }
            }
            PubTask::SessionState { generation, conn_id, state } => {
                if let Some(session) = self.session_mut(generation, conn_id) {
                    session.state = state;
                }
            }
            PubTask::SessionClosed { generation, conn_id, result } => self.on_session_closed(generation, conn_id, result),
            PubTask::Drained(phase) => self.on_drained(phase),
            PubTask::Status(reply) => {
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
                FsmAction::Disconnect => self.start_disconnect(),
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

    fn connect(&mut self) -> FsmAction {
        if let Err(e) = self.descriptor.validate() {
            self.control.alert(Severity::Error, format!("invalid channel configuration: {}", e));
            return self.control.drive(|fsm| fsm.failed());
        }

        let endpoints = self.descriptor.endpoints(self.control.is_secondary());
        match self.do_connect(endpoints) {
            Ok(()) => {
                info!("listening on {}", endpoints);
                self.control.drive(|fsm| fsm.connected())
            }
            Err(e) => {
                self.control.alert(Severity::Warning, format!("connecting {} failed: {}", endpoints, e));
                self.control.drive(|fsm| fsm.reconnect(false))
            }
        }
    }

    fn do_connect(&mut self, endpoints: Endpoints) -> anyhow::Result<()> {
        let listener = {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::V4(endpoints.tcp))?;
            socket.listen(self.config.n_accepts)?
        };
        let data = Arc::new(udp::bind_sender(&self.config, endpoints.udp)?);
        let resend = Arc::new(udp::bind_unicast(endpoints.resend)?);

        self.generation += 1;
        let generation = self.generation;

        let accept_handle = tokio::spawn(accept_loop(listener, self.myself.clone(), generation).in_current_span());
        let resend_handle = tokio::spawn(resend_request_loop(resend.clone(), self.tx.clone()).in_current_span());

        self.tx.run(TxTask::Attach {
            data: Arc::new(data),
            data_addr: SocketAddr::V4(endpoints.udp),
            resend: Arc::new(resend),
            shard_id: self.descriptor.shard_id,
        });

        self.connection = Some(Connection {
            generation,
            endpoints,
            accept_handle,
            resend_handle,
            sessions: Default::default(),
        });
        Ok(())
    }

    fn start_disconnect(&mut self) -> FsmAction {
        if self.disconnect_phase.is_some() {
            trace!("disconnect already in progress");
            return FsmAction::None;
        }

        debug!("disconnecting");
        self.tx.run(TxTask::Detach);
        self.await_drain(DisconnectPhase::Detaching);
        FsmAction::None
    }

    /// Waits for the Tx role to process everything posted so far, without blocking the control
    ///  loop in the meantime
    fn await_drain(&mut self, phase: DisconnectPhase) {
        self.disconnect_phase = Some(phase);

        let drain = self.tx.drain();
        let myself = self.myself.clone();
        tokio::spawn(async move {
            drain.await;
            myself.run(PubTask::Drained(phase));
        });
    }

    fn on_drained(&mut self, phase: DisconnectPhase) {
        if self.disconnect_phase != Some(phase) {
            warn!("unexpected drain of phase {:?} in {:?} - ignoring", phase, self.disconnect_phase);
            return;
        }

        match phase {
            DisconnectPhase::Detaching => {
                if let Some(connection) = &mut self.connection {
                    connection.close_tcp();
                }
                self.await_drain(DisconnectPhase::Draining);
            }
            DisconnectPhase::Draining => {
                self.tx.run(TxTask::Release);
                self.await_drain(DisconnectPhase::Releasing);
            }
            DisconnectPhase::Releasing => {
                self.disconnect_phase = None;
                self.connection = None;
                debug!("disconnected");

                let action = self.control.drive(|fsm| fsm.disconnected());
                self.act(action);
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        matches!(&self.connection, Some(c) if c.generation == generation)
    }

    fn session_mut(&mut self, generation: u64, conn_id: ConnId) -> Option<&mut Session> {
        match &mut self.connection {
            Some(c) if c.generation == generation => c.sessions.get_mut(&conn_id),
            _ => None,
        }
    }

    fn on_accepted(&mut self, generation: u64, stream: TcpStream, peer: SocketAddr) {
        if !self.is_current(generation) || self.control.state() != LinkState::Up || self.disconnect_phase.is_some() {
            debug!("connection from {:?} while not up - closing", peer);
            return;
        }

        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        debug!("accepted connection #{} from {:?}", conn_id, peer);

        let ctx = SessionContext {
            descriptor: self.descriptor.clone(),
            config: self.config.clone(),
            snapshot_source: self.snapshot_source.clone(),
            control: self.myself.clone(),
            tx: self.tx.clone(),
            generation,
            conn_id,
            peer,
        };
        let handle = tokio::spawn(run_session(ctx, stream).in_current_span());

        if let Some(connection) = &mut self.connection {
            connection.sessions.insert(conn_id, Session {
                peer,
                state: TcpState::Login,
                handle,
            });
        }
    }

    fn on_session_closed(&mut self, generation: u64, conn_id: ConnId, result: Result<bool, String>) {
        let peer = match &mut self.connection {
            Some(c) if c.generation == generation => match c.sessions.remove(&conn_id) {
                Some(session) => session.peer,
                None => return,
            },
            _ => return,
        };

        match result {
            Ok(true) => debug!("session #{} with {:?} complete", conn_id, peer),
            Ok(false) => self.control.alert(Severity::Warning, format!("incomplete snapshot sent to {:?}", peer)),
            Err(e) => self.control.alert(Severity::Warning, format!("dropped connection from {:?}: {}", peer, e)),
        }
    }

    fn status(&self) -> LinkStatus {
        let mut result = LinkStatus::new(EngineKind::Publisher, self.control.channel().clone(), self.control.state(), self.control.reconnects());

        if let Some(connection) = &self.connection {
            result.endpoints = Some(connection.endpoints);
            result.udp = Some(if self.disconnect_phase.is_some() { UdpState::Disconnect } else { UdpState::Sending });

            let mut sessions: Vec<_> = connection.sessions.iter().collect();
            sessions.sort_by_key(|(conn_id, _)| **conn_id);
            result.tcp = sessions.into_iter()
                .map(|(_, s)| TcpStatus { peer: s.peer, state: s.state })
                .collect();
        }
        result
    }
}

async fn accept_loop(listener: TcpListener, control: TaskQueue<PubRx>, generation: u64) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if !control.run(PubTask::Accepted { generation, stream, peer }) {
                    break;
                }
            }
            Err(e) => {
                control.run(PubTask::ListenerFailed { generation, error: e.to_string() });
                break;
            }
        }
    }
}

/// Reads resend requests and forwards them to the Tx role. Anything else arriving on the resend
///  socket is ignored.
async fn resend_request_loop(socket: Arc<UdpSocket>, tx: TaskQueue<PubTx>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                trace!("error receiving on resend socket: {}", e);
                continue;
            }
        };

        let request = Frame::decode(&buf[..num_read])
            .ok()
            .and_then(|frame| frame.control_message().ok().flatten());

        match request {
            Some(ControlMessage::ResendRequest { seq_no, count }) => {
                trace!("resend request #{}+{} from {:?}", seq_no, count, from);
                if !tx.run(TxTask::Resend { seq_no, count, to: from }) {
                    break;
                }
            }
            _ => trace!("ignoring datagram from {:?} on resend socket", from),
        }
    }
}

async fn run_control_loop(mut core: PubLinkCore, mut tasks: TaskReceiver<PubRx>) {
    loop {
        let reconnect_deadline = core.reconnect_at.unwrap_or_else(Instant::now);

        select! {
            task = tasks.next() => match task {
                Some(task) => core.on_task(task),
                None => break,
            },
            _ = sleep_until(reconnect_deadline), if core.reconnect_at.is_some() => core.on_reconnect_due(),
        }
    }
    debug!("control loop terminated");
}

/// The handle for a publisher link. Dropping it terminates the link's loops, releasing all of
///  its resources.
pub struct PublisherLink {
    channel: ChannelId,
    control: TaskQueue<PubRx>,
    tx: TaskQueue<PubTx>,
    state: watch::Receiver<LinkState>,
    control_handle: JoinHandle<()>,
    tx_handle: JoinHandle<()>,
}

impl Drop for PublisherLink {
    fn drop(&mut self) {
        self.control_handle.abort();
        self.tx_handle.abort();
    }
}

impl PublisherLink {
    pub(crate) fn new(
        descriptor: Arc<ChannelDescriptor>,
        config: Arc<EngineConfig>,
        snapshot_source: Arc<dyn SnapshotSource>,
        notifier: Arc<LinkEventNotifier>,
    ) -> PublisherLink {
        let channel = descriptor.id.clone();
        let (control, control_tasks) = task_queue::<PubRx>();
        let (tx, tx_tasks) = task_queue::<PubTx>();
        let (link_control, state) = LinkControl::new(EngineKind::Publisher, channel.clone(), descriptor.enabled, notifier);

        let mut core = PubLinkCore {
            descriptor,
            config: config.clone(),
            snapshot_source,
            control: link_control,
            myself: control.clone(),
            tx: tx.clone(),
            wants_up: false,
            generation: 0,
            next_conn_id: 0,
            connection: None,
            disconnect_phase: None,
            reconnect_at: None,
        };

        if let Err(e) = core.descriptor.validate() {
            core.control.alert(Severity::Error, format!("invalid channel configuration: {}", e));
            core.control.drive(|fsm| fsm.failed());
        }

        let span = info_span!("link", engine = %EngineKind::Publisher, channel = %channel);
        let control_handle = tokio::spawn(run_control_loop(core, control_tasks).instrument(span.clone()));
        let tx_handle = tokio::spawn(run_tx_loop(TxCore::new(channel.clone(), config), tx_tasks).instrument(span));

        PublisherLink {
            channel,
            control,
            tx,
            state,
            control_handle,
            tx_handle,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Hands a frame to the link for sending, stamped with the link's next sequence number.
    ///  Frames for links that are not up are dropped, and so are frames not matching the
    ///  channel's shard.
    pub fn send(&self, frame: Frame) -> bool {
        if self.state() != LinkState::Up {
            return false;
        }
        self.tx.run(TxTask::Send(frame))
    }

    pub async fn status(&self) -> anyhow::Result<LinkStatus> {
        let mut result = self.control.invoke(PubTask::Status).await?;
        let tx = self.tx.invoke(TxTask::Status).await?;

        result.queue = Some(QueueStatus {
            head: tx.head,
            gap: Gap::NONE,
            length: tx.head - tx.tail,
            count: (tx.head - tx.tail) as usize,
        });
        Ok(result)
    }

    /// Waits until the link reaches a given state
    pub async fn wait_for_state(&self, state: LinkState) -> anyhow::Result<()> {
        let mut receiver = self.state.clone();
        receiver.wait_for(|s| *s == state).await?;
        Ok(())
    }
}

impl Link for PublisherLink {
    fn channel(&self) -> &ChannelId {
        &self.channel
    }

    fn update(&self, descriptor: Arc<ChannelDescriptor>) {
        self.control.run(PubTask::Update(descriptor));
    }

    fn up(&self) {
        self.control.run(PubTask::Up);
    }

    fn down(&self) {
        self.control.run(PubTask::Down);
    }
}
