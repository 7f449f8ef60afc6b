// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! The per-connection stream state machine.
//!
//! A [Stream] owns one physical connection of a session: its socket,
//! its outbound queues, the inbound message under assembly, and all
//! connection bookkeeping.  It is driven from three sides: the poller
//! delivers readiness and timeout events through
//! [event](Stream::event), the clock service calls
//! [tick](Stream::tick), and application threads enqueue messages
//! with [queue_out](Stream::queue_out).
//!
//! While the stream is connecting, outbound traffic is drained from a
//! dedicated handshake queue fed by the transport; once connected,
//! only the user queue is drained.  At most one outbound slot is in
//! flight at a time, and a partial write resumes from the message
//! cursor exactly.
//!
//! Faults funnel through a single path that decides between a
//! reconnection (immediate, or deferred through the task manager) and
//! the terminal `Error` state, in which new enqueues are rejected for
//! a configured window.
//!
//! The stream mutex covers status, queues, the in-flight slot,
//! counters and handshake state.  It is released around the raw
//! socket write loop, and user handlers are never invoked while it is
//! held.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::info;
use log::trace;

use crate::config::PostMasterConfig;
use crate::error::Code;
use crate::error::Status;
use crate::inqueue::InboundQueue;
use crate::message::Message;
use crate::poller::Poller;
use crate::poller::SocketEvent;
use crate::poller::SocketEventListener;
use crate::socket::Connector;
use crate::socket::Socket;
use crate::socket::SocketStatus;
use crate::task::Task;
use crate::task::TaskManager;
use crate::transport::ChannelData;
use crate::transport::HandShakeData;
use crate::transport::Transport;

/// Trait for consumers of outbound completion notifications.
///
/// The handler receives its message back together with the final
/// status: success once the message is fully on the wire, or the
/// failure that retired it (timeout, disconnect, or stream fault).
pub trait MessageStatusHandler: Send + Sync {
    /// Take delivery of the final status of `msg`.
    fn handle_status(
        &self,
        msg: Message,
        status: Status
    );
}

/// Status of a [Stream].
///
/// This is coupled to, but distinct from, the socket status: the
/// socket reports raw connect completion, while `Connected` here
/// additionally means the transport handshake has finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamStatus {
    /// No connection exists and none is being attempted.
    Disconnected,
    /// A connect or handshake is in progress.
    Connecting,
    /// The handshake is complete; user traffic flows.
    Connected,
    /// A terminal fault occurred; enqueues are rejected for the
    /// error window.
    Error
}

/// Which outbound queue a write pass drains.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OutPhase {
    /// The handshake queue, used while connecting.
    HandShake,
    /// The user queue, used once connected.
    Data
}

/// One queued outbound message.
///
/// Handshake slots carry no handler and no expiration.  The slot
/// owns its message and hands it back to the handler when retired.
struct OutMessageSlot {
    msg: Message,
    handler: Option<Arc<dyn MessageStatusHandler>>,
    expires: Option<Instant>
}

/// A handler invocation collected under the stream mutex, to be
/// delivered after it is released.
enum Note {
    Handler {
        handler: Arc<dyn MessageStatusHandler>,
        msg: Message,
        status: Status
    },
    FailIncoming {
        status: Status
    }
}

struct StreamInner {
    /// Stream number within the session; 0 is the primary.
    num: u16,
    status: StreamStatus,
    /// User messages awaiting transmission.
    out_queue: VecDeque<OutMessageSlot>,
    /// Handshake messages awaiting transmission.
    connect_queue: VecDeque<OutMessageSlot>,
    /// The slot currently being drained to the socket.  Never aged
    /// out by [tick](Stream::tick).
    current_out: Option<OutMessageSlot>,
    /// Inbound message under assembly.
    incoming: Option<Message>,
    /// Handshake state, present only while connecting.
    handshake: Option<HandShakeData>,
    /// Connection attempts in this fault chain.
    connection_count: u32,
    connection_init_time: Option<Instant>,
    last_activity: Option<Instant>,
    error_time: Option<Instant>,
    last_stream_error: Option<Code>
}

/// The state machine for one physical connection.
pub struct Stream {
    addr: SocketAddr,
    socket: Arc<Socket>,
    transport: Arc<dyn Transport>,
    poller: Arc<dyn Poller>,
    task_manager: Arc<dyn TaskManager>,
    connector: Arc<dyn Connector>,
    inqueue: Arc<InboundQueue>,
    channel_data: Arc<ChannelData>,
    timeout_resolution: u16,
    connection_window: Duration,
    connection_retry: u32,
    stream_error_window: Duration,
    inner: Mutex<StreamInner>,
    status_cond: Condvar,
    self_ref: Weak<Stream>
}

/// Poller-facing adapter delivering events to a [Stream].
struct StreamListener {
    stream: Weak<Stream>
}

impl SocketEventListener for StreamListener {
    fn event(
        &self,
        kind: SocketEvent,
        _socket: &Arc<Socket>
    ) {
        if let Some(stream) = self.stream.upgrade() {
            stream.event(kind)
        }
    }
}

/// One-shot task reconnecting a stream at a scheduled time.
struct StreamConnectorTask {
    stream: Weak<Stream>
}

impl Task for StreamConnectorTask {
    fn run(
        &self,
        _now: Instant
    ) -> Option<Instant> {
        if let Some(stream) = self.stream.upgrade() {
            stream.connect();
        }

        None
    }
}

impl Stream {
    /// Create a stream for `addr` with the given collaborators.
    ///
    /// The configuration values the stream needs are snapshotted
    /// here; later changes to the process environment do not affect
    /// it.  The stream starts out [Disconnected](StreamStatus::
    /// Disconnected) and connects on the first enqueue, or when
    /// [connect](Stream::connect) is called.
    pub fn new(
        addr: SocketAddr,
        stream_num: u16,
        transport: Arc<dyn Transport>,
        poller: Arc<dyn Poller>,
        task_manager: Arc<dyn TaskManager>,
        connector: Arc<dyn Connector>,
        inqueue: Arc<InboundQueue>,
        channel_data: Arc<ChannelData>,
        config: &PostMasterConfig
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Stream {
            addr: addr,
            socket: Arc::new(Socket::new()),
            transport: transport,
            poller: poller,
            task_manager: task_manager,
            connector: connector,
            inqueue: inqueue,
            channel_data: channel_data,
            timeout_resolution: config.timeout_resolution(),
            connection_window: config.connection_window(),
            connection_retry: config.connection_retry(),
            stream_error_window: config.stream_error_window(),
            inner: Mutex::new(StreamInner {
                num: stream_num,
                status: StreamStatus::Disconnected,
                out_queue: VecDeque::new(),
                connect_queue: VecDeque::new(),
                current_out: None,
                incoming: None,
                handshake: None,
                connection_count: 0,
                connection_init_time: None,
                last_activity: None,
                error_time: None,
                last_stream_error: None
            }),
            status_cond: Condvar::new(),
            self_ref: self_ref.clone()
        })
    }

    /// Get the stream number within the session.
    #[inline]
    pub fn stream_number(&self) -> u16 {
        self.inner.lock().unwrap().num
    }

    /// Renumber the stream after a successful session bind.
    pub(crate) fn set_stream_number(
        &self,
        num: u16
    ) {
        self.inner.lock().unwrap().num = num
    }

    /// Get the current status.
    #[inline]
    pub fn status(&self) -> StreamStatus {
        self.inner.lock().unwrap().status
    }

    /// Get the code of the last terminal fault, if any.
    #[inline]
    pub fn last_error(&self) -> Option<Code> {
        self.inner.lock().unwrap().last_stream_error
    }

    /// Get the address this stream connects to.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until the stream leaves the connecting phase, or
    /// `timeout` elapses.
    ///
    /// Returns the status observed last.  Used by the multi-stream
    /// machinery to synchronize on handshake completion.
    pub fn wait_connected(
        &self,
        timeout: Duration
    ) -> StreamStatus {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();

        while inner.status == StreamStatus::Connecting {
            let now = Instant::now();

            if now >= deadline {
                break;
            }

            let (guard, result) = self
                .status_cond
                .wait_timeout(inner, deadline - now)
                .unwrap();

            inner = guard;

            if result.timed_out() {
                break;
            }
        }

        inner.status
    }

    /// Queue `msg` for transmission.
    ///
    /// The expiration clock starts now; if the message has not been
    /// fully written by `timeout` from now, `handler` is invoked with
    /// a socket-timeout status instead.  If the stream cannot accept
    /// work (see [check_connection](Stream::check_connection)),
    /// `handler` is invoked synchronously with the failure and the
    /// same status is returned.
    pub fn queue_out(
        &self,
        msg: Message,
        handler: Arc<dyn MessageStatusHandler>,
        timeout: Duration
    ) -> Status {
        let check = self.check_connection();

        if !check.is_ok() {
            handler.handle_status(msg, check);

            return check;
        }

        let mut notes = Vec::new();
        let mut status = Status::done();

        {
            let mut inner = self.inner.lock().unwrap();
            let needs_enable = inner.status == StreamStatus::Connected &&
                inner.out_queue.is_empty() &&
                inner.current_out.is_none();

            if needs_enable &&
                !self.poller.enable_write_notification(
                    &self.socket,
                    true,
                    self.timeout_resolution
                )
            {
                status = Status::fatal(Code::PollerError);

                notes.push(Note::Handler {
                    handler: handler,
                    msg: msg,
                    status: status
                });
                self.fault_locked(&mut inner, status, &mut notes);
            } else {
                inner.out_queue.push_back(OutMessageSlot {
                    msg: msg,
                    handler: Some(handler),
                    expires: Some(Instant::now() + timeout)
                });
            }
        }

        self.dispatch(notes);

        status
    }

    /// Check whether the stream can accept outbound work, connecting
    /// if necessary.
    ///
    /// A connected or connecting stream accepts immediately.  A
    /// stream in the error state rejects work until the error window
    /// has passed; afterwards, and from the disconnected state, a
    /// connection attempt is started.
    pub fn check_connection(&self) -> Status {
        self.check_connection_at(Instant::now())
    }

    fn check_connection_at(
        &self,
        now: Instant
    ) -> Status {
        let mut notes = Vec::new();
        let status = {
            let mut inner = self.inner.lock().unwrap();

            match inner.status {
                StreamStatus::Connected | StreamStatus::Connecting => {
                    Status::done()
                }
                StreamStatus::Error => match inner.error_time {
                    Some(at)
                        if now.saturating_duration_since(at) <=
                            self.stream_error_window =>
                    {
                        Status::error(Code::StreamError)
                    }
                    _ => self.connect_locked(&mut inner, &mut notes)
                },
                StreamStatus::Disconnected => {
                    self.connect_locked(&mut inner, &mut notes)
                }
            }
        };

        self.dispatch(notes);

        status
    }

    /// Start an asynchronous connection attempt.
    pub fn connect(&self) -> Status {
        let mut notes = Vec::new();
        let status = {
            let mut inner = self.inner.lock().unwrap();

            self.connect_locked(&mut inner, &mut notes)
        };

        self.dispatch(notes);

        status
    }

    fn connect_locked(
        &self,
        inner: &mut StreamInner,
        notes: &mut Vec<Note>
    ) -> Status {
        debug!(target: "stream",
               "[{} #{}] attempting connection",
               self.addr, inner.num);

        self.socket.initialize();

        if let Err(err) = self.socket.begin_connect(&*self.connector, self.addr)
        {
            error!(target: "stream",
                   "[{} #{}] unable to initiate the connection: {}",
                   self.addr, inner.num, err);

            self.set_status_locked(inner, StreamStatus::Error);

            inner.last_stream_error = Some(Code::ConnectionError);

            return Status::error_errno(
                Code::ConnectionError,
                err.raw_os_error().unwrap_or(0)
            );
        }

        self.set_status_locked(inner, StreamStatus::Connecting);

        inner.connection_init_time = Some(Instant::now());
        inner.connection_count += 1;

        // The first write-readiness event tells us the connect
        // completed, so we need to listen for it.
        let listener = Arc::new(StreamListener {
            stream: self.self_ref.clone()
        });

        if !self.poller.add_socket(&self.socket, listener) {
            let status = Status::fatal(Code::PollerError);

            self.fault_locked(inner, status, notes);

            return status;
        }

        if !self.poller.enable_write_notification(
            &self.socket,
            true,
            self.timeout_resolution
        ) {
            let status = Status::fatal(Code::PollerError);

            self.fault_locked(inner, status, notes);

            return status;
        }

        Status::done()
    }

    /// Disconnect the stream.
    ///
    /// Unless `force` is set, a non-empty user queue cancels the
    /// disconnect: somebody has requested message sending since the
    /// decision was made.  Outstanding handlers are failed with a
    /// disconnect status.
    pub fn disconnect(
        &self,
        force: bool
    ) {
        let mut notes = Vec::new();

        {
            let mut inner = self.inner.lock().unwrap();

            if !force &&
                (!inner.out_queue.is_empty() || inner.current_out.is_some())
            {
                return;
            }

            debug!(target: "stream",
                   "[{} #{}] disconnecting",
                   self.addr, inner.num);

            self.poller.remove_socket(&self.socket);
            self.socket.close();

            let status = Status::error(Code::StreamDisconnect);

            if inner.num == 0 {
                notes.push(Note::FailIncoming { status: status });
            }

            self.fail_outgoing_locked(&mut inner, status, &mut notes);
            self.set_status_locked(&mut inner, StreamStatus::Disconnected);

            inner.handshake = None;
            inner.incoming = None;

            self.transport.disconnect(&self.channel_data, inner.num);
        }

        self.dispatch(notes)
    }

    /// Handle a clock event.
    ///
    /// Ages out queued outbound slots whose expiration has passed,
    /// without disturbing the slot currently in flight: aborting a
    /// partial transmission would desynchronize the wire.  On the
    /// primary stream this also drives the shared incoming queue's
    /// handler timeouts.
    pub fn tick(
        &self,
        now: Instant
    ) {
        let num = self.inner.lock().unwrap().num;

        if num == 0 {
            self.inqueue.timeout_handlers(now)
        }

        let expired = {
            let mut inner = self.inner.lock().unwrap();
            let mut keep = VecDeque::with_capacity(inner.out_queue.len());
            let mut expired = Vec::new();

            while let Some(slot) = inner.out_queue.pop_front() {
                match slot.expires {
                    Some(at) if at <= now => expired.push(slot),
                    _ => keep.push_back(slot)
                }
            }

            inner.out_queue = keep;

            expired
        };

        for slot in expired {
            if let Some(handler) = slot.handler {
                handler
                    .handle_status(slot.msg, Status::error(Code::SocketTimeout))
            }
        }
    }

    /// Handle a socket event from the poller.
    pub fn event(
        &self,
        kind: SocketEvent
    ) {
        let status = {
            let mut inner = self.inner.lock().unwrap();

            match kind {
                SocketEvent::ReadyToRead | SocketEvent::ReadyToWrite => {
                    inner.last_activity = Some(Instant::now())
                }
                _ => ()
            }

            inner.status
        };
        let connected = status == StreamStatus::Connected;

        match kind {
            SocketEvent::ReadyToRead if connected => {
                self.connected_ready_to_read()
            }
            SocketEvent::ReadyToRead => self.connecting_ready_to_read(),
            SocketEvent::ReadyToWrite if connected => {
                self.connected_ready_to_write()
            }
            SocketEvent::ReadyToWrite => self.connecting_ready_to_write(),
            SocketEvent::ReadTimeOut | SocketEvent::WriteTimeOut
                if connected =>
            {
                self.handle_idle_timeout(Instant::now())
            }
            SocketEvent::ReadTimeOut | SocketEvent::WriteTimeOut => {
                self.handle_connecting_timeout_at(Instant::now())
            }
        }
    }

    /// Write readiness while connecting.
    ///
    /// The first such event after a connect attempt reports the
    /// outcome of the asynchronous connect itself; a successful one
    /// starts the transport handshake.  Either way, whatever the
    /// handshake has queued is then drained.
    fn connecting_ready_to_write(&self) {
        let mut notes = Vec::new();
        let mut faulted = false;

        {
            let mut inner = self.inner.lock().unwrap();

            if self.socket.status() == SocketStatus::Connecting {
                match self.socket.connect_error() {
                    Err(err) => {
                        error!(target: "stream",
                               "[{} #{}] unable to get the status of the \
                                connect operation: {}",
                               self.addr, inner.num, err);

                        self.fault_locked(
                            &mut inner,
                            Status::fatal(Code::SocketOptError),
                            &mut notes
                        );

                        faulted = true
                    }
                    Ok(Some(err)) => {
                        error!(target: "stream",
                               "[{} #{}] unable to connect: {}",
                               self.addr, inner.num, err);

                        self.fault_locked(
                            &mut inner,
                            Status::error_errno(
                                Code::ConnectionError,
                                err.raw_os_error().unwrap_or(0)
                            ),
                            &mut notes
                        );

                        faulted = true
                    }
                    Ok(None) => {
                        self.socket.set_status(SocketStatus::Connected);

                        if !self.drive_handshake_locked(&mut inner, &mut notes)
                        {
                            faulted = true
                        }
                    }
                }
            }
        }

        self.dispatch(notes);

        if faulted {
            return;
        }

        let phase = {
            let inner = self.inner.lock().unwrap();

            if !inner.connect_queue.is_empty() || inner.current_out.is_some() {
                OutPhase::HandShake
            } else if inner.status == StreamStatus::Connected {
                OutPhase::Data
            } else {
                OutPhase::HandShake
            }
        };
        let status = self.write_message(phase);

        if !status.is_ok() {
            self.handle_stream_fault(status)
        }
    }

    /// Run the transport handshake until it stops asking to be
    /// called again.  Returns `false` if the stream faulted.
    fn drive_handshake_locked(
        &self,
        inner: &mut StreamInner,
        notes: &mut Vec<Note>
    ) -> bool {
        let mut data = HandShakeData::new(inner.num);

        data.server_addr = self.socket.peer_addr().ok();
        data.client_name = self.socket.local_addr().ok();

        let status = loop {
            let status = self.transport.hand_shake(&mut data, &self.channel_data);

            data.step += 1;

            if !status.is_ok() {
                error!(target: "stream",
                       "[{} #{}] connection negotiation failed: {}",
                       self.addr, inner.num, status);

                self.fault_locked(inner, status, notes);

                return false;
            }

            if let Some(out) = data.out_msg.take() {
                inner.connect_queue.push_back(OutMessageSlot {
                    msg: out,
                    handler: None,
                    expires: None
                });
            }

            if status.code() != Code::Retry {
                break status;
            }
        };

        if !self.poller.enable_read_notification(
            &self.socket,
            true,
            self.timeout_resolution
        ) {
            self.fault_locked(inner, Status::fatal(Code::PollerError), notes);

            return false;
        }

        if status.code() == Code::Done {
            // Reset the attempt counter so the next fault chain gets
            // the full reconnection budget again.
            inner.connection_count = 0;

            self.set_status_locked(inner, StreamStatus::Connected);

            debug!(target: "stream",
                   "[{} #{}] connected",
                   self.addr, inner.num);
        } else {
            inner.handshake = Some(data)
        }

        true
    }

    /// Read readiness while connecting: read one message and hand it
    /// to the transport handshake.
    fn connecting_ready_to_read(&self) {
        let status = self.read_message();

        if status.is_ok() && status.code() == Code::Done {
            let mut notes = Vec::new();

            {
                let mut inner = self.inner.lock().unwrap();

                self.finish_handshake_step_locked(&mut inner, &mut notes);
            }

            self.dispatch(notes);

            return;
        }

        if !status.is_ok() {
            self.handle_stream_fault(status)
        }
    }

    /// Hand a complete inbound message to the handshake and apply
    /// the outcome.
    fn finish_handshake_step_locked(
        &self,
        inner: &mut StreamInner,
        notes: &mut Vec<Note>
    ) {
        let msg = inner.incoming.take();
        let mut data = match inner.handshake.take() {
            Some(data) => data,
            None => {
                self.fault_locked(
                    inner,
                    Status::fatal(Code::FatalInternal),
                    notes
                );

                return;
            }
        };

        data.in_msg = msg;

        let step = self.transport.hand_shake(&mut data, &self.channel_data);

        data.step += 1;
        data.in_msg = None;

        if !step.is_ok() {
            error!(target: "stream",
                   "[{} #{}] connection negotiation failed: {}",
                   self.addr, inner.num, step);

            self.fault_locked(inner, step, notes);

            return;
        }

        if let Some(out) = data.out_msg.take() {
            inner.connect_queue.push_back(OutMessageSlot {
                msg: out,
                handler: None,
                expires: None
            });

            if !self.poller.enable_write_notification(
                &self.socket,
                true,
                self.timeout_resolution
            ) {
                self.fault_locked(
                    inner,
                    Status::fatal(Code::PollerError),
                    notes
                );

                return;
            }
        }

        if step.code() == Code::Done {
            inner.connection_count = 0;

            self.set_status_locked(inner, StreamStatus::Connected);

            debug!(target: "stream",
                   "[{} #{}] connected",
                   self.addr, inner.num);

            if !self.poller.enable_write_notification(
                &self.socket,
                true,
                self.timeout_resolution
            ) {
                self.fault_locked(
                    inner,
                    Status::fatal(Code::PollerError),
                    notes
                );
            }
        } else {
            inner.handshake = Some(data)
        }
    }

    /// Write readiness in steady state: drain the user queue.
    fn connected_ready_to_write(&self) {
        let status = self.write_message(OutPhase::Data);

        if !status.is_ok() {
            self.handle_stream_fault(status)
        }
    }

    /// Read readiness in steady state: read one message and append
    /// it to the incoming dispatch queue.
    fn connected_ready_to_read(&self) {
        let status = self.read_message();

        if status.is_ok() && status.code() == Code::Done {
            let msg = {
                let mut inner = self.inner.lock().unwrap();

                inner.incoming.take()
            };

            if let Some(msg) = msg {
                self.inqueue.add_message(msg)
            }
        }

        if !status.is_ok() {
            self.handle_stream_fault(status)
        }
    }

    /// Write one message from the queue of `phase`.
    ///
    /// If no transmission is in progress, the front slot is picked up
    /// and its cursor rewound; an empty queue disables write
    /// notification instead.  The raw write loop runs with the stream
    /// mutex released.  `EAGAIN` parks the slot as current with its
    /// cursor preserved; any other write error rewinds the cursor,
    /// puts the slot back at the front of its queue, and reports a
    /// socket error for the fault path to handle.
    fn write_message(
        &self,
        phase: OutPhase
    ) -> Status {
        let mut slot = {
            let mut inner = self.inner.lock().unwrap();

            match inner.current_out.take() {
                Some(slot) => slot,
                None => {
                    let queue = match phase {
                        OutPhase::HandShake => &mut inner.connect_queue,
                        OutPhase::Data => &mut inner.out_queue
                    };

                    match queue.pop_front() {
                        Some(mut slot) => {
                            slot.msg.set_cursor(0);

                            slot
                        }
                        None => {
                            trace!(target: "stream",
                                   "[{} #{}] nothing to write, disable write \
                                    notifications",
                                   self.addr, inner.num);

                            if !self.poller.enable_write_notification(
                                &self.socket,
                                false,
                                0
                            ) {
                                return Status::fatal(Code::PollerError);
                            }

                            return Status::done();
                        }
                    }
                }
            }
        };

        // The raw write loop runs without the stream mutex; the
        // poller serializes events per socket, so nobody else can be
        // in here.
        while !slot.msg.is_complete() {
            match self.socket.write(slot.msg.from_cursor()) {
                Ok(0) => {
                    slot.msg.set_cursor(0);

                    let mut inner = self.inner.lock().unwrap();

                    self.requeue_front_locked(&mut inner, slot, phase);

                    return Status::error(Code::SocketError);
                }
                Ok(nbytes) => slot.msg.advance_cursor(nbytes),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    let mut inner = self.inner.lock().unwrap();

                    inner.current_out = Some(slot);

                    return Status::in_progress();
                }
                Err(err) => {
                    let errno = err.raw_os_error().unwrap_or(0);

                    slot.msg.set_cursor(0);

                    let mut inner = self.inner.lock().unwrap();

                    self.requeue_front_locked(&mut inner, slot, phase);

                    return Status::error_errno(Code::SocketError, errno);
                }
            }
        }

        trace!(target: "stream",
               "[{}] wrote a message of {} bytes",
               self.addr, slot.msg.size());

        if let Some(handler) = slot.handler.take() {
            handler.handle_status(slot.msg, Status::done())
        }

        let empty = {
            let inner = self.inner.lock().unwrap();

            match phase {
                OutPhase::HandShake => inner.connect_queue.is_empty(),
                OutPhase::Data => inner.out_queue.is_empty()
            }
        };

        if empty {
            trace!(target: "stream",
                   "[{}] nothing left to write, disable write notifications",
                   self.addr);

            if !self.poller.enable_write_notification(&self.socket, false, 0) {
                return Status::fatal(Code::PollerError);
            }
        }

        Status::done()
    }

    fn requeue_front_locked(
        &self,
        inner: &mut StreamInner,
        slot: OutMessageSlot,
        phase: OutPhase
    ) {
        match phase {
            OutPhase::HandShake => inner.connect_queue.push_front(slot),
            OutPhase::Data => inner.out_queue.push_front(slot)
        }
    }

    /// Read bytes into the inbound message, deferring framing to the
    /// transport.
    fn read_message(&self) -> Status {
        let mut inner = self.inner.lock().unwrap();

        if inner.incoming.is_none() {
            inner.incoming = Some(Message::new())
        }

        let num = inner.num;
        let incoming = inner.incoming.as_mut().unwrap();
        let status = self.transport.get_message(incoming, &self.socket);

        if status.is_ok() && status.code() == Code::Done {
            trace!(target: "stream",
                   "[{} #{}] got a message of {} bytes",
                   self.addr, num, incoming.size());
        }

        status
    }

    /// Handle a notification timeout during connection negotiation.
    ///
    /// Nothing happens until the connection window has been used up;
    /// then the handshake queue is dropped and a retryable fault is
    /// raised.
    fn handle_connecting_timeout_at(
        &self,
        now: Instant
    ) {
        let mut notes = Vec::new();

        {
            let mut inner = self.inner.lock().unwrap();
            let deadline = inner
                .connection_init_time
                .map(|at| at + self.connection_window);

            match deadline {
                Some(at) if now >= at => {
                    inner.connect_queue.clear();

                    self.fault_locked(
                        &mut inner,
                        Status::error(Code::ConnectionError),
                        &mut notes
                    );
                }
                _ => ()
            }
        }

        self.dispatch(notes)
    }

    /// Handle a notification timeout in steady state: disconnect if
    /// the transport says the stream has idled past its TTL.
    fn handle_idle_timeout(
        &self,
        now: Instant
    ) {
        let idle = {
            let inner = self.inner.lock().unwrap();

            inner
                .last_activity
                .map(|at| now.saturating_duration_since(at))
        };

        match idle {
            Some(idle)
                if self
                    .transport
                    .is_stream_ttl_elapsed(idle, &self.channel_data) =>
            {
                self.disconnect(false)
            }
            _ => ()
        }
    }

    /// Handle a stream fault.
    pub(crate) fn handle_stream_fault(
        &self,
        status: Status
    ) {
        let mut notes = Vec::new();

        {
            let mut inner = self.inner.lock().unwrap();

            self.fault_locked(&mut inner, status, &mut notes);
        }

        self.dispatch(notes)
    }

    /// The single fault path.
    ///
    /// Tears the socket down, then either re-enters the connecting
    /// state (immediately or through a scheduled task) if the fault
    /// is retryable and budget remains, or declares the terminal
    /// error state and fails everything outstanding.
    fn fault_locked(
        &self,
        inner: &mut StreamInner,
        status: Status,
        notes: &mut Vec<Note>
    ) {
        let now = Instant::now();

        error!(target: "stream",
               "[{} #{}] stream fault ({}), cleaning up",
               self.addr, inner.num, status);

        self.poller.remove_socket(&self.socket);
        self.socket.close();

        // The in-flight slot dies with the connection; its partial
        // transmission cannot be resumed on a new socket.
        inner.current_out = None;

        inner.connect_queue.clear();
        inner.incoming = None;
        inner.handshake = None;

        self.transport.disconnect(&self.channel_data, inner.num);

        if !status.is_fatal() && inner.connection_count <= self.connection_retry
        {
            self.set_status_locked(inner, StreamStatus::Connecting);

            let new_connect_time = inner
                .connection_init_time
                .map(|at| at + self.connection_window)
                .unwrap_or(now);

            if new_connect_time <= now {
                info!(target: "stream",
                      "[{} #{}] attempting reconnection now",
                      self.addr, inner.num);

                self.connect_locked(inner, notes);
            } else {
                info!(target: "stream",
                      "[{} #{}] attempting reconnection in {} seconds",
                      self.addr, inner.num,
                      (new_connect_time - now).as_secs());

                let task = Arc::new(StreamConnectorTask {
                    stream: self.self_ref.clone()
                });

                self.task_manager.register_task(task, new_connect_time);
            }

            return;
        }

        error!(target: "stream",
               "[{} #{}] unrecoverable fault, giving up",
               self.addr, inner.num);

        self.set_status_locked(inner, StreamStatus::Error);

        inner.last_stream_error = Some(status.code());
        inner.error_time = Some(now);

        // The incoming queue is shared session-wide, so only the
        // primary stream may fail it.
        if inner.num == 0 {
            notes.push(Note::FailIncoming { status: status });
        }

        self.fail_outgoing_locked(inner, status, notes);
    }

    fn fail_outgoing_locked(
        &self,
        inner: &mut StreamInner,
        status: Status,
        notes: &mut Vec<Note>
    ) {
        if let Some(slot) = inner.current_out.take() {
            inner.out_queue.push_front(slot)
        }

        while let Some(slot) = inner.out_queue.pop_front() {
            if let Some(handler) = slot.handler {
                notes.push(Note::Handler {
                    handler: handler,
                    msg: slot.msg,
                    status: status
                });
            }
        }

        inner.connect_queue.clear()
    }

    fn set_status_locked(
        &self,
        inner: &mut StreamInner,
        status: StreamStatus
    ) {
        inner.status = status;

        self.status_cond.notify_all()
    }

    /// Deliver collected handler invocations with no lock held.
    fn dispatch(
        &self,
        notes: Vec<Note>
    ) {
        for note in notes {
            match note {
                Note::Handler {
                    handler,
                    msg,
                    status
                } => handler.handle_status(msg, status),
                Note::FailIncoming { status } => {
                    self.inqueue.fail_all_handlers(status)
                }
            }
        }
    }
}

#[cfg(test)]
use crate::harness::ConnectOp;
#[cfg(test)]
use crate::harness::PollerOp;
#[cfg(test)]
use crate::harness::ReadOp;
#[cfg(test)]
use crate::harness::RecordingHandler;
#[cfg(test)]
use crate::harness::RecordingPoller;
#[cfg(test)]
use crate::harness::RecordingTaskManager;
#[cfg(test)]
use crate::harness::ScriptedConnector;
#[cfg(test)]
use crate::harness::ScriptedLink;
#[cfg(test)]
use crate::harness::ScriptedTransport;
#[cfg(test)]
use crate::harness::WriteOp;
#[cfg(test)]
use crate::harness::test_addr;

#[cfg(test)]
struct StreamFixture {
    stream: Arc<Stream>,
    poller: Arc<RecordingPoller>,
    tasks: Arc<RecordingTaskManager>,
    transport: Arc<ScriptedTransport>,
    connector: Arc<ScriptedConnector>,
    inqueue: Arc<InboundQueue>
}

#[cfg(test)]
fn test_config() -> PostMasterConfig {
    PostMasterConfig::new(15, 30, 3, 60, 0, 16777216)
}

#[cfg(test)]
fn fixture(
    transport: Arc<ScriptedTransport>,
    links: Vec<ScriptedLink>
) -> StreamFixture {
    let poller = RecordingPoller::new();
    let tasks = RecordingTaskManager::new();
    let connector = ScriptedConnector::new(links);
    let inqueue = Arc::new(InboundQueue::new());
    let stream = Stream::new(
        test_addr(),
        0,
        transport.clone(),
        poller.clone(),
        tasks.clone(),
        connector.clone(),
        inqueue.clone(),
        Arc::new(ChannelData::new()),
        &test_config()
    );

    StreamFixture {
        stream: stream,
        poller: poller,
        tasks: tasks,
        transport: transport,
        connector: connector,
        inqueue: inqueue
    }
}

/// Connect a fixture stream with an instant handshake.
#[cfg(test)]
fn connected_fixture(links: Vec<ScriptedLink>) -> StreamFixture {
    let fix = fixture(ScriptedTransport::instant(), links);

    assert!(fix.stream.connect().is_ok());
    fix.stream.event(SocketEvent::ReadyToWrite);
    assert_eq!(fix.stream.status(), StreamStatus::Connected);

    fix
}

#[test]
fn test_connect_registers_and_enables_write() {
    let fix = fixture(
        ScriptedTransport::instant(),
        vec![ScriptedLink::new(vec![], vec![])]
    );

    assert!(fix.stream.connect().is_ok());
    assert_eq!(fix.stream.status(), StreamStatus::Connecting);
    assert_eq!(
        fix.poller.ops(),
        vec![PollerOp::Add, PollerOp::EnableWrite(true)]
    );
}

#[test]
fn test_happy_path_send() {
    let fix = connected_fixture(vec![ScriptedLink::new(vec![], vec![])]);
    let handler = RecordingHandler::new();
    let msg = Message::from_bytes(vec![0xaa; 1024]);
    let status = fix.stream.queue_out(
        msg,
        handler.clone(),
        Duration::from_secs(60)
    );

    assert!(status.is_ok());
    assert!(fix.poller.write_enabled());
    assert!(handler.seen().is_empty());

    fix.stream.event(SocketEvent::ReadyToWrite);

    let seen = handler.seen();

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, Status::done());
    assert_eq!(seen[0].1.len(), 1024);
    assert!(!fix.poller.write_enabled());
    assert_eq!(fix.connector.opened()[0].written().len(), 1024);
}

#[test]
fn test_partial_write_resumes_at_cursor() {
    let link = ScriptedLink::new(
        vec![
            WriteOp::Accept(1500),
            WriteOp::WouldBlock,
            WriteOp::Accept(2596),
        ],
        vec![]
    );
    let fix = connected_fixture(vec![link]);
    let handler = RecordingHandler::new();
    let payload: Vec<u8> = (0..4096u32).map(|idx| idx as u8).collect();

    fix.stream.queue_out(
        Message::from_bytes(payload.clone()),
        handler.clone(),
        Duration::from_secs(60)
    );
    fix.stream.event(SocketEvent::ReadyToWrite);

    // First pass wrote 1500 bytes and parked on EAGAIN.
    let script = fix.connector.opened()[0].clone();

    assert_eq!(script.written().len(), 1500);
    assert!(handler.seen().is_empty());
    assert!(fix.poller.write_enabled());

    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(script.written(), payload);
    assert_eq!(handler.statuses(), vec![Status::done()]);
    assert!(!fix.poller.write_enabled());
}

#[test]
fn test_messages_sent_in_enqueue_order() {
    let fix = connected_fixture(vec![ScriptedLink::new(vec![], vec![])]);
    let handler = RecordingHandler::new();

    fix.stream.queue_out(
        Message::from_bytes(vec![1, 1]),
        handler.clone(),
        Duration::from_secs(60)
    );
    fix.stream.queue_out(
        Message::from_bytes(vec![2, 2]),
        handler.clone(),
        Duration::from_secs(60)
    );

    fix.stream.event(SocketEvent::ReadyToWrite);
    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(fix.connector.opened()[0].written(), vec![1, 1, 2, 2]);
    assert_eq!(handler.statuses(), vec![Status::done(), Status::done()]);
}

#[test]
fn test_handshake_exchange() {
    let transport = ScriptedTransport::new(vec![
        crate::harness::HandShakeStep {
            out: Some(b"EHLO".to_vec()),
            status: Status::in_progress()
        },
        crate::harness::HandShakeStep {
            out: None,
            status: Status::done()
        },
    ]);
    let link = ScriptedLink::new(vec![], vec![]);
    let script = link.script();
    let fix = fixture(transport, vec![link]);

    fix.stream.connect();
    fix.stream.event(SocketEvent::ReadyToWrite);

    // The greeting went out; we are still negotiating.
    assert_eq!(script.written(), b"EHLO".to_vec());
    assert_eq!(fix.stream.status(), StreamStatus::Connecting);

    // Server reply arrives; the handshake completes.
    script.push_read(ReadOp::Data(ScriptedTransport::frame(b"OLEH")));
    fix.stream.event(SocketEvent::ReadyToRead);

    assert_eq!(fix.stream.status(), StreamStatus::Connected);

    let seen = fix.transport.seen_in();

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], None);
    assert_eq!(seen[1], Some(ScriptedTransport::frame(b"OLEH")));
}

#[test]
fn test_partial_inbound_reassembly() {
    let fix = connected_fixture(vec![ScriptedLink::new(vec![], vec![])]);
    let script = fix.connector.opened()[0].clone();
    let framed = ScriptedTransport::frame(&[9, 9, 9, 9]);

    // Deliver the frame in two pieces with a would-block between.
    script.push_read(ReadOp::Data(framed[..5].to_vec()));
    script.push_read(ReadOp::WouldBlock);
    fix.stream.event(SocketEvent::ReadyToRead);

    struct Claim {
        got: Mutex<Option<Message>>
    }

    impl crate::inqueue::IncomingMessageHandler for Claim {
        fn examine(
            &self,
            _msg: &Message
        ) -> bool {
            true
        }

        fn process(
            &self,
            msg: Message
        ) {
            *self.got.lock().unwrap() = Some(msg)
        }

        fn fail(
            &self,
            _status: Status
        ) {
        }
    }

    let claim = Arc::new(Claim {
        got: Mutex::new(None)
    });

    fix.inqueue.add_handler(claim.clone());

    assert!(claim.got.lock().unwrap().is_none());

    script.push_read(ReadOp::Data(framed[5..].to_vec()));
    fix.stream.event(SocketEvent::ReadyToRead);

    let got = claim.got.lock().unwrap();

    assert_eq!(got.as_ref().unwrap().as_slice(), &framed[..]);
}

#[test]
fn test_tick_ages_expired_slots_but_not_current() {
    let link = ScriptedLink::new(vec![WriteOp::WouldBlock], vec![]);
    let fix = connected_fixture(vec![link]);
    let current = RecordingHandler::new();
    let queued = RecordingHandler::new();
    let base = Instant::now();

    fix.stream.queue_out(
        Message::from_bytes(vec![1; 64]),
        current.clone(),
        Duration::from_secs(60)
    );

    // Park the first message as the in-flight transmission.
    fix.stream.event(SocketEvent::ReadyToWrite);

    fix.stream.queue_out(
        Message::from_bytes(vec![2; 64]),
        queued.clone(),
        Duration::from_secs(60)
    );

    fix.stream.tick(base + Duration::from_secs(120));

    assert_eq!(
        queued.statuses(),
        vec![Status::error(Code::SocketTimeout)]
    );
    assert!(current.seen().is_empty());
}

#[test]
fn test_tick_keeps_unexpired_slots() {
    let link = ScriptedLink::new(vec![WriteOp::WouldBlock], vec![]);
    let fix = connected_fixture(vec![link]);
    let handler = RecordingHandler::new();
    let base = Instant::now();

    fix.stream.queue_out(
        Message::from_bytes(vec![1]),
        handler.clone(),
        Duration::from_secs(60)
    );
    fix.stream.tick(base + Duration::from_secs(30));

    assert!(handler.seen().is_empty());
}

#[test]
fn test_connect_refused_schedules_reconnect_task() {
    let link = ScriptedLink::new(vec![], vec![])
        .script()
        .with_connect_ops(vec![ConnectOp::Refused(111)]);
    let fix = fixture(
        ScriptedTransport::instant(),
        vec![ScriptedLink::from_script(link)]
    );

    fix.stream.connect();
    fix.stream.event(SocketEvent::ReadyToWrite);

    // The fault was retryable and the window has not passed, so a
    // reconnection task was scheduled instead of reconnecting now.
    assert_eq!(fix.stream.status(), StreamStatus::Connecting);
    assert_eq!(fix.tasks.task_count(), 1);
    assert_eq!(fix.connector.opened().len(), 1);
}

#[test]
fn test_reconnect_task_runs_connect() {
    let refused = ScriptedLink::new(vec![], vec![])
        .script()
        .with_connect_ops(vec![ConnectOp::Refused(111)]);
    let accepted = ScriptedLink::new(vec![], vec![])
        .script()
        .with_connect_ops(vec![ConnectOp::Ok]);
    let fix = fixture(
        ScriptedTransport::instant(),
        vec![
            ScriptedLink::from_script(refused),
            ScriptedLink::from_script(accepted),
        ]
    );

    fix.stream.connect();
    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(fix.tasks.task_count(), 1);

    fix.tasks.run_all(Instant::now());

    assert_eq!(fix.connector.opened().len(), 2);
    assert_eq!(fix.stream.status(), StreamStatus::Connecting);

    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(fix.stream.status(), StreamStatus::Connected);
}

#[test]
fn test_retry_budget_exhaustion_enters_error() {
    let mut links = Vec::new();

    // Initial attempt plus three reconnections, all refused.
    for _ in 0..4 {
        let script = ScriptedLink::new(vec![], vec![])
            .script()
            .with_connect_ops(vec![ConnectOp::Refused(111)]);

        links.push(ScriptedLink::from_script(script));
    }

    let fix = fixture(ScriptedTransport::instant(), links);

    fix.stream.connect();

    for round in 0..4 {
        assert_eq!(fix.stream.status(), StreamStatus::Connecting);

        fix.stream.event(SocketEvent::ReadyToWrite);

        if round < 3 {
            fix.tasks.run_all(Instant::now());
        }
    }

    assert_eq!(fix.stream.status(), StreamStatus::Error);
    assert_eq!(fix.stream.last_error(), Some(Code::ConnectionError));
    assert_eq!(fix.tasks.task_count(), 0);
}

#[test]
fn test_error_window_rejects_then_allows() {
    let mut links = Vec::new();

    for _ in 0..4 {
        let script = ScriptedLink::new(vec![], vec![])
            .script()
            .with_connect_ops(vec![ConnectOp::Refused(111)]);

        links.push(ScriptedLink::from_script(script));
    }

    let fix = fixture(ScriptedTransport::instant(), links);

    fix.stream.connect();

    for _ in 0..4 {
        fix.stream.event(SocketEvent::ReadyToWrite);
        fix.tasks.run_all(Instant::now());
    }

    assert_eq!(fix.stream.status(), StreamStatus::Error);

    // Within the error window new work is rejected synchronously.
    let handler = RecordingHandler::new();
    let status = fix.stream.queue_out(
        Message::from_bytes(vec![1]),
        handler.clone(),
        Duration::from_secs(60)
    );

    assert_eq!(status, Status::error(Code::StreamError));
    assert_eq!(handler.statuses(), vec![Status::error(Code::StreamError)]);

    // Past the window, the next check reconnects.
    fix.connector.push_link(ScriptedLink::new(vec![], vec![]));

    let later = Instant::now() + Duration::from_secs(61);
    let status = fix.stream.check_connection_at(later);

    assert!(status.is_ok());
    assert_eq!(fix.stream.status(), StreamStatus::Connecting);
}

#[test]
fn test_connecting_timeout_faults_after_window() {
    let fix = fixture(
        ScriptedTransport::instant(),
        vec![
            ScriptedLink::new(vec![], vec![]),
            ScriptedLink::new(vec![], vec![]),
        ]
    );

    fix.stream.connect();

    let base = Instant::now();

    // Still within the window: nothing happens.
    fix.stream
        .handle_connecting_timeout_at(base + Duration::from_secs(5));

    assert_eq!(fix.connector.opened().len(), 1);

    // Past the window: fault, and the new attempt may start at once.
    fix.stream
        .handle_connecting_timeout_at(base + Duration::from_secs(31));

    assert_eq!(fix.stream.status(), StreamStatus::Connecting);
    assert_eq!(fix.connector.opened().len(), 2);
}

#[test]
fn test_write_error_fails_handler_via_fault() {
    let link = ScriptedLink::new(vec![WriteOp::Error(32)], vec![]);
    let fix = connected_fixture(vec![link]);
    let handler = RecordingHandler::new();

    // Exhaust the budget so the fault is terminal: pretend three
    // reconnections already happened in this chain.
    {
        let mut inner = fix.stream.inner.lock().unwrap();

        inner.connection_count = 4;
    }

    fix.stream.queue_out(
        Message::from_bytes(vec![7; 128]),
        handler.clone(),
        Duration::from_secs(60)
    );
    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(fix.stream.status(), StreamStatus::Error);
    assert_eq!(
        handler.statuses(),
        vec![Status::error_errno(Code::SocketError, 32)]
    );
}

#[test]
fn test_disconnect_with_pending_work() {
    let link = ScriptedLink::new(vec![], vec![]);
    let fix = connected_fixture(vec![link]);
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();

    fix.stream.queue_out(
        Message::from_bytes(vec![1]),
        first.clone(),
        Duration::from_secs(60)
    );
    fix.stream.queue_out(
        Message::from_bytes(vec![2]),
        second.clone(),
        Duration::from_secs(60)
    );

    // A polite disconnect is cancelled by the pending work.
    fix.stream.disconnect(false);

    assert_eq!(fix.stream.status(), StreamStatus::Connected);
    assert!(first.seen().is_empty());

    // A forced one retires everything.
    fix.stream.disconnect(true);

    assert_eq!(fix.stream.status(), StreamStatus::Disconnected);
    assert_eq!(
        first.statuses(),
        vec![Status::error(Code::StreamDisconnect)]
    );
    assert_eq!(
        second.statuses(),
        vec![Status::error(Code::StreamDisconnect)]
    );
    assert_eq!(fix.transport.disconnects(), vec![0]);
    assert!(fix.connector.opened()[0].was_shut_down());
}

#[test]
fn test_poller_failure_is_fatal() {
    let fix = connected_fixture(vec![ScriptedLink::new(vec![], vec![])]);
    let handler = RecordingHandler::new();

    fix.poller.fail_from_now();

    let status = fix.stream.queue_out(
        Message::from_bytes(vec![1]),
        handler.clone(),
        Duration::from_secs(60)
    );

    assert!(status.is_fatal());
    assert_eq!(fix.stream.status(), StreamStatus::Error);
    assert_eq!(
        handler.statuses(),
        vec![Status::fatal(Code::PollerError)]
    );
}

#[test]
fn test_sockopt_query_failure_is_fatal() {
    let script = ScriptedLink::new(vec![], vec![])
        .script()
        .with_connect_ops(vec![ConnectOp::QueryFailed]);
    let fix = fixture(
        ScriptedTransport::instant(),
        vec![ScriptedLink::from_script(script)]
    );

    fix.stream.connect();
    fix.stream.event(SocketEvent::ReadyToWrite);

    // Fatal faults never retry, whatever the remaining budget.
    assert_eq!(fix.stream.status(), StreamStatus::Error);
    assert_eq!(fix.stream.last_error(), Some(Code::SocketOptError));
    assert_eq!(fix.tasks.task_count(), 0);
}

#[test]
fn test_read_error_faults_stream() {
    let fix = connected_fixture(vec![ScriptedLink::new(vec![], vec![])]);

    {
        let mut inner = fix.stream.inner.lock().unwrap();

        inner.connection_count = 4;
    }

    fix.connector.opened()[0].push_read(ReadOp::Error(104));
    fix.stream.event(SocketEvent::ReadyToRead);

    assert_eq!(fix.stream.status(), StreamStatus::Error);
    assert_eq!(fix.stream.last_error(), Some(Code::SocketError));
}

#[test]
fn test_fault_drops_parked_current_slot() {
    let link = ScriptedLink::new(vec![WriteOp::WouldBlock], vec![]);
    let fix = connected_fixture(vec![link]);
    let parked = RecordingHandler::new();
    let queued = RecordingHandler::new();

    {
        let mut inner = fix.stream.inner.lock().unwrap();

        inner.connection_count = 4;
    }

    fix.stream.queue_out(
        Message::from_bytes(vec![1; 64]),
        parked.clone(),
        Duration::from_secs(60)
    );

    // Park the first message as the in-flight transmission.
    fix.stream.event(SocketEvent::ReadyToWrite);

    {
        let inner = fix.stream.inner.lock().unwrap();

        assert!(inner.current_out.is_some());
    }

    fix.stream.queue_out(
        Message::from_bytes(vec![2; 64]),
        queued.clone(),
        Duration::from_secs(60)
    );

    // A read error faults the stream while the slot is parked.
    fix.connector.opened()[0].push_read(ReadOp::Error(104));
    fix.stream.event(SocketEvent::ReadyToRead);

    assert_eq!(fix.stream.status(), StreamStatus::Error);

    // The in-flight slot is dropped without notification; only the
    // queued slot's handler is failed.
    assert!(parked.seen().is_empty());
    assert_eq!(
        queued.statuses(),
        vec![Status::error_errno(Code::SocketError, 104)]
    );

    {
        let inner = fix.stream.inner.lock().unwrap();

        assert!(inner.current_out.is_none());
        assert!(inner.out_queue.is_empty());
    }
}

#[test]
fn test_idle_ttl_disconnects() {
    let fix = connected_fixture(vec![ScriptedLink::new(vec![], vec![])]);

    fix.transport.set_ttl_elapsed(false);
    fix.stream.event(SocketEvent::ReadTimeOut);

    assert_eq!(fix.stream.status(), StreamStatus::Connected);

    fix.transport.set_ttl_elapsed(true);
    fix.stream.event(SocketEvent::ReadTimeOut);

    assert_eq!(fix.stream.status(), StreamStatus::Disconnected);
}

#[test]
fn test_queue_out_triggers_connect_when_disconnected() {
    let fix = fixture(
        ScriptedTransport::instant(),
        vec![ScriptedLink::new(vec![], vec![])]
    );
    let handler = RecordingHandler::new();
    let status = fix.stream.queue_out(
        Message::from_bytes(vec![0xcc; 16]),
        handler.clone(),
        Duration::from_secs(60)
    );

    assert!(status.is_ok());
    assert_eq!(fix.stream.status(), StreamStatus::Connecting);

    // Connect completes; the handshake finishes and the queued
    // message drains on the following write events.
    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(fix.stream.status(), StreamStatus::Connected);

    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(handler.statuses(), vec![Status::done()]);
    assert_eq!(fix.connector.opened()[0].written().len(), 16);
}

#[test]
fn test_fault_on_primary_fails_incoming_queue() {
    let link = ScriptedLink::new(vec![WriteOp::Error(104)], vec![]);
    let fix = connected_fixture(vec![link]);

    {
        let mut inner = fix.stream.inner.lock().unwrap();

        inner.connection_count = 4;
    }

    struct FailWatcher {
        failed: Mutex<Option<Status>>
    }

    impl crate::inqueue::IncomingMessageHandler for FailWatcher {
        fn examine(
            &self,
            _msg: &Message
        ) -> bool {
            false
        }

        fn process(
            &self,
            _msg: Message
        ) {
        }

        fn fail(
            &self,
            status: Status
        ) {
            *self.failed.lock().unwrap() = Some(status)
        }
    }

    let watcher = Arc::new(FailWatcher {
        failed: Mutex::new(None)
    });

    fix.inqueue.add_handler(watcher.clone());

    let handler = RecordingHandler::new();

    fix.stream.queue_out(
        Message::from_bytes(vec![1]),
        handler,
        Duration::from_secs(60)
    );
    fix.stream.event(SocketEvent::ReadyToWrite);

    assert_eq!(
        *watcher.failed.lock().unwrap(),
        Some(Status::error_errno(Code::SocketError, 104))
    );
}
