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

//! Scripted collaborators for tests.
//!
//! Everything external to the stream machinery is scripted here:
//! links (write and read scripts with `WouldBlock` and error
//! injection), connectors handing out scripted links, a recording
//! poller, a recording task manager, a scripted transport with a
//! simple length-prefix framing, and recording handlers.
use std::collections::VecDeque;
use std::io::Error;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::error::Code;
use crate::error::Status;
use crate::message::Message;
use crate::poller::Poller;
use crate::poller::SocketEventListener;
use crate::socket::Connector;
use crate::socket::Link;
use crate::socket::Socket;
use crate::stream::MessageStatusHandler;
use crate::task::Task;
use crate::task::TaskManager;
use crate::transport::ChannelData;
use crate::transport::HandShakeData;
use crate::transport::Transport;

/// One step of a link write script.
#[derive(Clone, Debug)]
pub(crate) enum WriteOp {
    /// Accept up to this many bytes.
    Accept(usize),
    /// Report `EWOULDBLOCK`.
    WouldBlock,
    /// Fail with this errno.
    Error(i32)
}

/// One step of a link read script.
#[derive(Clone, Debug)]
pub(crate) enum ReadOp {
    /// Deliver these bytes (possibly across several reads).
    Data(Vec<u8>),
    /// Report `EWOULDBLOCK`.
    WouldBlock,
    /// Fail with this errno.
    Error(i32)
}

/// Outcome of one `connect_error` query.
#[derive(Clone, Debug)]
pub(crate) enum ConnectOp {
    /// The connect succeeded.
    Ok,
    /// The connect failed with this errno.
    Refused(i32),
    /// The option query itself failed.
    QueryFailed
}

/// Shared observable state of a [ScriptedLink].
pub(crate) struct LinkScript {
    write_ops: Mutex<VecDeque<WriteOp>>,
    read_ops: Mutex<VecDeque<ReadOp>>,
    connect_ops: Mutex<VecDeque<ConnectOp>>,
    written: Mutex<Vec<u8>>,
    shut_down: AtomicBool
}

impl LinkScript {
    pub(crate) fn new(
        write_ops: Vec<WriteOp>,
        read_ops: Vec<ReadOp>
    ) -> Arc<Self> {
        Arc::new(LinkScript {
            write_ops: Mutex::new(write_ops.into()),
            read_ops: Mutex::new(read_ops.into()),
            connect_ops: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false)
        })
    }

    pub(crate) fn with_connect_ops(
        self: Arc<Self>,
        ops: Vec<ConnectOp>
    ) -> Arc<Self> {
        *self.connect_ops.lock().unwrap() = ops.into();

        self
    }

    pub(crate) fn push_read(
        &self,
        op: ReadOp
    ) {
        self.read_ops.lock().unwrap().push_back(op)
    }

    /// Get all bytes written so far.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// A [Link] whose behavior follows a [LinkScript].
///
/// An exhausted write script accepts everything; an exhausted read
/// script reports `WouldBlock`.
pub(crate) struct ScriptedLink {
    script: Arc<LinkScript>
}

impl ScriptedLink {
    pub(crate) fn new(
        write_ops: Vec<WriteOp>,
        read_ops: Vec<ReadOp>
    ) -> Self {
        ScriptedLink {
            script: LinkScript::new(write_ops, read_ops)
        }
    }

    pub(crate) fn from_script(script: Arc<LinkScript>) -> Self {
        ScriptedLink { script: script }
    }

    pub(crate) fn script(&self) -> Arc<LinkScript> {
        self.script.clone()
    }
}

pub(crate) fn test_addr() -> SocketAddr {
    "127.0.0.1:1094".parse().unwrap()
}

impl Link for ScriptedLink {
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        let mut ops = self.script.read_ops.lock().unwrap();

        match ops.pop_front() {
            Some(ReadOp::Data(mut bytes)) => {
                let len = bytes.len().min(buf.len());

                buf[..len].copy_from_slice(&bytes[..len]);

                if len < bytes.len() {
                    ops.push_front(ReadOp::Data(bytes.split_off(len)))
                }

                Ok(len)
            }
            Some(ReadOp::WouldBlock) | None => {
                Err(Error::from(ErrorKind::WouldBlock))
            }
            Some(ReadOp::Error(errno)) => Err(Error::from_raw_os_error(errno))
        }
    }

    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        let op = self.script.write_ops.lock().unwrap().pop_front();

        match op {
            Some(WriteOp::Accept(limit)) => {
                let len = limit.min(buf.len());

                self.script
                    .written
                    .lock()
                    .unwrap()
                    .extend_from_slice(&buf[..len]);

                Ok(len)
            }
            None => {
                self.script
                    .written
                    .lock()
                    .unwrap()
                    .extend_from_slice(buf);

                Ok(buf.len())
            }
            Some(WriteOp::WouldBlock) => Err(Error::from(ErrorKind::WouldBlock)),
            Some(WriteOp::Error(errno)) => Err(Error::from_raw_os_error(errno))
        }
    }

    fn connect_error(&mut self) -> Result<Option<Error>, Error> {
        let op = self.script.connect_ops.lock().unwrap().pop_front();

        match op {
            Some(ConnectOp::Ok) | None => Ok(None),
            Some(ConnectOp::Refused(errno)) => {
                Ok(Some(Error::from_raw_os_error(errno)))
            }
            Some(ConnectOp::QueryFailed) => {
                Err(Error::from(ErrorKind::InvalidInput))
            }
        }
    }

    fn shutdown(&mut self) {
        self.script.shut_down.store(true, Ordering::SeqCst)
    }

    fn peer_addr(&self) -> Result<SocketAddr, Error> {
        Ok(test_addr())
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok("127.0.0.1:40000".parse().unwrap())
    }
}

/// A [Connector] handing out pre-made scripted links in order.
///
/// When the supply is exhausted, connect attempts fail synchronously.
pub(crate) struct ScriptedConnector {
    links: Mutex<VecDeque<ScriptedLink>>,
    opened: Mutex<Vec<Arc<LinkScript>>>
}

impl ScriptedConnector {
    pub(crate) fn new(links: Vec<ScriptedLink>) -> Arc<Self> {
        Arc::new(ScriptedConnector {
            links: Mutex::new(links.into()),
            opened: Mutex::new(Vec::new())
        })
    }

    /// Get the scripts of every link handed out so far.
    pub(crate) fn opened(&self) -> Vec<Arc<LinkScript>> {
        self.opened.lock().unwrap().clone()
    }

    pub(crate) fn push_link(
        &self,
        link: ScriptedLink
    ) {
        self.links.lock().unwrap().push_back(link)
    }
}

impl Connector for ScriptedConnector {
    fn open(
        &self,
        _addr: SocketAddr
    ) -> Result<Box<dyn Link>, Error> {
        match self.links.lock().unwrap().pop_front() {
            Some(link) => {
                self.opened.lock().unwrap().push(link.script());

                Ok(Box::new(link))
            }
            None => Err(Error::from(ErrorKind::ConnectionRefused))
        }
    }
}

/// One recorded poller operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum PollerOp {
    Add,
    Remove,
    EnableRead(bool),
    EnableWrite(bool)
}

/// A [Poller] that records every call and succeeds unless told not
/// to.
pub(crate) struct RecordingPoller {
    ops: Mutex<Vec<PollerOp>>,
    fail: AtomicBool
}

impl RecordingPoller {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingPoller {
            ops: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false)
        })
    }

    pub(crate) fn ops(&self) -> Vec<PollerOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Make every subsequent call report failure.
    pub(crate) fn fail_from_now(&self) {
        self.fail.store(true, Ordering::SeqCst)
    }

    /// Get the latest write-notification state.
    pub(crate) fn write_enabled(&self) -> bool {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|op| match op {
                PollerOp::EnableWrite(on) => Some(*on),
                _ => None
            })
            .unwrap_or(false)
    }

    fn record(
        &self,
        op: PollerOp
    ) -> bool {
        self.ops.lock().unwrap().push(op);

        !self.fail.load(Ordering::SeqCst)
    }
}

impl Poller for RecordingPoller {
    fn add_socket(
        &self,
        _socket: &Arc<Socket>,
        _listener: Arc<dyn SocketEventListener>
    ) -> bool {
        self.record(PollerOp::Add)
    }

    fn remove_socket(
        &self,
        _socket: &Arc<Socket>
    ) -> bool {
        self.record(PollerOp::Remove)
    }

    fn enable_read_notification(
        &self,
        _socket: &Arc<Socket>,
        enable: bool,
        _resolution: u16
    ) -> bool {
        self.record(PollerOp::EnableRead(enable))
    }

    fn enable_write_notification(
        &self,
        _socket: &Arc<Socket>,
        enable: bool,
        _resolution: u16
    ) -> bool {
        self.record(PollerOp::EnableWrite(enable))
    }
}

/// A [TaskManager] that records registrations for the test to run by
/// hand.
pub(crate) struct RecordingTaskManager {
    tasks: Mutex<Vec<(Arc<dyn Task>, Instant)>>
}

impl RecordingTaskManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingTaskManager {
            tasks: Mutex::new(Vec::new())
        })
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Take and run every registered task once.
    pub(crate) fn run_all(
        &self,
        now: Instant
    ) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());

        for (task, _) in tasks {
            task.run(now);
        }
    }
}

impl TaskManager for RecordingTaskManager {
    fn register_task(
        &self,
        task: Arc<dyn Task>,
        at: Instant
    ) {
        self.tasks.lock().unwrap().push((task, at))
    }
}

/// One step of a scripted handshake.
pub(crate) struct HandShakeStep {
    /// Message to place in the outbound slot, if any.
    pub(crate) out: Option<Vec<u8>>,
    /// Status to return from this step.
    pub(crate) status: Status
}

/// A [Transport] following a handshake script, with 4-byte big-endian
/// length-prefix framing for inbound messages.
pub(crate) struct ScriptedTransport {
    steps: Mutex<VecDeque<HandShakeStep>>,
    seen_in: Mutex<Vec<Option<Vec<u8>>>>,
    ttl_elapsed: AtomicBool,
    disconnects: Mutex<Vec<u16>>
}

impl ScriptedTransport {
    /// A transport whose handshake completes immediately with no
    /// messages exchanged, for any number of streams.
    pub(crate) fn instant() -> Arc<Self> {
        ScriptedTransport::new(Vec::new())
    }

    pub(crate) fn new(steps: Vec<HandShakeStep>) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            steps: Mutex::new(steps.into()),
            seen_in: Mutex::new(Vec::new()),
            ttl_elapsed: AtomicBool::new(false),
            disconnects: Mutex::new(Vec::new())
        })
    }

    pub(crate) fn set_ttl_elapsed(
        &self,
        elapsed: bool
    ) {
        self.ttl_elapsed.store(elapsed, Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> Vec<u16> {
        self.disconnects.lock().unwrap().clone()
    }

    /// Get the inbound message bytes seen by each handshake step.
    pub(crate) fn seen_in(&self) -> Vec<Option<Vec<u8>>> {
        self.seen_in.lock().unwrap().clone()
    }

    /// Frame `body` for the scripted length-prefix codec.
    pub(crate) fn frame(body: &[u8]) -> Vec<u8> {
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();

        framed.extend_from_slice(body);

        framed
    }
}

impl Transport for ScriptedTransport {
    fn hand_shake(
        &self,
        data: &mut HandShakeData,
        _channel: &ChannelData
    ) -> Status {
        self.seen_in
            .lock()
            .unwrap()
            .push(data.in_msg.take().map(|msg| msg.take()));

        match self.steps.lock().unwrap().pop_front() {
            Some(step) => {
                data.out_msg =
                    step.out.map(|bytes| Message::from_bytes(bytes));

                step.status
            }
            // An exhausted script completes instantly, so one
            // transport can serve any number of streams.
            None => Status::done()
        }
    }

    fn get_message(
        &self,
        incoming: &mut Message,
        socket: &Socket
    ) -> Status {
        if incoming.size() == 0 {
            incoming.resize(4)
        }

        while !incoming.is_complete() {
            match socket.read(incoming.from_cursor_mut()) {
                Ok(0) => return Status::error(Code::SocketError),
                Ok(nbytes) => {
                    incoming.advance_cursor(nbytes);

                    if incoming.size() == 4 && incoming.is_complete() {
                        let header = incoming.as_slice();
                        let len = u32::from_be_bytes([
                            header[0], header[1], header[2], header[3]
                        ]);

                        incoming.resize(4 + len as usize)
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Status::in_progress()
                }
                Err(err) => {
                    return Status::error_errno(
                        Code::SocketError,
                        err.raw_os_error().unwrap_or(0)
                    )
                }
            }
        }

        Status::done()
    }

    fn is_stream_ttl_elapsed(
        &self,
        _idle: Duration,
        _channel: &ChannelData
    ) -> bool {
        self.ttl_elapsed.load(Ordering::SeqCst)
    }

    fn disconnect(
        &self,
        _channel: &ChannelData,
        stream_num: u16
    ) {
        self.disconnects.lock().unwrap().push(stream_num)
    }
}

/// A [MessageStatusHandler] recording every completion it sees.
pub(crate) struct RecordingHandler {
    seen: Mutex<Vec<(Status, Vec<u8>)>>
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new())
        })
    }

    pub(crate) fn seen(&self) -> Vec<(Status, Vec<u8>)> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn statuses(&self) -> Vec<Status> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(status, _)| *status)
            .collect()
    }
}

impl MessageStatusHandler for RecordingHandler {
    fn handle_status(
        &self,
        msg: Message,
        status: Status
    ) {
        self.seen.lock().unwrap().push((status, msg.take()))
    }
}
