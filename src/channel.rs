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

//! Session-level glue shared by the streams of one channel.
//!
//! A [Channel] is one logical session with a server.  It owns the
//! ordered set of physical streams (stream 0 is the primary), the
//! incoming dispatch queue they all feed, the type-erased transport
//! state, and the session identity: the opaque 16-byte token obtained
//! at login, immutable for the rest of the session's life.
//!
//! The channel also keeps the small pieces of shared bookkeeping the
//! multi-stream machinery needs: a monotonic allocator for outbound
//! stream ids, the externally visible last response header, a
//! round-robin selector over the connected streams, and an opaque
//! redirect token that is threaded through but never interpreted
//! here.
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use log::warn;

use crate::config::PostMasterConfig;
use crate::error::Status;
use crate::inqueue::InboundQueue;
use crate::message::Message;
use crate::poller::Poller;
use crate::proto::ResponseHeader;
use crate::socket::Connector;
use crate::stream::MessageStatusHandler;
use crate::stream::Stream;
use crate::stream::StreamStatus;
use crate::task::TaskManager;
use crate::transport::ChannelData;
use crate::transport::Transport;

/// Length of a session identity token.
pub const SESSION_ID_LEN: usize = 16;

struct ChannelInner {
    /// Session token from the primary login; write-once.
    session_id: Option<[u8; SESSION_ID_LEN]>,
    /// All streams of the session; index 0 is the primary.
    streams: Vec<Arc<Stream>>,
    /// Round-robin position for stream selection.
    stream_cursor: usize,
    /// Next outbound stream id to hand out.
    next_sid: u16,
    /// Externally visible header of the last server response.
    last_response: Option<ResponseHeader>,
    /// Opaque redirect token; carried, never interpreted.
    redirect_token: Option<String>
}

/// One logical session and its pool of physical streams.
pub struct Channel {
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    poller: Arc<dyn Poller>,
    task_manager: Arc<dyn TaskManager>,
    connector: Arc<dyn Connector>,
    data: Arc<ChannelData>,
    inqueue: Arc<InboundQueue>,
    config: PostMasterConfig,
    inner: Mutex<ChannelInner>
}

impl Channel {
    /// Create a channel to `addr` with its primary stream.
    ///
    /// The configuration is snapshotted for the channel and every
    /// stream it will ever create.
    pub fn new(
        addr: SocketAddr,
        transport: Arc<dyn Transport>,
        poller: Arc<dyn Poller>,
        task_manager: Arc<dyn TaskManager>,
        connector: Arc<dyn Connector>,
        config: &PostMasterConfig
    ) -> Arc<Self> {
        let data = Arc::new(ChannelData::new());
        let inqueue = Arc::new(InboundQueue::new());
        let primary = Stream::new(
            addr,
            0,
            transport.clone(),
            poller.clone(),
            task_manager.clone(),
            connector.clone(),
            inqueue.clone(),
            data.clone(),
            config
        );

        Arc::new(Channel {
            addr: addr,
            transport: transport,
            poller: poller,
            task_manager: task_manager,
            connector: connector,
            data: data,
            inqueue: inqueue,
            config: config.clone(),
            inner: Mutex::new(ChannelInner {
                session_id: None,
                streams: vec![primary],
                stream_cursor: 0,
                next_sid: 1,
                last_response: None,
                redirect_token: None
            })
        })
    }

    /// Get the address of the server end.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the configuration snapshot.
    #[inline]
    pub fn config(&self) -> &PostMasterConfig {
        &self.config
    }

    /// Get the shared incoming dispatch queue.
    #[inline]
    pub fn inqueue(&self) -> &Arc<InboundQueue> {
        &self.inqueue
    }

    /// Get the primary stream.
    pub fn primary(&self) -> Arc<Stream> {
        self.inner.lock().unwrap().streams[0].clone()
    }

    /// Get the stream numbered `num`, if it exists.
    pub fn stream(
        &self,
        num: u16
    ) -> Option<Arc<Stream>> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .iter()
            .find(|stream| stream.stream_number() == num)
            .cloned()
    }

    /// Queue `msg` on the primary stream.
    pub fn send(
        &self,
        msg: Message,
        handler: Arc<dyn MessageStatusHandler>,
        timeout: Duration
    ) -> Status {
        self.primary().queue_out(msg, handler, timeout)
    }

    /// Start connecting the primary stream.
    pub fn connect(&self) -> Status {
        self.primary().connect()
    }

    /// Disconnect every stream of the session.
    pub fn disconnect(
        &self,
        force: bool
    ) {
        let streams = self.streams();

        for stream in streams {
            stream.disconnect(force)
        }
    }

    /// Forward a clock event to every stream.
    pub fn tick(
        &self,
        now: Instant
    ) {
        let streams = self.streams();

        for stream in streams {
            stream.tick(now)
        }
    }

    fn streams(&self) -> Vec<Arc<Stream>> {
        self.inner.lock().unwrap().streams.clone()
    }

    /// Record the session identity obtained at login.
    ///
    /// The identity is write-once; a second attempt is ignored.
    /// Returns whether the token was recorded.
    pub fn set_session_id(
        &self,
        id: [u8; SESSION_ID_LEN]
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.session_id {
            Some(_) => {
                warn!(target: "channel",
                      "[{}] refusing to replace the session id",
                      self.addr);

                false
            }
            None => {
                inner.session_id = Some(id);

                true
            }
        }
    }

    /// Get the session identity, if login has happened.
    #[inline]
    pub fn session_id(&self) -> Option<[u8; SESSION_ID_LEN]> {
        self.inner.lock().unwrap().session_id
    }

    /// Allocate the next outbound stream id.
    pub fn alloc_sid(&self) -> [u8; 2] {
        let mut inner = self.inner.lock().unwrap();
        let sid = inner.next_sid;

        inner.next_sid = inner.next_sid.wrapping_add(1);

        sid.to_be_bytes()
    }

    /// Get the externally visible last response header.
    #[inline]
    pub fn last_response(&self) -> Option<ResponseHeader> {
        self.inner.lock().unwrap().last_response
    }

    /// Set the externally visible last response header.
    #[inline]
    pub fn set_last_response(
        &self,
        header: Option<ResponseHeader>
    ) {
        self.inner.lock().unwrap().last_response = header
    }

    /// Get the opaque redirect token.
    #[inline]
    pub fn redirect_token(&self) -> Option<String> {
        self.inner.lock().unwrap().redirect_token.clone()
    }

    /// Set the opaque redirect token.
    #[inline]
    pub fn set_redirect_token(
        &self,
        token: Option<String>
    ) {
        self.inner.lock().unwrap().redirect_token = token
    }

    /// Create a new stream under `num` and add it to the session.
    ///
    /// The stream shares the session's incoming queue and transport
    /// state but owns its socket; it is not yet connected.
    pub fn add_stream(
        &self,
        num: u16
    ) -> Arc<Stream> {
        let stream = Stream::new(
            self.addr,
            num,
            self.transport.clone(),
            self.poller.clone(),
            self.task_manager.clone(),
            self.connector.clone(),
            self.inqueue.clone(),
            self.data.clone(),
            &self.config
        );

        self.inner.lock().unwrap().streams.push(stream.clone());

        stream
    }

    /// Renumber the stream `from` to the permanent id `to`.
    ///
    /// Fails if no stream carries `from`, or if `to` is already
    /// taken; a duplicate substream id from the server is a protocol
    /// anomaly the caller must treat as a fault.
    pub fn promote_stream(
        &self,
        from: u16,
        to: u16
    ) -> bool {
        let inner = self.inner.lock().unwrap();

        if inner
            .streams
            .iter()
            .any(|stream| stream.stream_number() == to)
        {
            warn!(target: "channel",
                  "[{}] substream id {} already in use",
                  self.addr, to);

            return false;
        }

        match inner
            .streams
            .iter()
            .find(|stream| stream.stream_number() == from)
        {
            Some(stream) => {
                stream.set_stream_number(to);

                true
            }
            None => false
        }
    }

    /// Disconnect and drop the stream numbered `num`.
    ///
    /// The primary stream cannot be removed.
    pub fn remove_stream(
        &self,
        num: u16
    ) {
        if num == 0 {
            return;
        }

        let removed = {
            let mut inner = self.inner.lock().unwrap();

            match inner
                .streams
                .iter()
                .position(|stream| stream.stream_number() == num)
            {
                Some(idx) => Some(inner.streams.remove(idx)),
                None => None
            }
        };

        if let Some(stream) = removed {
            stream.disconnect(true)
        }
    }

    /// Get the number of connected streams of the session.
    pub fn parallel_stream_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .streams
            .iter()
            .filter(|stream| stream.status() == StreamStatus::Connected)
            .count()
    }

    /// Pick a stream id for the next outbound data request.
    ///
    /// Round-robin over the connected streams; streams in any other
    /// state are skipped.  Falls back to the primary when nothing is
    /// connected.
    pub fn parallel_stream_to_use(&self) -> u16 {
        let mut inner = self.inner.lock().unwrap();
        let connected: Vec<u16> = inner
            .streams
            .iter()
            .filter(|stream| stream.status() == StreamStatus::Connected)
            .map(|stream| stream.stream_number())
            .collect();

        if connected.is_empty() {
            return 0;
        }

        let pick = connected[inner.stream_cursor % connected.len()];

        inner.stream_cursor = inner.stream_cursor.wrapping_add(1);

        pick
    }
}

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
use crate::harness::test_addr;
#[cfg(test)]
use crate::poller::SocketEvent;

#[cfg(test)]
pub(crate) struct ChannelFixture {
    pub(crate) channel: Arc<Channel>,
    pub(crate) connector: Arc<ScriptedConnector>
}

/// Build a channel whose streams connect instantly, with `nlinks`
/// scripted links on tap.
#[cfg(test)]
pub(crate) fn channel_fixture(nlinks: usize) -> ChannelFixture {
    let mut links = Vec::new();

    for _ in 0..nlinks {
        links.push(ScriptedLink::new(vec![], vec![]));
    }

    let connector = ScriptedConnector::new(links);
    let config = PostMasterConfig::new(15, 5, 3, 60, 4, 16777216);
    let channel = Channel::new(
        test_addr(),
        ScriptedTransport::instant(),
        RecordingPoller::new(),
        RecordingTaskManager::new(),
        connector.clone(),
        &config
    );

    ChannelFixture {
        channel: channel,
        connector: connector
    }
}

/// Drive `stream` through its instant connect handshake.
#[cfg(test)]
pub(crate) fn drive_connect(stream: &Arc<Stream>) {
    assert!(stream.connect().is_ok());
    stream.event(SocketEvent::ReadyToWrite);
    assert_eq!(stream.status(), StreamStatus::Connected);
}

#[test]
fn test_session_id_is_write_once() {
    let fix = channel_fixture(1);

    assert_eq!(fix.channel.session_id(), None);
    assert!(fix.channel.set_session_id([1; SESSION_ID_LEN]));
    assert!(!fix.channel.set_session_id([2; SESSION_ID_LEN]));
    assert_eq!(fix.channel.session_id(), Some([1; SESSION_ID_LEN]));
}

#[test]
fn test_sid_allocation_is_monotonic() {
    let fix = channel_fixture(1);

    assert_eq!(fix.channel.alloc_sid(), 1u16.to_be_bytes());
    assert_eq!(fix.channel.alloc_sid(), 2u16.to_be_bytes());
    assert_eq!(fix.channel.alloc_sid(), 3u16.to_be_bytes());
}

#[test]
fn test_round_robin_skips_unconnected_streams() {
    let fix = channel_fixture(3);

    drive_connect(&fix.channel.primary());

    let second = fix.channel.add_stream(1);
    let third = fix.channel.add_stream(2);

    drive_connect(&second);
    drive_connect(&third);

    // Knock the middle stream out; selection must skip it.
    second.disconnect(true);

    assert_eq!(fix.channel.parallel_stream_count(), 2);

    let picks: Vec<u16> = (0..4)
        .map(|_| fix.channel.parallel_stream_to_use())
        .collect();

    assert_eq!(picks, vec![0, 2, 0, 2]);
}

#[test]
fn test_round_robin_cycles_all_connected() {
    let fix = channel_fixture(4);

    drive_connect(&fix.channel.primary());

    for num in 1..4 {
        let stream = fix.channel.add_stream(num);

        drive_connect(&stream);
    }

    assert_eq!(fix.channel.parallel_stream_count(), 4);

    let picks: Vec<u16> = (0..7)
        .map(|_| fix.channel.parallel_stream_to_use())
        .collect();

    assert_eq!(picks, vec![0, 1, 2, 3, 0, 1, 2]);
}

#[test]
fn test_promote_stream_rejects_duplicate_id() {
    let fix = channel_fixture(1);
    let pending = fix.channel.add_stream(u16::MAX);

    assert!(!fix.channel.promote_stream(u16::MAX, 0));
    assert!(fix.channel.promote_stream(u16::MAX, 3));
    assert_eq!(pending.stream_number(), 3);
    assert!(fix.channel.stream(3).is_some());
    assert!(fix.channel.stream(u16::MAX).is_none());
}

#[test]
fn test_remove_stream_never_drops_primary() {
    let fix = channel_fixture(2);

    fix.channel.remove_stream(0);

    assert!(fix.channel.stream(0).is_some());

    let aux = fix.channel.add_stream(5);

    drive_connect(&aux);
    fix.channel.remove_stream(5);

    assert!(fix.channel.stream(5).is_none());
    assert_eq!(aux.status(), StreamStatus::Disconnected);
}

#[test]
fn test_last_response_is_settable_and_readable() {
    let fix = channel_fixture(1);
    let header = ResponseHeader {
        stream_id: [0, 9],
        status: 0,
        dlen: 12
    };

    assert_eq!(fix.channel.last_response(), None);

    fix.channel.set_last_response(Some(header));

    assert_eq!(fix.channel.last_response(), Some(header));
}
