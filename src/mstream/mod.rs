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

//! Multi-stream coordination.
//!
//! After a session's primary stream is connected and logged in,
//! additional physical streams can be opened and joined to the same
//! session.  Each one starts under a temporary id, performs the
//! ordinary connect and handshake, and is then bound to the session
//! by an in-band `bind` request carrying the 16-byte session token —
//! routed through the stream being bound, not the primary.  The
//! server answers with the permanent substream id, and the stream is
//! renumbered to it.  Any failure along the way removes the
//! temporary stream; the session keeps working over the streams it
//! has.
//!
//! Large reads are distributed over the bound streams by
//! [split_read_request], which partitions the request into chunks and
//! tags each with a stream picked round-robin.
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Instant;

use log::debug;
use log::info;
use log::warn;

use crate::channel::Channel;
use crate::error::Code;
use crate::error::Status;
use crate::inqueue::IncomingMessageHandler;
use crate::message::Message;
use crate::proto::BindRequest;
use crate::proto::BindResponseBody;
use crate::proto::ResponseHeader;
use crate::proto::KXR_OK;
use crate::proto::RESPONSE_HEADER_SIZE;
use crate::stream::MessageStatusHandler;
use crate::stream::Stream;
use crate::stream::StreamStatus;

/// Temporary id carried by a sub-stream until its bind completes.
pub const PENDING_STREAM_ID: u16 = u16::MAX;

/// One piece of a split read request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadChunk {
    /// Absolute offset of the chunk.
    pub offset: u64,
    /// Length of the chunk in bytes.
    pub len: u64,
    /// Stream the chunk should be sent on.
    pub stream: u16
}

/// Waits for the bind response and records its outcome.
///
/// Registered on the session's incoming queue for the inbound side,
/// and used as the outbound completion handler for the request
/// itself, so a write failure unblocks the waiter too.
struct BindReplyHandler {
    sid: [u8; 2],
    channel: Weak<Channel>,
    deadline: Instant,
    state: Mutex<Option<Result<u8, Status>>>,
    cond: Condvar
}

impl BindReplyHandler {
    fn new(
        sid: [u8; 2],
        channel: Weak<Channel>,
        deadline: Instant
    ) -> Arc<Self> {
        Arc::new(BindReplyHandler {
            sid: sid,
            channel: channel,
            deadline: deadline,
            state: Mutex::new(None),
            cond: Condvar::new()
        })
    }

    fn complete(
        &self,
        result: Result<u8, Status>
    ) {
        let mut state = self.state.lock().unwrap();

        if state.is_none() {
            *state = Some(result);

            self.cond.notify_all()
        }
    }

    /// Block until the exchange completes or the deadline passes.
    fn wait(&self) -> Result<u8, Status> {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(result) = *state {
                return result;
            }

            let now = Instant::now();

            if now >= self.deadline {
                return Err(Status::error(Code::SocketTimeout));
            }

            let (guard, _) = self
                .cond
                .wait_timeout(state, self.deadline - now)
                .unwrap();

            state = guard
        }
    }
}

impl IncomingMessageHandler for BindReplyHandler {
    fn examine(
        &self,
        msg: &Message
    ) -> bool {
        match ResponseHeader::from_bytes(msg.as_slice()) {
            Some(header) => header.stream_id == self.sid,
            None => false
        }
    }

    fn process(
        &self,
        msg: Message
    ) {
        let result = match ResponseHeader::from_bytes(msg.as_slice()) {
            Some(header) => {
                if let Some(channel) = self.channel.upgrade() {
                    channel.set_last_response(Some(header))
                }

                if header.status == KXR_OK {
                    match BindResponseBody::from_bytes(
                        &msg.as_slice()[RESPONSE_HEADER_SIZE..]
                    ) {
                        Some(body) => Ok(body.substream_id),
                        None => Err(Status::error(Code::FatalInternal))
                    }
                } else {
                    Err(Status::error(Code::ConnectionError))
                }
            }
            None => Err(Status::error(Code::FatalInternal))
        };

        self.complete(result)
    }

    fn fail(
        &self,
        status: Status
    ) {
        self.complete(Err(status))
    }

    fn expires(&self) -> Option<Instant> {
        Some(self.deadline)
    }
}

impl MessageStatusHandler for BindReplyHandler {
    fn handle_status(
        &self,
        _msg: Message,
        status: Status
    ) {
        if !status.is_ok() {
            self.complete(Err(status))
        }
    }
}

/// Open up to `max` additional streams and bind them to the session.
///
/// Streams are added one at a time; the first failure stops the
/// process.  Returns the number successfully added.  Failures are
/// non-fatal: the session keeps whatever streams it has.
pub fn establish_parallel_streams(
    channel: &Arc<Channel>,
    max: u32
) -> u32 {
    let mut added = 0;

    for idx in 0..max {
        debug!(target: "multi-stream",
               "[{}] trying to establish substream {}",
               channel.addr(), idx + 1);

        if add_parallel_stream(channel).is_err() {
            break;
        }

        added += 1
    }

    added
}

/// Open one additional stream and bind it to the session.
///
/// On success the permanent substream id assigned by the server is
/// returned and the stream is reachable under it.  On any failure
/// the temporary stream is removed.
pub fn add_parallel_stream(channel: &Arc<Channel>) -> Result<u16, Status> {
    // Without a session token there is nothing to bind to.
    if channel.session_id().is_none() {
        return Err(Status::error(Code::FatalInternal));
    }

    let stream = channel.add_stream(PENDING_STREAM_ID);
    let status = stream.connect();

    if !status.is_ok() {
        channel.remove_stream(PENDING_STREAM_ID);

        return Err(status);
    }

    if stream.wait_connected(channel.config().connection_window()) !=
        StreamStatus::Connected
    {
        warn!(target: "multi-stream",
              "[{}] substream handshake did not complete",
              channel.addr());

        channel.remove_stream(PENDING_STREAM_ID);

        return Err(Status::error(Code::ConnectionError));
    }

    match bind_pending_stream(channel, &stream) {
        Ok(newid) => {
            if channel.promote_stream(PENDING_STREAM_ID, newid as u16) {
                info!(target: "multi-stream",
                      "[{}] substream {} added",
                      channel.addr(), newid);

                Ok(newid as u16)
            } else {
                channel.remove_stream(PENDING_STREAM_ID);

                Err(Status::error(Code::FatalInternal))
            }
        }
        Err(status) => {
            warn!(target: "multi-stream",
                  "[{}] substream bind failed: {}",
                  channel.addr(), status);

            channel.remove_stream(PENDING_STREAM_ID);

            Err(status)
        }
    }
}

/// Bind the pending stream to the session.
///
/// The request carries the session's 16-byte token verbatim and is
/// routed through the stream being bound.  The channel's externally
/// visible last response is saved before the exchange and restored
/// afterwards, so the bind leaves no trace in it.
fn bind_pending_stream(
    channel: &Arc<Channel>,
    stream: &Arc<Stream>
) -> Result<u8, Status> {
    let sess_id = match channel.session_id() {
        Some(id) => id,
        None => return Err(Status::error(Code::FatalInternal))
    };
    let saved = channel.last_response();
    let sid = channel.alloc_sid();
    let request = BindRequest {
        stream_id: sid,
        sess_id: sess_id
    };
    let timeout = channel.config().connection_window();
    let reply = BindReplyHandler::new(
        sid,
        Arc::downgrade(channel),
        Instant::now() + timeout
    );
    let as_incoming: Arc<dyn IncomingMessageHandler> = reply.clone();

    channel.inqueue().add_handler(as_incoming.clone());

    debug!(target: "multi-stream",
           "[{}] sending bind for the pending substream",
           channel.addr());

    let status = stream.queue_out(request.to_message(), reply.clone(), timeout);
    let result = if status.is_ok() {
        reply.wait()
    } else {
        Err(status)
    };

    channel.inqueue().remove_handler(&as_incoming);
    channel.set_last_response(saved);

    result
}

/// Split a large read into chunks distributed over the session's
/// streams.
///
/// The split size is the configured default, raised to
/// `len / streams + 1` when more than one stream is connected so
/// that each stream gets roughly one chunk.  The returned chunks
/// partition `[offset, offset + len)` exactly, in ascending order,
/// each tagged with the next stream from the round-robin selector.
pub fn split_read_request(
    channel: &Channel,
    offset: u64,
    len: u64
) -> Vec<ReadChunk> {
    let mut split = channel.config().multi_stream_split_size();
    let streams = channel.parallel_stream_count() as u64;

    if streams > 1 {
        split = split.max(len / streams + 1)
    }

    let mut chunks = Vec::new();
    let mut pos = 0;

    while pos < len {
        chunks.push(ReadChunk {
            offset: offset + pos,
            len: (len - pos).min(split),
            stream: channel.parallel_stream_to_use()
        });

        pos += split
    }

    chunks
}

#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use crate::channel::channel_fixture;
#[cfg(test)]
use crate::channel::drive_connect;
#[cfg(test)]
use crate::channel::ChannelFixture;
#[cfg(test)]
use crate::poller::SocketEvent;

#[cfg(test)]
fn wait_until(
    mut cond: impl FnMut() -> bool,
    what: &str
) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }

        std::thread::sleep(Duration::from_millis(1))
    }
}

#[cfg(test)]
fn four_stream_fixture() -> ChannelFixture {
    let fix = channel_fixture(4);

    drive_connect(&fix.channel.primary());

    for num in 1..4 {
        let stream = fix.channel.add_stream(num);

        drive_connect(&stream);
    }

    fix
}

#[test]
fn test_split_raises_split_size_for_parallel_streams() {
    let fix = four_stream_fixture();
    let len = 100 * 1024 * 1024;
    let chunks = split_read_request(&fix.channel, 0, len);

    // max(16 MiB, 100 MiB / 4 + 1) bytes per chunk.
    let split = 26214401;

    assert_eq!(chunks.len(), 4);

    for (idx, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.offset, idx as u64 * split);
        assert_eq!(chunk.stream, idx as u16);
        assert!(chunk.len <= split);
    }

    assert_eq!(chunks[0].len, split);
    assert_eq!(chunks[3].len, len - 3 * split);
}

#[test]
fn test_split_uses_default_size_on_single_stream() {
    let fix = channel_fixture(1);

    drive_connect(&fix.channel.primary());

    let len = 100 * 1024 * 1024;
    let chunks = split_read_request(&fix.channel, 0, len);

    assert_eq!(chunks.len(), 7);

    for chunk in &chunks {
        assert_eq!(chunk.stream, 0);
        assert!(chunk.len <= 16777216);
    }

    assert_eq!(chunks[6].len, len - 6 * 16777216);
}

#[test]
fn test_split_partitions_exactly() {
    let fix = four_stream_fixture();
    let offset = 12345;
    let len = 70000001;
    let chunks = split_read_request(&fix.channel, offset, len);
    let mut expected = offset;

    for chunk in &chunks {
        assert_eq!(chunk.offset, expected);
        assert!(chunk.len > 0);

        expected += chunk.len
    }

    assert_eq!(expected, offset + len);
}

#[test]
fn test_split_empty_read_yields_no_chunks() {
    let fix = four_stream_fixture();

    assert!(split_read_request(&fix.channel, 4096, 0).is_empty());
}

#[test]
fn test_establish_without_session_fails_fast() {
    let fix = channel_fixture(1);

    drive_connect(&fix.channel.primary());

    assert_eq!(establish_parallel_streams(&fix.channel, 2), 0);
    assert!(fix.channel.stream(PENDING_STREAM_ID).is_none());
}

#[test]
fn test_add_parallel_stream_connect_failure_cleans_up() {
    // Only the primary's link is on tap; the substream's connect
    // attempt fails synchronously.
    let fix = channel_fixture(1);

    drive_connect(&fix.channel.primary());
    fix.channel.set_session_id([7; 16]);

    let result = add_parallel_stream(&fix.channel);

    assert!(result.is_err());
    assert!(fix.channel.stream(PENDING_STREAM_ID).is_none());
    assert_eq!(fix.channel.parallel_stream_count(), 1);
}

#[test]
fn test_bind_exchange_preserves_last_response() {
    let fix = channel_fixture(2);

    drive_connect(&fix.channel.primary());

    let sess_id = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
        0x0c, 0x0d, 0x0e, 0x0f, 0x10
    ];

    fix.channel.set_session_id(sess_id);

    let saved = ResponseHeader {
        stream_id: [0, 1],
        status: KXR_OK,
        dlen: 7
    };

    fix.channel.set_last_response(Some(saved));

    let channel = fix.channel.clone();
    let worker =
        std::thread::spawn(move || add_parallel_stream(&channel));

    // Play the poller: drive the pending stream's connect and
    // handshake, then drain the bind request it queues.
    wait_until(
        || fix.channel.stream(PENDING_STREAM_ID).is_some(),
        "the pending stream"
    );

    let pending = fix.channel.stream(PENDING_STREAM_ID).unwrap();

    wait_until(
        || {
            pending.event(SocketEvent::ReadyToWrite);

            pending.status() == StreamStatus::Connected
        },
        "the substream handshake"
    );
    wait_until(
        || {
            pending.event(SocketEvent::ReadyToWrite);

            fix.connector.opened().len() > 1 &&
                fix.connector.opened()[1].written().len() >= 24
        },
        "the bind request"
    );

    let written = fix.connector.opened()[1].written();
    let request = BindRequest::from_bytes(&written).unwrap();

    assert_eq!(request.sess_id, sess_id);

    // Answer with substream id 3.
    let header = ResponseHeader {
        stream_id: request.stream_id,
        status: KXR_OK,
        dlen: 1
    };
    let mut bytes = header.to_bytes().to_vec();

    bytes.push(3);
    fix.channel.inqueue().add_message(Message::from_bytes(bytes));

    let result = worker.join().unwrap();

    assert_eq!(result, Ok(3));
    assert!(fix.channel.stream(3).is_some());
    assert!(fix.channel.stream(PENDING_STREAM_ID).is_none());
    assert_eq!(fix.channel.last_response(), Some(saved));
    assert_eq!(fix.channel.parallel_stream_count(), 2);
}

#[test]
fn test_bind_error_response_removes_pending_stream() {
    let fix = channel_fixture(2);

    drive_connect(&fix.channel.primary());
    fix.channel.set_session_id([9; 16]);

    let channel = fix.channel.clone();
    let worker =
        std::thread::spawn(move || add_parallel_stream(&channel));

    wait_until(
        || fix.channel.stream(PENDING_STREAM_ID).is_some(),
        "the pending stream"
    );

    let pending = fix.channel.stream(PENDING_STREAM_ID).unwrap();

    wait_until(
        || {
            pending.event(SocketEvent::ReadyToWrite);

            fix.connector.opened().len() > 1 &&
                fix.connector.opened()[1].written().len() >= 24
        },
        "the bind request"
    );

    let written = fix.connector.opened()[1].written();
    let request = BindRequest::from_bytes(&written).unwrap();
    let header = ResponseHeader {
        stream_id: request.stream_id,
        status: crate::proto::KXR_ERROR,
        dlen: 0
    };

    fix.channel
        .inqueue()
        .add_message(Message::from_bytes(header.to_bytes().to_vec()));

    let result = worker.join().unwrap();

    assert!(result.is_err());
    assert!(fix.channel.stream(PENDING_STREAM_ID).is_none());
    assert_eq!(fix.channel.parallel_stream_count(), 1);
}
