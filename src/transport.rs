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

//! The protocol transport seam.
//!
//! A [Transport] is the opaque byte-level codec for one wire
//! protocol.  The stream machinery never parses frames itself; it
//! drives the transport's handshake step by step during connection
//! establishment, and defers all inbound framing to
//! [get_message](Transport::get_message).  Variants include the kXR
//! transport and whatever future protocols get plugged in.
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use crate::error::Status;
use crate::message::Message;
use crate::socket::Socket;

/// Handshake state, owned by a stream while it is connecting.
///
/// The transport is called repeatedly with this state; each call may
/// consume the inbound message slot and produce an outbound one.  The
/// stream advances `step` after every call and destroys the whole
/// state once the transport reports completion.
pub struct HandShakeData {
    /// Number of handshake calls made so far.
    pub step: u32,
    /// The stream this handshake belongs to.
    pub stream_num: u16,
    /// Address of the server end of the socket.
    pub server_addr: Option<SocketAddr>,
    /// Local name of the socket.
    pub client_name: Option<SocketAddr>,
    /// Message received for this step, if any.
    pub in_msg: Option<Message>,
    /// Message the transport wants sent, if any.
    pub out_msg: Option<Message>
}

impl HandShakeData {
    /// Create a fresh handshake state for `stream_num`.
    #[inline]
    pub fn new(stream_num: u16) -> Self {
        HandShakeData {
            step: 0,
            stream_num: stream_num,
            server_addr: None,
            client_name: None,
            in_msg: None,
            out_msg: None
        }
    }
}

/// Type-erased per-session transport state.
///
/// One instance is shared by every stream of a channel; the transport
/// keeps whatever it needs here (login tokens, negotiated protocol
/// versions, and so on).  The holder is internally synchronized.
#[derive(Default)]
pub struct ChannelData {
    inner: Mutex<Option<Box<dyn Any + Send>>>
}

impl ChannelData {
    /// Create an empty holder.
    #[inline]
    pub fn new() -> Self {
        ChannelData {
            inner: Mutex::new(None)
        }
    }

    /// Replace the held state.
    #[inline]
    pub fn set(
        &self,
        data: Box<dyn Any + Send>
    ) {
        *self.inner.lock().unwrap() = Some(data)
    }

    /// Lock and access the held state.
    #[inline]
    pub fn get(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.inner.lock().unwrap()
    }
}

/// Byte-level codec for one wire protocol.
pub trait Transport: Send + Sync {
    /// Advance the handshake by one step.
    ///
    /// Returns [retry](crate::error::Code::Retry) if it should be
    /// called again immediately, [done](crate::error::Code::Done)
    /// when the handshake is complete, or an error.  The transport
    /// may produce an outbound message in `data.out_msg` and must
    /// consume `data.in_msg` each step.
    fn hand_shake(
        &self,
        data: &mut HandShakeData,
        channel: &ChannelData
    ) -> Status;

    /// Read and reassemble one inbound message.
    ///
    /// Returns [in_progress](Status::in_progress) while the message
    /// is partial, [done](Status::done) when `incoming` holds a full
    /// frame, or an error to fault the stream.
    fn get_message(
        &self,
        incoming: &mut Message,
        socket: &Socket
    ) -> Status;

    /// Check whether `idle` exceeds the protocol's idle time-to-live.
    fn is_stream_ttl_elapsed(
        &self,
        idle: Duration,
        channel: &ChannelData
    ) -> bool;

    /// Notification that `stream_num` has been disconnected.
    fn disconnect(
        &self,
        channel: &ChannelData,
        stream_num: u16
    );
}
