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

//! Client-side post-master core for the kXR remote-data protocol.
//!
//! This crate implements the transport heart of a kXR client: the
//! per-connection [Stream](crate::stream::Stream) state machine and
//! the session-level machinery around it.
//!
//! # Streams and Channels
//!
//! A [Channel](crate::channel::Channel) is one logical session with a
//! server.  It owns one or more streams, each a single physical
//! connection driven by an external poller: readiness events move
//! messages between the stream's outbound queues and its non-blocking
//! socket, with partial progress recorded in per-message cursors.
//! Connection establishment, the transport-specific handshake,
//! reconnection with a bounded retry budget, and idle timeouts are
//! all handled inside the stream; producers simply enqueue messages
//! with a completion handler and an expiration.
//!
//! The byte-level protocol lives behind the
//! [Transport](crate::transport::Transport) seam.  The stream never
//! parses frames itself; it drives the transport's handshake step by
//! step and defers all inbound framing to it.
//!
//! # Multi-stream operation
//!
//! Once a session is logged in, the [mstream](crate::mstream) module
//! can open additional physical streams and join them to the session
//! with an in-band `bind` exchange carrying the session's 16-byte
//! token.  Large reads are then split into chunks and distributed
//! round-robin over the connected streams.
//!
//! # Collaborators
//!
//! The poller, the task manager, and the transport are consumed
//! through traits ([Poller](crate::poller::Poller),
//! [TaskManager](crate::task::TaskManager),
//! [Transport](crate::transport::Transport)); this crate ships the
//! concrete sockets, messages, streams, and session glue.

pub mod channel;
pub mod config;
pub mod error;
pub mod inqueue;
pub mod message;
pub mod mstream;
pub mod poller;
pub mod proto;
pub mod socket;
pub mod stream;
pub mod task;
pub mod transport;

#[cfg(test)]
pub(crate) mod harness;
