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

//! Socket readiness notification interface.
//!
//! The poller is an external collaborator: it owns the reactor
//! thread(s), watches registered sockets, and calls back into the
//! registered [SocketEventListener] with readiness and timeout
//! events.  Event delivery is serialized per socket.
//!
//! All control calls return `bool`; `false` means the poller itself
//! failed, which the stream machinery treats as fatal.
use std::sync::Arc;

use crate::socket::Socket;

/// Events delivered by a poller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketEvent {
    /// The socket has bytes to read.
    ReadyToRead,
    /// No read readiness arrived within the notification resolution.
    ReadTimeOut,
    /// The socket can accept writes.
    ReadyToWrite,
    /// No write readiness arrived within the notification resolution.
    WriteTimeOut
}

/// Trait for objects receiving socket events.
pub trait SocketEventListener: Send + Sync {
    /// Handle a readiness or timeout event on `socket`.
    fn event(
        &self,
        kind: SocketEvent,
        socket: &Arc<Socket>
    );
}

/// Trait for socket readiness notifiers.
pub trait Poller: Send + Sync {
    /// Register `socket`, delivering its events to `listener`.
    fn add_socket(
        &self,
        socket: &Arc<Socket>,
        listener: Arc<dyn SocketEventListener>
    ) -> bool;

    /// Remove `socket` from the poller.
    fn remove_socket(
        &self,
        socket: &Arc<Socket>
    ) -> bool;

    /// Enable or disable read notifications for `socket`.
    ///
    /// The `resolution` is the timeout granularity in seconds; a
    /// [SocketEvent::ReadTimeOut] is delivered when no readiness
    /// arrives within it.
    fn enable_read_notification(
        &self,
        socket: &Arc<Socket>,
        enable: bool,
        resolution: u16
    ) -> bool;

    /// Enable or disable write notifications for `socket`.
    fn enable_write_notification(
        &self,
        socket: &Arc<Socket>,
        enable: bool,
        resolution: u16
    ) -> bool;
}
