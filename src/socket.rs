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

//! Non-blocking sockets behind a raw-endpoint seam.
//!
//! A [Socket] pairs a connection status with an optional [Link], the
//! raw non-blocking endpoint.  Production links are `mio` TCP streams
//! obtained from a [Connector]; scripted links stand in for them in
//! tests.  The socket is internally synchronized so that the stream
//! state machine can touch it without holding its own mutex across
//! raw I/O.
//!
//! Connect completion is asynchronous: [Socket::begin_connect] starts
//! a non-blocking connect, and the owner learns the outcome from the
//! first write-readiness event by querying [Socket::connect_error]
//! (`SO_ERROR` on the underlying descriptor).
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::sync::Mutex;

use mio::event::Source;
use mio::net::TcpStream;

/// Low-level status of a [Socket].
///
/// This reports raw connect completion only; handshake progress is
/// tracked separately by the stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketStatus {
    /// No endpoint is attached.
    Disconnected,
    /// A non-blocking connect is in flight.
    Connecting,
    /// The endpoint is connected.
    Connected
}

/// Raw non-blocking endpoint.
///
/// This is the seam between the socket bookkeeping and the actual
/// descriptor.  All calls must be non-blocking; reads and writes
/// report `WouldBlock` instead of waiting.
pub trait Link: Send {
    /// Read into `buf`, returning the number of bytes read.
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error>;

    /// Write from `buf`, returning the number of bytes written.
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error>;

    /// Get the outcome of an asynchronous connect.
    ///
    /// Returns `Ok(None)` if the connect succeeded, `Ok(Some(err))`
    /// if it failed with a socket-level error, and `Err` if the
    /// status could not be queried at all.
    fn connect_error(&mut self) -> Result<Option<Error>, Error>;

    /// Shut the endpoint down.  Errors are ignored; the link is
    /// discarded afterwards either way.
    fn shutdown(&mut self);

    /// Get the remote address.
    fn peer_addr(&self) -> Result<SocketAddr, Error>;

    /// Get the local address.
    fn local_addr(&self) -> Result<SocketAddr, Error>;

    /// Get the endpoint as a poller registration source, if it is
    /// backed by a real descriptor.
    fn source(&mut self) -> Option<&mut dyn Source> {
        None
    }
}

impl Link for TcpStream {
    #[inline]
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        Read::read(self, buf)
    }

    #[inline]
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        Write::write(self, buf)
    }

    #[inline]
    fn connect_error(&mut self) -> Result<Option<Error>, Error> {
        self.take_error()
    }

    #[inline]
    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr, Error> {
        TcpStream::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr, Error> {
        TcpStream::local_addr(self)
    }

    #[inline]
    fn source(&mut self) -> Option<&mut dyn Source> {
        Some(self)
    }
}

/// Trait for objects that open raw endpoints.
///
/// Streams use a connector to (re)open their links on every connect
/// attempt; tests supply connectors that hand out scripted links.
pub trait Connector: Send + Sync {
    /// Start a non-blocking connect to `addr`.
    fn open(
        &self,
        addr: SocketAddr
    ) -> Result<Box<dyn Link>, Error>;
}

/// [Connector] producing non-blocking TCP links.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    #[inline]
    fn open(
        &self,
        addr: SocketAddr
    ) -> Result<Box<dyn Link>, Error> {
        let stream = TcpStream::connect(addr)?;

        Ok(Box::new(stream))
    }
}

struct SocketInner {
    /// Raw connect status.
    status: SocketStatus,
    /// The raw endpoint, present unless disconnected.
    link: Option<Box<dyn Link>>
}

/// Internally synchronized connected endpoint.
pub struct Socket {
    inner: Mutex<SocketInner>
}

impl Socket {
    /// Create a disconnected socket.
    #[inline]
    pub fn new() -> Self {
        Socket {
            inner: Mutex::new(SocketInner {
                status: SocketStatus::Disconnected,
                link: None
            })
        }
    }

    /// Drop any attached link and reset to [SocketStatus::Disconnected].
    pub fn initialize(&self) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(link) = &mut inner.link {
            link.shutdown()
        }

        inner.link = None;
        inner.status = SocketStatus::Disconnected
    }

    /// Start a non-blocking connect through `connector`.
    ///
    /// On success the socket is [SocketStatus::Connecting]; the
    /// outcome arrives with the first write-readiness event.
    pub fn begin_connect(
        &self,
        connector: &dyn Connector,
        addr: SocketAddr
    ) -> Result<(), Error> {
        let link = connector.open(addr)?;
        let mut inner = self.inner.lock().unwrap();

        inner.link = Some(link);
        inner.status = SocketStatus::Connecting;

        Ok(())
    }

    /// Adopt an already-opened link with the given status.
    pub fn attach(
        &self,
        link: Box<dyn Link>,
        status: SocketStatus
    ) {
        let mut inner = self.inner.lock().unwrap();

        inner.link = Some(link);
        inner.status = status
    }

    /// Shut down and drop the link.
    pub fn close(&self) {
        self.initialize()
    }

    /// Get the raw connect status.
    #[inline]
    pub fn status(&self) -> SocketStatus {
        self.inner.lock().unwrap().status
    }

    /// Set the raw connect status.
    #[inline]
    pub fn set_status(
        &self,
        status: SocketStatus
    ) {
        self.inner.lock().unwrap().status = status
    }

    /// Query the outcome of an asynchronous connect.
    pub fn connect_error(&self) -> Result<Option<Error>, Error> {
        let mut inner = self.inner.lock().unwrap();

        match &mut inner.link {
            Some(link) => link.connect_error(),
            None => Err(Error::from(ErrorKind::NotConnected))
        }
    }

    /// Read into `buf` from the link.
    pub fn read(
        &self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        let mut inner = self.inner.lock().unwrap();

        match &mut inner.link {
            Some(link) => link.read(buf),
            None => Err(Error::from(ErrorKind::NotConnected))
        }
    }

    /// Write from `buf` to the link.
    pub fn write(
        &self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        let mut inner = self.inner.lock().unwrap();

        match &mut inner.link {
            Some(link) => link.write(buf),
            None => Err(Error::from(ErrorKind::NotConnected))
        }
    }

    /// Get the remote address of the link.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        let inner = self.inner.lock().unwrap();

        match &inner.link {
            Some(link) => link.peer_addr(),
            None => Err(Error::from(ErrorKind::NotConnected))
        }
    }

    /// Get the local address of the link.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let inner = self.inner.lock().unwrap();

        match &inner.link {
            Some(link) => link.local_addr(),
            None => Err(Error::from(ErrorKind::NotConnected))
        }
    }

    /// Run `func` on the link as a poller registration source.
    ///
    /// Returns `None` if no link is attached, or if the link is not
    /// backed by a real descriptor.
    pub fn with_source<T>(
        &self,
        func: impl FnOnce(&mut dyn Source) -> T
    ) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();

        match &mut inner.link {
            Some(link) => link.source().map(func),
            None => None
        }
    }
}

impl Default for Socket {
    #[inline]
    fn default() -> Self {
        Socket::new()
    }
}

#[cfg(test)]
use crate::harness::ScriptedLink;
#[cfg(test)]
use crate::harness::WriteOp;

#[test]
fn test_socket_starts_disconnected() {
    let socket = Socket::new();

    assert_eq!(socket.status(), SocketStatus::Disconnected);
    assert!(socket.write(&[0]).is_err());
    assert!(socket.read(&mut [0]).is_err());
}

#[test]
fn test_attach_and_close() {
    let socket = Socket::new();
    let link = ScriptedLink::new(vec![WriteOp::Accept(4)], vec![]);

    socket.attach(Box::new(link), SocketStatus::Connected);

    assert_eq!(socket.status(), SocketStatus::Connected);
    assert_eq!(socket.write(&[1, 2, 3, 4]).unwrap(), 4);

    socket.close();

    assert_eq!(socket.status(), SocketStatus::Disconnected);
    assert!(socket.write(&[0]).is_err());
}

#[test]
fn test_write_passes_through_partial_results() {
    let socket = Socket::new();
    let link = ScriptedLink::new(
        vec![WriteOp::Accept(1500), WriteOp::WouldBlock],
        vec![]
    );

    socket.attach(Box::new(link), SocketStatus::Connected);

    let buf = vec![0xab; 4096];

    assert_eq!(socket.write(&buf).unwrap(), 1500);

    let err = socket.write(&buf[1500..]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::WouldBlock);
}
