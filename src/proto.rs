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

//! kXR wire structures for session binding.
//!
//! The stream machinery stays out of the framing business, with one
//! exception: the in-band `bind` exchange that joins an auxiliary
//! stream to an existing session.  The structures here are bit-exact
//! renditions of that exchange.  All multi-byte fields are big-endian
//! on the wire.
use crate::message::Message;

/// Request id of the session-bind request.
pub const KXR_BIND: u16 = 3009;

/// Response status: the request succeeded.
pub const KXR_OK: u16 = 0;

/// Response status: the request failed.
pub const KXR_ERROR: u16 = 4003;

/// Size of a client request header on the wire.
pub const REQUEST_HEADER_SIZE: usize = 24;

/// Size of a server response header on the wire.
pub const RESPONSE_HEADER_SIZE: usize = 8;

/// A session-bind request.
///
/// The wire layout is the fixed 24-byte request header: a 2-byte
/// stream id (opaque to the multi-stream machinery), the 2-byte
/// request id [KXR_BIND], the 16-byte session id copied verbatim from
/// the primary login, and a zero data length.  There is no payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindRequest {
    /// Stream id for matching the response.
    pub stream_id: [u8; 2],
    /// Session id obtained at primary-stream login.
    pub sess_id: [u8; 16]
}

impl BindRequest {
    /// Encode this request into its 24-byte wire form.
    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0; REQUEST_HEADER_SIZE];

        buf[0..2].copy_from_slice(&self.stream_id);
        buf[2..4].copy_from_slice(&KXR_BIND.to_be_bytes());
        buf[4..20].copy_from_slice(&self.sess_id);
        // bytes 20..24 are the data length, always zero for bind

        buf
    }

    /// Encode this request into a fresh [Message].
    #[inline]
    pub fn to_message(&self) -> Message {
        Message::from_bytes(self.to_bytes().to_vec())
    }

    /// Decode a request from its wire form.
    ///
    /// Returns `None` if `buf` is too short or is not a bind request.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return None;
        }

        let reqid = u16::from_be_bytes([buf[2], buf[3]]);

        if reqid != KXR_BIND {
            return None;
        }

        let mut stream_id = [0; 2];
        let mut sess_id = [0; 16];

        stream_id.copy_from_slice(&buf[0..2]);
        sess_id.copy_from_slice(&buf[4..20]);

        Some(BindRequest {
            stream_id: stream_id,
            sess_id: sess_id
        })
    }
}

/// The common server response header.
///
/// Eight bytes on the wire: a 2-byte stream id echoing the request, a
/// 2-byte status, and the 4-byte length of the body that follows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResponseHeader {
    /// Stream id echoed from the request.
    pub stream_id: [u8; 2],
    /// Response status ([KXR_OK] on success).
    pub status: u16,
    /// Length of the response body.
    pub dlen: u32
}

impl ResponseHeader {
    /// Encode this header into its 8-byte wire form.
    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = [0; RESPONSE_HEADER_SIZE];

        buf[0..2].copy_from_slice(&self.stream_id);
        buf[2..4].copy_from_slice(&self.status.to_be_bytes());
        buf[4..8].copy_from_slice(&self.dlen.to_be_bytes());

        buf
    }

    /// Decode a header from the front of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return None;
        }

        let mut stream_id = [0; 2];

        stream_id.copy_from_slice(&buf[0..2]);

        Some(ResponseHeader {
            stream_id: stream_id,
            status: u16::from_be_bytes([buf[2], buf[3]]),
            dlen: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]])
        })
    }
}

/// Body of a successful bind response: the permanent substream id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BindResponseBody {
    /// Substream id assigned by the server.
    pub substream_id: u8
}

impl BindResponseBody {
    /// Decode the body following a response header.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        match buf.first() {
            Some(id) => Some(BindResponseBody { substream_id: *id }),
            None => None
        }
    }
}

#[test]
fn test_bind_request_wire_form() {
    let sess_id = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
        0x0c, 0x0d, 0x0e, 0x0f, 0x10
    ];
    let request = BindRequest {
        stream_id: [0xbe, 0xef],
        sess_id: sess_id
    };
    let bytes = request.to_bytes();

    assert_eq!(bytes.len(), 24);
    assert_eq!(&bytes[0..2], &[0xbe, 0xef]);
    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), KXR_BIND);
    assert_eq!(&bytes[4..20], &sess_id);
    assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
}

#[test]
fn test_bind_request_round_trip() {
    let request = BindRequest {
        stream_id: [0x00, 0x07],
        sess_id: [0x5a; 16]
    };
    let decoded = BindRequest::from_bytes(&request.to_bytes()).unwrap();

    assert_eq!(decoded, request);
}

#[test]
fn test_bind_request_rejects_other_requests() {
    let mut bytes = BindRequest {
        stream_id: [0, 1],
        sess_id: [0; 16]
    }
    .to_bytes();

    bytes[2..4].copy_from_slice(&3000u16.to_be_bytes());

    assert!(BindRequest::from_bytes(&bytes).is_none());
    assert!(BindRequest::from_bytes(&bytes[..10]).is_none());
}

#[test]
fn test_response_header_round_trip() {
    let header = ResponseHeader {
        stream_id: [0x12, 0x34],
        status: KXR_OK,
        dlen: 1
    };
    let bytes = header.to_bytes();

    assert_eq!(&bytes[0..2], &[0x12, 0x34]);
    assert_eq!(&bytes[2..4], &[0x00, 0x00]);
    assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x01]);
    assert_eq!(ResponseHeader::from_bytes(&bytes).unwrap(), header);
}

#[test]
fn test_bind_response_body() {
    assert_eq!(
        BindResponseBody::from_bytes(&[3]).unwrap(),
        BindResponseBody { substream_id: 3 }
    );
    assert!(BindResponseBody::from_bytes(&[]).is_none());
}
