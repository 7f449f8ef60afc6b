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

//! Message buffers with partial-I/O cursors.
//!
//! A [Message] is a contiguous byte buffer of known size with a
//! movable cursor.  The cursor records how much of the buffer has
//! been transmitted or received so far, so that a send or a receive
//! interrupted by `EAGAIN` can resume exactly where it stopped.  The
//! invariant `cursor == size` holds exactly when the message has been
//! fully transmitted or assembled.

/// A byte buffer with a movable cursor for partial I/O.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {
    buffer: Vec<u8>,
    cursor: usize
}

impl Message {
    /// Create an empty message.
    #[inline]
    pub fn new() -> Self {
        Message {
            buffer: Vec::new(),
            cursor: 0
        }
    }

    /// Create a zero-filled message of `size` bytes.
    #[inline]
    pub fn with_size(size: usize) -> Self {
        Message {
            buffer: vec![0; size],
            cursor: 0
        }
    }

    /// Create a message from existing bytes, cursor at the start.
    #[inline]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Message {
            buffer: bytes,
            cursor: 0
        }
    }

    /// Get the total size of the buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Get the current cursor position.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Check whether the cursor has reached the end of the buffer.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.cursor == self.buffer.len()
    }

    /// Set the cursor to an absolute position, clamped to the size.
    #[inline]
    pub fn set_cursor(
        &mut self,
        cursor: usize
    ) {
        debug_assert!(cursor <= self.buffer.len());

        self.cursor = cursor.min(self.buffer.len())
    }

    /// Advance the cursor by `nbytes`, clamped to the size.
    #[inline]
    pub fn advance_cursor(
        &mut self,
        nbytes: usize
    ) {
        debug_assert!(self.cursor + nbytes <= self.buffer.len());

        self.cursor = (self.cursor + nbytes).min(self.buffer.len())
    }

    /// Get the bytes from the cursor to the end of the buffer.
    ///
    /// This is the portion still to be written for an outbound
    /// message.
    #[inline]
    pub fn from_cursor(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    /// Get the bytes from the cursor to the end, mutably.
    ///
    /// This is the portion still to be filled for an inbound message
    /// under assembly.
    #[inline]
    pub fn from_cursor_mut(&mut self) -> &mut [u8] {
        let cursor = self.cursor;

        &mut self.buffer[cursor..]
    }

    /// Get the whole buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Resize the buffer, zero-filling any growth.
    ///
    /// Transports use this when the frame header reveals the size of
    /// the body still to be read.  The cursor is clamped if the
    /// buffer shrinks.
    #[inline]
    pub fn resize(
        &mut self,
        size: usize
    ) {
        self.buffer.resize(size, 0);
        self.cursor = self.cursor.min(size)
    }

    /// Deconstruct this into the underlying bytes.
    #[inline]
    pub fn take(self) -> Vec<u8> {
        self.buffer
    }
}

#[test]
fn test_cursor_tracks_partial_progress() {
    let mut msg = Message::with_size(4096);

    assert_eq!(msg.cursor(), 0);
    assert_eq!(msg.from_cursor().len(), 4096);

    msg.advance_cursor(1500);

    assert_eq!(msg.cursor(), 1500);
    assert_eq!(msg.from_cursor().len(), 2596);
    assert!(!msg.is_complete());

    msg.advance_cursor(2596);

    assert!(msg.is_complete());
    assert_eq!(msg.from_cursor().len(), 0);
}

#[test]
fn test_set_cursor_rewinds() {
    let mut msg = Message::from_bytes(vec![1, 2, 3, 4]);

    msg.advance_cursor(3);
    msg.set_cursor(0);

    assert_eq!(msg.cursor(), 0);
    assert_eq!(msg.from_cursor(), &[1, 2, 3, 4]);
}

#[test]
fn test_resize_for_reassembly() {
    let mut msg = Message::with_size(8);

    msg.advance_cursor(8);
    msg.resize(24);

    assert_eq!(msg.size(), 24);
    assert_eq!(msg.cursor(), 8);
    assert_eq!(msg.from_cursor_mut().len(), 16);
}

#[test]
fn test_empty_message_is_complete() {
    let msg = Message::new();

    assert!(msg.is_complete());
    assert_eq!(msg.size(), 0);
}
