//! The outbound write buffer.
//!
//! Messages are accumulated here and flushed to the stream in one write, so
//! a Parse/Describe/Sync or Bind/Execute/Sync unit reaches the server as a
//! single syscall.

use bytes::{BufMut, BytesMut};

use crate::messages::frontend;

/// A growable buffer of outbound protocol messages.
///
/// Message and parameter lengths are back-patched when the enclosing scope is
/// finished, so encoders can stream variable-width payloads without
/// pre-computing their size. [`reset`][WriteBuffer::reset] unwinds the
/// current message, which keeps the connection usable after a failed encode:
/// no partial bytes ever reach the stream.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: BytesMut,
    /// Offset of the current message's first byte (its tag, or its length
    /// field for the untagged pre-startup requests).
    msg_start: usize,
    /// Offset of the current message's length field.
    len_at: usize,
    /// Offset of the current parameter's length field.
    param_at: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a message. A code of `0` writes no tag byte (startup, SSL and
    /// cancel requests are untagged).
    pub fn start_message(&mut self, code: impl Into<u8>) {
        self.msg_start = self.buf.len();
        let code = code.into();
        if code != 0 {
            self.buf.put_u8(code);
        }
        self.len_at = self.buf.len();
        self.buf.put_u32(0);
    }

    /// Back-patches the length of the message opened by the last
    /// [`start_message`][WriteBuffer::start_message].
    pub fn finish_message(&mut self) {
        let len = (self.buf.len() - self.len_at) as u32;
        self.buf[self.len_at..self.len_at + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Discards everything written since the last
    /// [`start_message`][WriteBuffer::start_message], including the tag.
    pub fn reset(&mut self) {
        self.buf.truncate(self.msg_start);
    }

    /// Begins a length-prefixed Bind parameter.
    pub fn start_param(&mut self) {
        self.param_at = self.buf.len();
        self.buf.put_u32(0);
    }

    /// Back-patches the length of the current parameter. The prefix counts
    /// the value bytes only, not itself.
    pub fn finish_param(&mut self) {
        let len = (self.buf.len() - self.param_at - 4) as u32;
        self.buf[self.param_at..self.param_at + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Replaces the current parameter with the SQL NULL marker (length -1,
    /// no value bytes).
    pub fn finish_null_param(&mut self) {
        self.buf.truncate(self.param_at);
        self.buf.put_i32(-1);
    }

    /// Writes a whole tagged message through a payload closure. Preferred
    /// for fixed-layout messages.
    pub fn message(&mut self, code: frontend::MessageCode, payload_fn: impl FnOnce(&mut BytesMut)) {
        self.msg_start = self.buf.len();
        code.frame(&mut self.buf, payload_fn);
    }

    pub fn write_byte(&mut self, b: u8) {
        self.buf.put_u8(b);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_raw(&mut self, src: &[u8]) {
        self.buf.put_slice(src);
    }

    /// Writes bytes followed by a NUL terminator.
    pub fn write_cstring(&mut self, src: &[u8]) {
        frontend::put_cstring(&mut self.buf, src);
    }

    /// Direct access to the underlying bytes, for encoders that append into
    /// the open message.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
