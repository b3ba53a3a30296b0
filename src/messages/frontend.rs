//! Outbound framing: frontend message codes, the untagged pre-startup
//! requests, and the length back-patching frame writer.

use bytes::{BufMut, BytesMut};

/// The 8-byte SSLRequest sent before startup to ask for a TLS upgrade.
pub const SSL_REQUEST: &[u8] = &[
    0x00, 0x00, 0x00, 0x08, // length: 8
    0x04, 0xD2, 0x16, 0x2F, // code: 80877103
];

/// Opcode of the CancelRequest pseudo-message.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// The Terminate message. Written directly to the stream rather than through
/// the shared write buffer: it may race with a reader that still owns the
/// buffer.
pub const TERMINATE_MESSAGE: &[u8] = &[b'X', 0, 0, 0, 4];

/// Identifies one kind of frontend message: a single ASCII byte, followed on
/// the wire by a big-endian u32 length (which counts itself) and the payload.
/// The pre-startup requests are the exception, carrying no tag at all.
///
/// The full tag set is listed in
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const BIND: Self = Self(b'B');
    pub const CLOSE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const DESCRIBE: Self = Self(b'D');
    pub const EXECUTE: Self = Self(b'E');
    pub const FLUSH: Self = Self(b'H');
    pub const PARSE: Self = Self(b'P');
    pub const PASSWORD_MESSAGE: Self = Self(b'p');
    pub const QUERY: Self = Self(b'Q');
    pub const SASL_INITIAL_RESPONSE: Self = Self(b'p');
    pub const SASL_RESPONSE: Self = Self(b'p');
    pub const SYNC: Self = Self(b'S');
    pub const TERMINATE: Self = Self(b'X');

    #[inline]
    pub fn frame(self, buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(self.0);
        frame(buf, payload_fn);
    }
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl PartialEq<u8> for MessageCode {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl PartialEq<MessageCode> for u8 {
    fn eq(&self, other: &MessageCode) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::BIND => "Bind",
            MessageCode::CLOSE => "Close",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::DESCRIBE => "Describe",
            MessageCode::EXECUTE => "Execute",
            MessageCode::FLUSH => "Flush",
            MessageCode::PARSE => "Parse",
            #[allow(unreachable_patterns, reason = "messages all use the same char")]
            MessageCode::PASSWORD_MESSAGE
            | MessageCode::SASL_INITIAL_RESPONSE
            | MessageCode::SASL_RESPONSE => "PasswordMessage|SASLResponse",
            MessageCode::QUERY => "Query",
            MessageCode::SYNC => "Sync",
            MessageCode::TERMINATE => "Terminate",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// Frames a payload with its big-endian length, counting the 4 length bytes
/// themselves. The length field is back-patched after the payload closure
/// runs, so composite payloads never pre-compute their size.
#[inline]
pub fn frame(buf: &mut BytesMut, payload_fn: impl FnOnce(&mut BytesMut)) {
    let base = buf.len();
    buf.put_u32(0);

    payload_fn(buf);

    let len = (buf.len() - base) as u32;
    buf[base..base + size_of::<u32>()].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub(crate) fn put_cstring(b: &mut impl BufMut, src: &[u8]) {
    b.put_slice(src);
    b.put_u8(0);
}
